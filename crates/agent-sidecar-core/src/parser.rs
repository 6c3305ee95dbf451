//! Line-to-event parser for agent process output.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::event::{Event, EventKind};

/// Compile a built-in marker. A pattern that fails to compile is logged
/// and never matches.
fn pattern(source: &str) -> Option<Regex> {
    RegexBuilder::new(source)
        .case_insensitive(true)
        .build()
        .inspect_err(|e| tracing::error!(pattern = source, error = %e, "invalid built-in pattern"))
        .ok()
}

type Marker = LazyLock<Option<Regex>>;

static THINKING: Marker = LazyLock::new(|| pattern(r"\[THINKING\]|Thinking:"));
static TOOL_CALL: Marker = LazyLock::new(|| pattern(r"\[TOOL\]|Calling tool:"));
static TOOL_RESULT: Marker = LazyLock::new(|| pattern(r"\[TOOL RESULT\]|Tool result:"));
static OUTPUT: Marker = LazyLock::new(|| pattern(r"\[OUTPUT\]|Output:"));
static ERROR: Marker = LazyLock::new(|| pattern(r"(error|failed|exception):"));

/// Marker patterns in priority order, with the payload key for each.
fn markers() -> [(&'static Marker, EventKind, &'static str); 4] {
    [
        (&THINKING, EventKind::Thinking, "content"),
        (&TOOL_CALL, EventKind::ToolCall, "content"),
        (&TOOL_RESULT, EventKind::ToolResult, "content"),
        (&OUTPUT, EventKind::Result, "result"),
    ]
}

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    Stdout,
    Stderr,
}

impl StreamTag {
    #[must_use]
    pub const fn is_stderr(self) -> bool {
        matches!(self, Self::Stderr)
    }
}

/// Converts single output lines into [`Event`]s.
///
/// Stateless apart from the structured-mode flag; the only other input is
/// the wall clock used for timestamps.
#[derive(Debug, Clone, Copy)]
pub struct EventParser {
    structured: bool,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new(true)
    }
}

impl EventParser {
    /// Create a parser. In structured mode stdout lines are first tried as JSON.
    #[must_use]
    pub const fn new(structured: bool) -> Self {
        Self { structured }
    }

    #[must_use]
    pub const fn is_structured(&self) -> bool {
        self.structured
    }

    /// Parse one newline-stripped line.
    ///
    /// Returns `None` for blank lines. Stderr lines always become `Error`
    /// events carrying the line verbatim and are never JSON-decoded.
    #[must_use]
    pub fn parse_line(&self, line: &str, is_stderr: bool) -> Option<Event> {
        if line.trim().is_empty() {
            return None;
        }

        if is_stderr {
            return Some(Event::error(line));
        }

        let stripped = line.trim();

        if self.structured {
            match serde_json::from_str::<Value>(stripped) {
                Ok(Value::Object(mut obj)) => {
                    if let Some(result) = obj.remove("result") {
                        return Some(Event::result(result));
                    }
                    if let Some(error) = obj.remove("error") {
                        return Some(Event::with_field(EventKind::Error, "error", error));
                    }
                    return Some(Event::new(EventKind::Info, obj));
                }
                // Arrays and scalars are reported as plain info text.
                Ok(_) => return Some(Event::info(stripped)),
                Err(_) => {}
            }
        }

        Some(Self::match_patterns(stripped))
    }

    /// Parse a line tagged with its source stream.
    #[must_use]
    pub fn parse_tagged(&self, tag: StreamTag, line: &str) -> Option<Event> {
        self.parse_line(line, tag.is_stderr())
    }

    fn match_patterns(stripped: &str) -> Event {
        for (marker, kind, key) in markers() {
            let Some(regex) = &**marker else {
                continue;
            };
            if let Some(found) = regex.find_iter(stripped).last() {
                let rest = stripped[found.end()..].trim();
                let content = if rest.is_empty() { stripped } else { rest };
                return Event::with_field(kind, key, content);
            }
        }

        if (*ERROR).as_ref().is_some_and(|re| re.is_match(stripped)) {
            return Event::error(stripped);
        }

        Event::info(stripped)
    }

    /// Parse two already-collected streams and merge them by timestamp.
    ///
    /// Each stream keeps its own relative order (the sort is stable), but the
    /// interleaving between stdout and stderr is only as good as the parse-time
    /// timestamps: lines parsed in the same instant keep stdout-first order,
    /// which need not match the order the child wrote them in.
    #[must_use]
    pub fn parse_streams<S: AsRef<str>>(&self, stdout: &[S], stderr: &[S]) -> Vec<Event> {
        let mut events: Vec<Event> = stdout
            .iter()
            .filter_map(|line| self.parse_line(line.as_ref(), false))
            .chain(
                stderr
                    .iter()
                    .filter_map(|line| self.parse_line(line.as_ref(), true)),
            )
            .collect();
        events.sort_by_key(Event::timestamp);
        events
    }
}
