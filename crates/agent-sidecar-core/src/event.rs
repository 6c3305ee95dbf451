//! Normalized execution events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The agent is reasoning.
    Thinking,
    /// The agent invoked a tool.
    ToolCall,
    /// A tool returned.
    ToolResult,
    /// Final output. Terminal.
    Result,
    /// Failure. Terminal.
    Error,
    /// Anything else the agent printed.
    Info,
    /// Synthetic idle marker produced by consumers, never by the parser.
    Keepalive,
}

impl EventKind {
    /// Wire name used for SSE event names and the `event_type` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Result => "result",
            Self::Error => "error",
            Self::Info => "info",
            Self::Keepalive => "keepalive",
        }
    }

    /// `Result` and `Error` end an execution.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Result | Self::Error)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of observable execution progress.
///
/// Events are immutable once built. The timestamp records when the line was
/// recognized, not when the child process wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event_type")]
    kind: EventKind,
    #[serde(rename = "data")]
    payload: Map<String, Value>,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, payload: Map<String, Value>) -> Self {
        Self::at(kind, payload, Utc::now())
    }

    /// Create an event with an explicit timestamp.
    #[must_use]
    pub const fn at(kind: EventKind, payload: Map<String, Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            payload,
            timestamp,
        }
    }

    /// Single-field payload helper.
    #[must_use]
    pub fn with_field(kind: EventKind, key: &str, value: impl Into<Value>) -> Self {
        let mut payload = Map::new();
        payload.insert(key.to_owned(), value.into());
        Self::new(kind, payload)
    }

    /// `Error` event with `{error: message}`.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_field(EventKind::Error, "error", message.into())
    }

    /// `Error` event with `{error, error_code}`.
    #[must_use]
    pub fn error_with_code(message: impl Into<String>, code: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("error".to_owned(), Value::String(message.into()));
        payload.insert("error_code".to_owned(), Value::String(code.to_owned()));
        Self::new(EventKind::Error, payload)
    }

    /// `Result` event with `{result: value}`.
    #[must_use]
    pub fn result(value: impl Into<Value>) -> Self {
        Self::with_field(EventKind::Result, "result", value)
    }

    /// `Info` event with `{message: text}`.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::with_field(EventKind::Info, "message", message.into())
    }

    /// Empty `Keepalive` event.
    #[must_use]
    pub fn keepalive() -> Self {
        Self::new(EventKind::Keepalive, Map::new())
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub const fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Look up a payload field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Render as a named server-sent event frame.
    ///
    /// Keepalives carry an empty data object so idle streams stay cheap.
    #[must_use]
    pub fn to_sse_frame(&self) -> String {
        let data = if self.kind == EventKind::Keepalive {
            "{}".to_owned()
        } else {
            serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
        };
        format!("event: {}\ndata: {data}\n\n", self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds() {
        assert!(EventKind::Result.is_terminal());
        assert!(EventKind::Error.is_terminal());
        assert!(!EventKind::Info.is_terminal());
        assert!(!EventKind::Keepalive.is_terminal());
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let event = Event::result("done");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "result");
        assert_eq!(json["data"]["result"], "done");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn sse_frame_is_named() {
        let frame = Event::with_field(EventKind::ToolCall, "content", "search").to_sse_frame();
        assert!(frame.starts_with("event: tool_call\ndata: {"));
        assert!(frame.ends_with("\n\n"));

        assert_eq!(Event::keepalive().to_sse_frame(), "event: keepalive\ndata: {}\n\n");
    }

    #[test]
    fn error_with_code_carries_both_fields() {
        let event = Event::error_with_code("boom", "spawn_failed");
        assert_eq!(event.get("error").unwrap(), "boom");
        assert_eq!(event.get("error_code").unwrap(), "spawn_failed");
    }
}
