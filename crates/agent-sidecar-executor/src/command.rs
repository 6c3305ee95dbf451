//! Command building utilities for the agent binary.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Arguments asking the binary for its version.
pub const VERSION_ARGS: [&str; 1] = ["version"];

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for the agent command line.
///
/// The base may carry a prefix such as `uvx cagent`; it is split with
/// shell quoting rules before parameters are appended.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base executable command.
    pub base: String,
    /// Optional parameters to append.
    pub params: Option<Vec<String>>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: None,
        }
    }

    /// Add parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    /// Extend parameters.
    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let extra: Vec<String> = more.into_iter().map(Into::into).collect();
        match &mut self.params {
            Some(p) => p.extend(extra),
            None => self.params = Some(extra),
        }
        self
    }

    /// Build the command.
    ///
    /// # Errors
    /// Returns error if the base cannot be split or is empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        if let Some(ref params) = self.params {
            parts.extend(params.iter().cloned());
        }

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

/// Arguments for one execution: `exec <config> --agent <id> --json -`.
#[must_use]
pub fn exec_args(config: &Path, agent_id: &str) -> Vec<String> {
    vec![
        "exec".to_owned(),
        config.to_string_lossy().into_owned(),
        "--agent".to_owned(),
        agent_id.to_owned(),
        "--json".to_owned(),
        "-".to_owned(),
    ]
}

/// Resolve an executable by name.
///
/// Explicit paths (absolute or containing a separator) are taken as-is when
/// they name a file; bare names go through `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_owned();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_prefixed_base() {
        let parts = CommandBuilder::new("uvx 'c agent'")
            .params(["version"])
            .build()
            .unwrap();
        assert_eq!(parts.program, "uvx");
        assert_eq!(parts.args, ["c agent", "version"]);
    }

    #[test]
    fn empty_base_is_rejected() {
        assert!(matches!(
            CommandBuilder::new("   ").build(),
            Err(CommandBuildError::EmptyCommand)
        ));
        assert!(matches!(
            CommandBuilder::new("cagent 'unterminated").build(),
            Err(CommandBuildError::InvalidBase(_))
        ));
    }

    #[test]
    fn extend_appends() {
        let parts = CommandBuilder::new("cagent")
            .params(["a"])
            .extend_params(["b", "c"])
            .build()
            .unwrap();
        assert_eq!(parts.args, ["a", "b", "c"]);
    }

    #[test]
    fn exec_argument_shape() {
        let args = exec_args(Path::new("/etc/team.yaml"), "orchestrator");
        assert_eq!(
            args,
            ["exec", "/etc/team.yaml", "--agent", "orchestrator", "--json", "-"]
        );
    }

    #[tokio::test]
    async fn resolves_shell_from_path() {
        assert!(resolve_executable_path("sh").await.is_some());
        assert!(resolve_executable_path("/definitely/not/here").await.is_none());
        assert!(resolve_executable_path("").await.is_none());
    }
}
