//! Supervisor configuration.

use std::{path::PathBuf, time::Duration};

use agent_sidecar_core::request::DEFAULT_TIMEOUT;

/// Environment variable naming the agent binary.
pub const ENV_BINARY: &str = "CAGENT_BIN";
/// Environment variable naming the team configuration file.
pub const ENV_TEAM_CONFIG: &str = "CAGENT_TEAM_CONFIG";
/// Environment variable overriding the default execution timeout, in seconds.
pub const ENV_TIMEOUT_SECS: &str = "CAGENT_TIMEOUT_SECS";

/// How the supervisor finds and drives the agent binary.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Binary name or command prefix.
    pub binary: String,
    /// Team configuration passed to every execution.
    pub team_config: PathBuf,
    /// Timeout applied by callers that do not choose one.
    pub default_timeout: Duration,
    /// Limit for the `version` probe at construction.
    pub version_timeout: Duration,
    /// Time between graceful and forced termination of a process tree.
    pub kill_grace: Duration,
    /// Decode stdout lines as JSON before pattern matching.
    pub structured_output: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: "cagent".to_owned(),
            team_config: PathBuf::from("team.yaml"),
            default_timeout: DEFAULT_TIMEOUT,
            version_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            structured_output: true,
        }
    }
}

impl SupervisorConfig {
    /// Create a config for a binary and team file, other fields defaulted.
    #[must_use]
    pub fn new(binary: impl Into<String>, team_config: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            team_config: team_config.into(),
            ..Self::default()
        }
    }

    /// Read overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup function.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(binary) = lookup(ENV_BINARY).filter(|v| !v.trim().is_empty()) {
            config.binary = binary;
        }
        if let Some(team) = lookup(ENV_TEAM_CONFIG).filter(|v| !v.trim().is_empty()) {
            config.team_config = PathBuf::from(team);
        }
        match lookup(ENV_TIMEOUT_SECS).map(|v| v.trim().parse::<f64>()) {
            Some(Ok(secs)) if secs > 0.0 && secs.is_finite() => {
                config.default_timeout = Duration::from_secs_f64(secs);
            }
            Some(_) => tracing::warn!("ignoring invalid {ENV_TIMEOUT_SECS}"),
            None => {}
        }
        config
    }

    #[must_use]
    pub const fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    #[must_use]
    pub const fn with_structured_output(mut self, structured: bool) -> Self {
        self.structured_output = structured;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            (ENV_BINARY, "/opt/cagent"),
            (ENV_TEAM_CONFIG, "/srv/team.yaml"),
            (ENV_TIMEOUT_SECS, "12.5"),
        ]
        .into_iter()
        .collect();

        let config = SupervisorConfig::from_lookup(|k| env.get(k).map(ToString::to_string));
        assert_eq!(config.binary, "/opt/cagent");
        assert_eq!(config.team_config, PathBuf::from("/srv/team.yaml"));
        assert_eq!(config.default_timeout, Duration::from_millis(12_500));
    }

    #[test]
    fn bad_timeout_keeps_default() {
        let config = SupervisorConfig::from_lookup(|k| (k == ENV_TIMEOUT_SECS).then(|| "-3".to_owned()));
        assert_eq!(config.default_timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.binary, "cagent");
    }
}
