//! Execution request for a single agent run.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wall-clock budget applied when the caller does not pick one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// What to run and with which input.
///
/// The free-form `context` map is forwarded to the agent untouched, so apps
/// can attach whatever metadata they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Agent to run, as named in the team configuration.
    pub agent_id: String,

    /// User prompt.
    pub input: String,

    /// Arbitrary context forwarded alongside the input.
    #[serde(default)]
    pub context: Map<String, Value>,

    /// Aggregate wall-clock limit for the whole execution.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

const fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl ExecuteRequest {
    /// Create a request with an empty context and the default timeout.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            input: input.into(),
            context: Map::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Replace the context map.
    #[must_use]
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Override the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get a context value by key.
    #[must_use]
    pub fn get_context(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Set a context value.
    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
    }

    /// The JSON document written to the agent's stdin.
    #[must_use]
    pub fn stdin_payload(&self) -> Value {
        serde_json::json!({
            "input": self.input,
            "context": self.context,
        })
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_payload_shape() {
        let mut request = ExecuteRequest::new("orchestrator", "hello \"world\"");
        request.set_context("user", Value::from("sam"));

        let payload = request.stdin_payload();
        assert_eq!(payload["input"], "hello \"world\"");
        assert_eq!(payload["context"]["user"], "sam");
    }

    #[test]
    fn empty_context_is_an_object() {
        let payload = ExecuteRequest::new("a", "").stdin_payload();
        assert!(payload["context"].as_object().unwrap().is_empty());
    }

    #[test]
    fn timeout_defaults_when_missing() {
        let request: ExecuteRequest =
            serde_json::from_str(r#"{"agent_id": "a", "input": "q"}"#).unwrap();
        assert_eq!(request.timeout, DEFAULT_TIMEOUT);

        let request: ExecuteRequest =
            serde_json::from_str(r#"{"agent_id": "a", "input": "q", "timeout": 0.5}"#).unwrap();
        assert_eq!(request.timeout, Duration::from_millis(500));
    }
}
