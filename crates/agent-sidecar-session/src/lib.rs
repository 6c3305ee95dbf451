//! Session orchestration for the agent sidecar.
//!
//! Provides:
//! - `SessionManager` - Start executions and relay their events to consumers

pub mod manager;

pub use manager::{ManagerError, SessionManager};
