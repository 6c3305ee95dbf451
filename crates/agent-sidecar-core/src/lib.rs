//! Core abstractions for the agent sidecar.
//!
//! This crate provides the fundamental building blocks:
//! - `Event` - Normalized unit of execution progress
//! - `EventParser` - Output line to event conversion
//! - `Relay` - Per-session mailboxes with keepalive and stale sweep
//! - `ActiveSessions` - Registry of in-flight executions
//! - `Executor` trait and the `EventStream` it returns

pub mod active;
pub mod event;
pub mod parser;
pub mod relay;
pub mod request;
pub mod traits;

pub use active::{ActiveEntry, ActiveSessions};
pub use event::{Event, EventKind};
pub use parser::{EventParser, StreamTag};
pub use relay::{Relay, RelayConfig, RelayItem, Subscription};
pub use request::ExecuteRequest;
pub use traits::{EventStream, ExecuteError, Executor, SessionId};
