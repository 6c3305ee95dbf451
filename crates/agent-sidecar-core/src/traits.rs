//! Core traits and handles shared by executors and their consumers.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{ActiveSessions, Event, ExecuteRequest};

/// Session identifier.
pub type SessionId = Uuid;

/// Errors raised before an execution starts.
///
/// Anything that goes wrong after the stream is handed out is reported as an
/// `Error` event on the stream instead.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("Runtime is shutting down")]
    ShuttingDown,
    #[error("Execution could not be scheduled: {0}")]
    Unavailable(String),
}

/// Lazily pulled sequence of events for one execution.
///
/// The producing side runs in the background and blocks on a bounded
/// channel, so output is read only as fast as the consumer pulls. Dropping
/// the stream tells the producer to tear the execution down.
pub struct EventStream {
    session_id: SessionId,
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Wrap the receiving half of a producer channel.
    #[must_use]
    pub const fn new(session_id: SessionId, rx: mpsc::Receiver<Event>) -> Self {
        Self { session_id, rx }
    }

    /// Channel pair sized for lockstep delivery.
    #[must_use]
    pub fn channel(session_id: SessionId) -> (mpsc::Sender<Event>, Self) {
        let (tx, rx) = mpsc::channel(1);
        (tx, Self::new(session_id, rx))
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Pull the next event.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Trait for agent executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Start an execution and return its event stream.
    ///
    /// # Errors
    /// Returns error if the executor refuses new work.
    fn execute(&self, request: ExecuteRequest) -> Result<EventStream, ExecuteError>;

    /// Sessions currently running under this executor.
    fn active_sessions(&self) -> ActiveSessions;

    /// Stop accepting work and terminate everything still running.
    async fn shutdown(&self);
}
