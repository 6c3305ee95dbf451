//! Session manager for orchestrating agent executions.
//!
//! The manager decouples producers from consumers: every started execution
//! gets a forwarding task that copies its events into the relay, and
//! consumers attach to the relay by session id whenever they are ready.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use agent_sidecar_core::{
    ExecuteError, ExecuteRequest, Executor, Relay, RelayConfig, SessionId, Subscription,
};
use futures::StreamExt;
use tokio::task::{AbortHandle, JoinHandle};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Executor error: {0}")]
    Executor(#[from] ExecuteError),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
}

/// Marks a relay stream as finished when the forwarder ends, however it ends.
struct FinishGuard {
    relay: Arc<Relay>,
    id: SessionId,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.relay.finish(self.id);
    }
}

/// Session manager for orchestrating agent executions.
pub struct SessionManager<E>
where
    E: Executor + 'static,
{
    executor: Arc<E>,
    relay: Arc<Relay>,
    forwarders: Arc<Mutex<HashMap<SessionId, AbortHandle>>>,
    sweeper: JoinHandle<()>,
}

impl<E> SessionManager<E>
where
    E: Executor + 'static,
{
    /// Create a session manager. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(executor: E) -> Self {
        Self::with_config(executor, RelayConfig::default())
    }

    #[must_use]
    pub fn with_config(executor: E, config: RelayConfig) -> Self {
        let relay = Arc::new(Relay::with_config(executor.active_sessions(), config));
        let sweeper = relay.spawn_sweeper();
        Self {
            executor: Arc::new(executor),
            relay,
            forwarders: Arc::new(Mutex::new(HashMap::new())),
            sweeper,
        }
    }

    #[must_use]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    #[must_use]
    pub const fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Start an execution whose events are relayed under the returned id.
    ///
    /// # Errors
    /// Returns error if the executor refuses the request.
    pub fn start(&self, request: ExecuteRequest) -> Result<SessionId, ManagerError> {
        let mut stream = self.executor.execute(request)?;
        let session_id = stream.session_id();

        let guard = FinishGuard {
            relay: Arc::clone(&self.relay),
            id: session_id,
        };
        let forwarders = Arc::clone(&self.forwarders);

        // Hold the map lock across spawn so the task cannot unregister
        // itself before it has been registered.
        let mut map = self.forwarders.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            let mut forwarded = 0_usize;
            while let Some(event) = stream.next().await {
                guard.relay.push(session_id, event);
                forwarded += 1;
            }
            tracing::debug!(%session_id, forwarded, "execution stream drained");
            forwarders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&session_id);
            drop(guard);
        });
        map.insert(session_id, handle.abort_handle());
        drop(map);

        tracing::info!(%session_id, "session started");
        Ok(session_id)
    }

    /// Attach a consumer to a session's events.
    #[must_use]
    pub fn subscribe(&self, session_id: SessionId) -> Subscription {
        self.relay.subscribe(session_id)
    }

    /// Whether an execution is still producing events for `session_id`.
    #[must_use]
    pub fn is_running(&self, session_id: SessionId) -> bool {
        self.forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&session_id)
    }

    /// Stop forwarding a session. Dropping its event stream makes the
    /// executor tear the execution down.
    ///
    /// # Errors
    /// Returns error if the session is not running.
    pub fn cancel(&self, session_id: SessionId) -> Result<(), ManagerError> {
        let handle = self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
            .ok_or(ManagerError::NotFound(session_id))?;
        handle.abort();
        tracing::info!(%session_id, "session cancelled");
        Ok(())
    }

    /// Shut the executor down and stop the relay sweeper.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        self.sweeper.abort();
    }
}

impl<E> Drop for SessionManager<E>
where
    E: Executor + 'static,
{
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use agent_sidecar_core::{ActiveSessions, Event, EventKind, EventStream, RelayItem};
    use async_trait::async_trait;
    use tokio_test::assert_ok;
    use uuid::Uuid;

    use super::*;

    /// Executor that replays a fixed script of events.
    struct ScriptedExecutor {
        script: Vec<Event>,
        hold_open: bool,
        active: ActiveSessions,
        shut: AtomicBool,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Event>) -> Self {
            Self {
                script,
                hold_open: false,
                active: ActiveSessions::new(),
                shut: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        fn execute(&self, request: ExecuteRequest) -> Result<EventStream, ExecuteError> {
            if self.shut.load(Ordering::SeqCst) {
                return Err(ExecuteError::ShuttingDown);
            }
            let id = Uuid::new_v4();
            self.active.insert(id, request.agent_id);
            let (tx, stream) = EventStream::channel(id);
            let script = self.script.clone();
            let hold_open = self.hold_open;
            let active = self.active.clone();
            tokio::spawn(async move {
                for event in script {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                if hold_open {
                    tx.closed().await;
                }
                active.remove(id);
            });
            Ok(stream)
        }

        fn active_sessions(&self) -> ActiveSessions {
            self.active.clone()
        }

        async fn shutdown(&self) {
            self.shut.store(true, Ordering::SeqCst);
        }
    }

    fn fast() -> RelayConfig {
        RelayConfig {
            keepalive_interval: Duration::from_millis(50),
            ..RelayConfig::default()
        }
    }

    async fn drain(mut sub: Subscription) -> Vec<RelayItem> {
        let mut items = Vec::new();
        while let Some(item) = sub.next().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn late_subscriber_sees_everything() {
        let manager = SessionManager::with_config(
            ScriptedExecutor::new(vec![
                Event::with_field(EventKind::Thinking, "content", "hmm"),
                Event::result("done"),
            ]),
            fast(),
        );
        let id = assert_ok!(manager.start(ExecuteRequest::new("root", "hi")));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let items = drain(manager.subscribe(id)).await;

        let kinds: Vec<EventKind> = items
            .into_iter()
            .filter_map(|i| match i {
                RelayItem::Event(e) => Some(e.kind()),
                RelayItem::Keepalive => None,
            })
            .collect();
        assert_eq!(kinds, vec![EventKind::Thinking, EventKind::Result]);
    }

    #[tokio::test]
    async fn success_without_terminal_event_still_ends() {
        let manager = SessionManager::with_config(
            ScriptedExecutor::new(vec![Event::info("only info")]),
            fast(),
        );
        let id = manager.start(ExecuteRequest::new("root", "hi")).unwrap();
        let sub = manager.subscribe(id);

        let items = tokio::time::timeout(Duration::from_secs(2), drain(sub))
            .await
            .unwrap();
        assert!(items.iter().any(|i| matches!(i, RelayItem::Event(e) if e.kind() == EventKind::Info)));
        assert!(!manager.is_running(id));
    }

    #[tokio::test]
    async fn cancel_drops_the_stream() {
        let mut executor = ScriptedExecutor::new(vec![Event::info("started")]);
        executor.hold_open = true;
        let manager = SessionManager::with_config(executor, fast());
        let id = manager.start(ExecuteRequest::new("root", "hi")).unwrap();
        assert!(manager.is_running(id));

        assert_ok!(manager.cancel(id));
        assert!(matches!(manager.cancel(id), Err(ManagerError::NotFound(_))));

        let active = manager.executor().active_sessions();
        for _ in 0..50 {
            if active.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let manager = SessionManager::new(ScriptedExecutor::new(Vec::new()));
        manager.shutdown().await;
        assert!(matches!(
            manager.start(ExecuteRequest::new("root", "hi")),
            Err(ManagerError::Executor(ExecuteError::ShuttingDown))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relays_supervised_process_as_sse() {
        use std::{fs, os::unix::fs::PermissionsExt};

        use agent_sidecar_executor::{Supervisor, SupervisorConfig};

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("cagent");
        fs::write(
            &bin,
            "#!/bin/sh\n[ \"$1\" = version ] && { echo test; exit 0; }\ncat >/dev/null\necho '[TOOL] search'\necho '[OUTPUT] The answer is 42'\n",
        )
        .unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
        let team = dir.path().join("team.yaml");
        fs::write(&team, "").unwrap();

        let supervisor = Supervisor::new(SupervisorConfig::new(bin.to_string_lossy(), team))
            .await
            .unwrap();
        let manager = SessionManager::with_config(supervisor, fast());
        let id = manager.start(ExecuteRequest::new("root", "question")).unwrap();

        let frames: Vec<String> = drain(manager.subscribe(id))
            .await
            .iter()
            .filter(|i| matches!(i, RelayItem::Event(_)))
            .map(RelayItem::to_sse_frame)
            .collect();

        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("event: tool_call\n"));
        assert!(frames[1].starts_with("event: result\n"));
        assert!(frames[1].contains("The answer is 42"));
        assert!(frames[1].ends_with("\n\n"));
    }
}
