//! Registry of in-flight executions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::traits::SessionId;

/// What the registry knows about one running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEntry {
    /// Agent being executed.
    pub agent_id: String,
    /// OS process id of the supervised child, once spawned.
    pub pid: Option<u32>,
}

/// Shared set of active session ids.
///
/// Owned by whatever runs executions and handed by clone to anything that
/// must not tear down state belonging to a running session (the relay sweep).
#[derive(Debug, Clone, Default)]
pub struct ActiveSessions {
    inner: Arc<Mutex<HashMap<SessionId, ActiveEntry>>>,
}

impl ActiveSessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, ActiveEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session. Returns `false` if the id was already present.
    pub fn insert(&self, id: SessionId, agent_id: impl Into<String>) -> bool {
        let mut map = self.lock();
        if map.contains_key(&id) {
            return false;
        }
        map.insert(
            id,
            ActiveEntry {
                agent_id: agent_id.into(),
                pid: None,
            },
        );
        true
    }

    /// Record the child pid for a registered session.
    pub fn set_pid(&self, id: SessionId, pid: u32) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.pid = Some(pid);
        }
    }

    /// Remove a session, returning its entry.
    pub fn remove(&self, id: SessionId) -> Option<ActiveEntry> {
        self.lock().remove(&id)
    }

    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<ActiveEntry> {
        self.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of all registered sessions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(SessionId, ActiveEntry)> {
        self.lock()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }
}
