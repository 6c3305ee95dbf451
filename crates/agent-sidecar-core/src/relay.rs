//! Per-session mailboxes between event production and consumption.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use futures::stream::{self, BoxStream};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};

use crate::{ActiveSessions, Event, traits::SessionId};

/// Idle time after which a subscriber is handed a keepalive.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Untouched mailboxes older than this are swept unless their session is active.
pub const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// How often the background sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Relay timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub keepalive_interval: Duration,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            stale_after: STALE_AFTER,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

enum Slot {
    Event(Event),
    End,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Slot>>>;

struct Mailbox {
    tx: mpsc::UnboundedSender<Slot>,
    rx: SharedReceiver,
    touched: Instant,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            touched: Instant::now(),
        }
    }
}

/// What a subscriber hands to its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayItem {
    /// An event produced by the execution.
    Event(Event),
    /// Nothing arrived within the keepalive interval.
    Keepalive,
}

impl RelayItem {
    /// Convert to an event, materializing keepalives.
    #[must_use]
    pub fn into_event(self) -> Event {
        match self {
            Self::Event(event) => event,
            Self::Keepalive => Event::keepalive(),
        }
    }

    /// Render as a named server-sent event frame.
    #[must_use]
    pub fn to_sse_frame(&self) -> String {
        match self {
            Self::Event(event) => event.to_sse_frame(),
            Self::Keepalive => Event::keepalive().to_sse_frame(),
        }
    }
}

/// Mailbox registry decoupling producers from consumers.
///
/// Mailboxes are created lazily by whichever side touches a session first.
/// A producer pushes every event and then exactly one end marker; a consumer
/// pulls with keepalives until it sees the end marker or a terminal event.
pub struct Relay {
    config: RelayConfig,
    active: ActiveSessions,
    mailboxes: Mutex<HashMap<SessionId, Mailbox>>,
}

impl Relay {
    /// Create a relay that consults `active` before sweeping a mailbox.
    #[must_use]
    pub fn new(active: ActiveSessions) -> Self {
        Self::with_config(active, RelayConfig::default())
    }

    #[must_use]
    pub fn with_config(active: ActiveSessions, config: RelayConfig) -> Self {
        Self {
            config,
            active,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Mailbox>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, id: SessionId, slot: Slot) {
        let mut map = self.lock();
        let mailbox = map.entry(id).or_insert_with(Mailbox::new);
        mailbox.touched = Instant::now();
        // The mailbox owns its receiver, so the channel cannot be closed here.
        let _ = mailbox.tx.send(slot);
    }

    /// Queue an event for a session.
    pub fn push(&self, id: SessionId, event: Event) {
        self.deliver(id, Slot::Event(event));
    }

    /// Queue the end-of-stream marker for a session.
    pub fn finish(&self, id: SessionId) {
        tracing::debug!(session_id = %id, "relay stream finished");
        self.deliver(id, Slot::End);
    }

    /// Attach a consumer to a session's mailbox, creating it if needed.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, id: SessionId) -> Subscription {
        let rx = {
            let mut map = self.lock();
            let mailbox = map.entry(id).or_insert_with(Mailbox::new);
            mailbox.touched = Instant::now();
            Arc::clone(&mailbox.rx)
        };
        Subscription {
            relay: Arc::clone(self),
            id,
            rx,
            keepalive: self.config.keepalive_interval,
            done: false,
        }
    }

    fn touch(&self, id: SessionId) {
        if let Some(mailbox) = self.lock().get_mut(&id) {
            mailbox.touched = Instant::now();
        }
    }

    /// Drop a mailbox. Returns whether one existed.
    pub fn release(&self, id: SessionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove stale mailboxes whose sessions are no longer active.
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Instant::now())
    }

    /// Sweep as if the current time were `now`.
    pub fn sweep_stale_at(&self, now: Instant) -> usize {
        let stale_after = self.config.stale_after;
        let mut map = self.lock();
        let before = map.len();
        map.retain(|id, mailbox| {
            let stale = now.saturating_duration_since(mailbox.touched) >= stale_after;
            if stale && self.active.contains(*id) {
                tracing::debug!(session_id = %id, "keeping stale mailbox of active session");
                return true;
            }
            !stale
        });
        let removed = before - map.len();
        if removed > 0 {
            tracing::info!(removed, remaining = map.len(), "swept stale mailboxes");
        }
        removed
    }

    /// Run [`Relay::sweep_stale`] periodically until the relay is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let relay: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(relay) = relay.upgrade() else {
                    break;
                };
                relay.sweep_stale();
            }
        })
    }
}

/// Consumer handle for one session's mailbox.
pub struct Subscription {
    relay: Arc<Relay>,
    id: SessionId,
    rx: SharedReceiver,
    keepalive: Duration,
    done: bool,
}

impl Subscription {
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.id
    }

    /// Whether the stream has ended.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Pull the next item.
    ///
    /// Yields [`RelayItem::Keepalive`] whenever nothing arrives within the
    /// keepalive interval. Returns `None` after the end marker, and on every
    /// call following a terminal event.
    pub async fn next(&mut self) -> Option<RelayItem> {
        if self.done {
            return None;
        }

        let rx = Arc::clone(&self.rx);
        let received = tokio::time::timeout(self.keepalive, async move {
            let mut guard = rx.lock().await;
            guard.recv().await
        })
        .await;

        match received {
            Err(_) => {
                tracing::trace!(session_id = %self.id, "relay keepalive");
                Some(RelayItem::Keepalive)
            }
            Ok(Some(Slot::Event(event))) => {
                if event.is_terminal() {
                    self.close();
                } else {
                    self.relay.touch(self.id);
                }
                Some(RelayItem::Event(event))
            }
            Ok(Some(Slot::End) | None) => {
                self.close();
                None
            }
        }
    }

    fn close(&mut self) {
        self.done = true;
        self.relay.release(self.id);
    }

    /// Turn the subscription into a stream of relay items.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, RelayItem> {
        Box::pin(stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        }))
    }
}
