// src/core/events.rs

//! Typed store events and the bounded channels that carry them.
//!
//! The coordination store delivers one-shot watches; the gateway re-arms
//! them and forwards higher-level events into these channels. Watch
//! callbacks never run agent logic inline: workers drain subscriptions in
//! their own loops, so a slow demote or base backup can never block the
//! gateway. Events may be redelivered after store reconnects, so every
//! consumer must be idempotent.

use tokio::sync::mpsc;

/// Capacity of one watch subscription channel. Deliveries beyond this are
/// dropped; the store's level-triggered re-arm resurfaces the state.
pub const WATCH_CHANNEL_CAPACITY: usize = 64;

/// A higher-level event derived from the store's one-shot watch protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The watched node appeared.
    Created,
    /// The watched node disappeared.
    Deleted,
    /// The watched node's data changed.
    DataChanged,
    /// The watched node's child set changed; carries the current children.
    ChildrenChanged(Vec<String>),
}

/// Fired on the session broadcast channel when the store session dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Expired,
}

/// The receiving half of one re-armed watch.
#[derive(Debug)]
pub struct WatchSubscription {
    rx: mpsc::Receiver<StoreEvent>,
}

impl WatchSubscription {
    /// Creates a subscription and the sender the gateway feeds it from.
    pub fn channel() -> (mpsc::Sender<StoreEvent>, Self) {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        (tx, Self { rx })
    }

    /// Receives the next event; `None` once the gateway side is gone.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used by tests.
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        self.rx.try_recv().ok()
    }
}
