//! Fan-out of session events to attached observers

use super::SessionEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receives every event emitted after it subscribes.
///
/// `deliver` runs on the emitting thread with the subscriber list read-locked,
/// so it must not subscribe or unsubscribe. Session events are also emitted
/// while the session's registry entry is held, which keeps them ordered per
/// session; a sink must therefore not call back into a controller. Forward
/// the event to a channel or task and act on it there.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &SessionEvent);
}

impl<F> EventSink for F
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn deliver(&self, event: &SessionEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct Broadcaster {
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn EventSink>)>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, sink));
        id
    }

    /// Detach an observer. Once this returns, the observer receives nothing
    /// further.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn emit(&self, event: &SessionEvent) {
        for (_, sink) in self.subscribers.read().iter() {
            sink.deliver(event);
        }
    }
}
