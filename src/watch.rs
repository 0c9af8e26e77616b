//! Fan-out of route-table changes to local subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// A route-table change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub event: EventKind,
    /// Id of the route that changed.
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Set,
    Remove,
}

impl Event {
    pub fn set(id: impl Into<String>) -> Self {
        Self {
            event: EventKind::Set,
            id: id.into(),
        }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        Self {
            event: EventKind::Remove,
            id: id.into(),
        }
    }
}

/// In-memory event multiplexer. Publication never blocks: subscribers with
/// a full or closed queue are dropped from the registry.
#[derive(Default)]
pub struct WatchManager {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
}

impl WatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with a bounded queue of `capacity` events.
    /// Returns the subscriber id and the receiving half.
    pub fn subscribe(&self, capacity: usize) -> (u64, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    /// Deliver `event` to every subscriber that can keep up.
    pub fn send(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(subscriber = id, "dropping slow or closed watch subscriber");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let wm = WatchManager::new();
        let (_, mut a) = wm.subscribe(8);
        let (_, mut b) = wm.subscribe(8);

        wm.send(Event::set("r1"));
        wm.send(Event::remove("r1"));

        assert_eq!(a.recv().await.unwrap(), Event::set("r1"));
        assert_eq!(a.recv().await.unwrap(), Event::remove("r1"));
        assert_eq!(b.recv().await.unwrap(), Event::set("r1"));
        assert_eq!(b.recv().await.unwrap(), Event::remove("r1"));
    }

    #[tokio::test]
    async fn slow_subscribers_are_dropped() {
        let wm = WatchManager::new();
        let (_, mut rx) = wm.subscribe(1);

        wm.send(Event::set("r1"));
        wm.send(Event::set("r2")); // queue full, subscriber dropped
        assert_eq!(wm.subscriber_count(), 0);

        // the queued event is still readable, then the stream ends
        assert_eq!(rx.recv().await.unwrap(), Event::set("r1"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let wm = WatchManager::new();
        let (id, mut rx) = wm.subscribe(8);

        wm.unsubscribe(id);
        wm.send(Event::set("r1"));

        assert!(rx.recv().await.is_none());
        assert_eq!(wm.subscriber_count(), 0);
    }
}
