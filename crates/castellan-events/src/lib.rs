//! Domain events emitted by the E4 service.
//!
//! Dispatch is fire-and-forget: the dispatcher never blocks the caller for
//! I/O and slow observers lose events rather than applying backpressure to
//! the orchestration path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    ClientSubscribed,
    ClientUnsubscribed,
}

/// A domain event. `source` is the client name, `target` the topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub source: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn client_subscribed(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: EventKind::ClientSubscribed,
            source: source.into(),
            target: target.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn client_unsubscribed(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: EventKind::ClientUnsubscribed,
            source: source.into(),
            target: target.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Event sink consumed by the service.
pub trait Dispatcher: Send + Sync {
    /// Deliver `event` to observers. Best-effort, never blocks for I/O,
    /// ordering across events is not guaranteed.
    fn dispatch(&self, event: Event);
}

/// Broadcast-backed dispatcher with a bounded buffer.
///
/// Observers that fall more than `capacity` events behind lose the oldest
/// events (`RecvError::Lagged`); dispatch itself never waits.
pub struct BroadcastDispatcher {
    tx: broadcast::Sender<Event>,
}

impl BroadcastDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach an observer.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Dispatcher for BroadcastDispatcher {
    fn dispatch(&self, event: Event) {
        // Send fails only when no observer is attached.
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped, no observers attached");
        }
    }
}

/// Recording dispatcher for tests.
#[derive(Default, Clone)]
pub struct RecordingDispatcher {
    events: Arc<parking_lot::RwLock<Vec<Event>>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, event: Event) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_delivers_to_observers() {
        let dispatcher = BroadcastDispatcher::new(8);
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch(Event::client_subscribed("alice", "news"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ClientSubscribed);
        assert_eq!(event.source, "alice");
        assert_eq!(event.target, "news");
    }

    #[test]
    fn dispatch_without_observers_does_not_panic() {
        let dispatcher = BroadcastDispatcher::new(8);
        dispatcher.dispatch(Event::client_unsubscribed("alice", "news"));
    }

    #[tokio::test]
    async fn slow_observers_lose_oldest_events() {
        let dispatcher = BroadcastDispatcher::new(2);
        let mut rx = dispatcher.subscribe();

        for i in 0..4 {
            dispatcher.dispatch(Event::client_subscribed(format!("c{i}"), "t"));
        }

        // The first recv reports the overflow, subsequent ones drain the
        // retained tail.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(rx.recv().await.unwrap().source, "c2");
        assert_eq!(rx.recv().await.unwrap().source, "c3");
    }

    #[test]
    fn recording_dispatcher_records() {
        let dispatcher = RecordingDispatcher::new();
        dispatcher.dispatch(Event::client_subscribed("alice", "news"));
        dispatcher.dispatch(Event::client_unsubscribed("alice", "news"));

        let events = dispatcher.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::ClientUnsubscribed);
    }
}
