//! Per-session event stream.
//!
//! Tokio broadcast channel for live observers plus an in-memory history so
//! that late subscribers can replay everything they missed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::debug;

use super::types::SessionEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to an EventStream
pub type SharedEventStream = Arc<EventStream>;

/// Broadcast sender plus replayable history for one session.
pub struct EventStream {
    sender: broadcast::Sender<SessionEvent>,
    history: Mutex<Vec<SessionEvent>>,
}

impl EventStream {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(self) -> SharedEventStream {
        Arc::new(self)
    }

    /// Record and broadcast an event. Having no live subscribers is fine.
    pub fn publish(&self, event: SessionEvent) {
        let event_type = event.event_type();
        let mut history = self.history();
        history.push(event.clone());
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    /// Live events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Everything published so far plus a receiver for what follows.
    ///
    /// Taken under the history lock, so no event is missed or duplicated
    /// between the snapshot and the receiver.
    pub fn subscribe_with_history(&self) -> (Vec<SessionEvent>, broadcast::Receiver<SessionEvent>) {
        let history = self.history();
        (history.clone(), self.sender.subscribe())
    }

    /// Snapshot of all published events, oldest first.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.history().clone()
    }

    /// Events of one type, oldest first.
    pub fn events_of_type(&self, event_type: &str) -> Vec<SessionEvent> {
        self.history()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history().is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Event counts by type.
    pub fn stats(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for event in self.history().iter() {
            *counts.entry(event.event_type()).or_insert(0) += 1;
        }
        counts
    }

    fn history(&self) -> MutexGuard<'_, Vec<SessionEvent>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("events", &self.len())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn started(id: &str) -> SessionEvent {
        SessionEvent::SessionStarted {
            session_id: id.into(),
            participants: vec!["claude".into()],
            max_rounds: 2,
            time_limit_ms: 20_000,
            timestamp: Utc::now(),
        }
    }

    fn timed_out(id: &str) -> SessionEvent {
        SessionEvent::SessionTimedOut {
            session_id: id.into(),
            rounds_started: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let stream = EventStream::new();
        let mut rx = stream.subscribe();
        stream.publish(started("s-1"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "session_started");
        assert_eq!(stream.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_keeps_history() {
        let stream = EventStream::new();
        stream.publish(started("s-1"));
        stream.publish(timed_out("s-1"));
        assert_eq!(stream.subscriber_count(), 0);
        assert_eq!(stream.events().len(), 2);
        assert_eq!(stream.events_of_type("session_timed_out").len(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_history() {
        let stream = EventStream::new();
        stream.publish(started("s-1"));

        let (history, mut rx) = stream.subscribe_with_history();
        assert_eq!(history.len(), 1);

        stream.publish(timed_out("s-1"));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.event_type(), "session_timed_out");
    }

    #[test]
    fn test_stats() {
        let stream = EventStream::new();
        stream.publish(started("s-1"));
        stream.publish(timed_out("s-1"));
        stream.publish(timed_out("s-1"));
        let stats = stream.stats();
        assert_eq!(stats.get("session_started"), Some(&1));
        assert_eq!(stats.get("session_timed_out"), Some(&2));
    }
}
