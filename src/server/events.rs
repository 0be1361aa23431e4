//! Change-feed events broadcast to SSE subscribers

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::identity;

/// A change observed by the service layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// "stored" or "deleted"
    pub event: String,
    pub content_hash: String,
    /// RFC 3339 event time
    pub at: String,
}

impl MemoryEvent {
    pub fn stored(content_hash: &str) -> Self {
        Self::new("stored", content_hash)
    }

    pub fn deleted(content_hash: &str) -> Self {
        Self::new("deleted", content_hash)
    }

    fn new(event: &str, content_hash: &str) -> Self {
        Self {
            event: event.to_string(),
            content_hash: content_hash.to_string(),
            at: identity::timestamp_to_iso(identity::now()),
        }
    }
}

/// Fan-out of memory events to any number of SSE connections
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<MemoryEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: MemoryEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.publish(MemoryEvent::stored("abc123"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "stored");
        assert_eq!(event.content_hash, "abc123");
        assert!(event.at.ends_with('Z'));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish(MemoryEvent::deleted("abc123"));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
