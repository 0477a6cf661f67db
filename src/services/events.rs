//! Event Fanout (C9, design §4.9).
//!
//! A process-wide bus with bounded per-subscriber channels. Producers
//! push JSON-encoded change events; `tokio::sync::broadcast` already
//! gives the semantics the design asks for — slow subscribers lag and
//! drop the oldest messages instead of blocking the producer — so no
//! `(database channel) -> bus` adapter is needed beyond wrapping it.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_id: Uuid,
    pub kind: String,
    pub summary: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(entity_id: Uuid, kind: impl Into<String>, summary: serde_json::Value) -> Self {
        Self {
            entity_id,
            kind: kind.into(),
            summary,
        }
    }
}

/// Transport to external consumers is SSE-style; the bus itself is
/// transport-agnostic (design §4.9, §9 "pg_notify fanout -> a generic
/// change-notification bus").
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Non-blocking publish; with no subscribers this is a no-op rather
    /// than an error.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_a_copy() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(ChangeEvent::new(Uuid::new_v4(), "campaign.sent", serde_json::json!({})));
        assert_eq!(a.recv().await.unwrap().kind, "campaign.sent");
        assert_eq!(b.recv().await.unwrap().kind, "campaign.sent");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(ChangeEvent::new(Uuid::new_v4(), "campaign.sent", serde_json::json!({})));
    }
}
