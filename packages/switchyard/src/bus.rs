//! Topic-keyed pub/sub for observing FSM lifecycles.
//!
//! Each tenant has a topic `fsm:<tenant_id>` (or `fsm:no_tenant`) carrying
//! `fsm_created`, `fsm_state_changed`, and `fsm_destroyed` messages.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss messages
//! - **In-memory only**: the journal, not the bus, is the durable history
//! - **No replay**: lagged receivers get `RecvError::Lagged`
//!
//! Correctness must never depend on the bus; it is best-effort observability.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Message names carried on FSM topics.
pub const EVENT_CREATED: &str = "fsm_created";
pub const EVENT_STATE_CHANGED: &str = "fsm_state_changed";
pub const EVENT_DESTROYED: &str = "fsm_destroyed";

/// One pub/sub message.
#[derive(Debug, Clone, Serialize)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// One of the `EVENT_*` names.
    pub event: String,
    /// Structured payload.
    pub payload: Value,
    /// When the message was published.
    pub timestamp: DateTime<Utc>,
}

/// Topic for a tenant's lifecycle stream.
pub fn tenant_topic(tenant_id: Option<&str>) -> String {
    format!("fsm:{}", tenant_id.unwrap_or("no_tenant"))
}

/// Topic-keyed broadcast bus.
///
/// Channels are created lazily on first publish or subscribe and shared by
/// every publisher and subscriber of that topic.
pub struct PubSub {
    topics: DashMap<String, broadcast::Sender<BusMessage>>,
    capacity: usize,
}

impl PubSub {
    /// Create a bus whose topics buffer `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish a message; returns the number of receivers that got it.
    pub fn publish(&self, topic: &str, event: &str, payload: Value) -> usize {
        let message = BusMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.sender(topic).send(message).unwrap_or(0)
    }

    /// Subscribe to a topic. Messages published before subscription are not
    /// received.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender(topic).subscribe()
    }

    /// Active receiver count for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("topics", &self.topics.len())
            .finish()
    }
}
