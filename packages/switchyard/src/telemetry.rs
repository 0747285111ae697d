//! Telemetry - observe runtime facts without making decisions or mutating state.
//!
//! A single pluggable sink consumes structured events with a well-known topic
//! set. Emission is fire-and-forget from the producer's perspective: sinks
//! must not block, and a sink failure never affects the transition or effect
//! that produced the event.
//!
//! # Topics
//!
//! | Topic | Fields |
//! |---|---|
//! | `fsm.transition` | `fsm_id, kind, from, to, event, duration_us, tenant_id` |
//! | `fsm.broadcast` | `tenant_id?, subscribers_notified` |
//! | `fsm.journal.append` | `duration_us, path, fsm_id, kind, type` |
//! | `effect.*` | `execution_id, effect_type, fsm_id, tenant_id, duration_us?` |

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::debug;

/// Topic for completed transitions.
pub const TOPIC_TRANSITION: &str = "fsm.transition";
/// Topic for registry/subscriber broadcasts.
pub const TOPIC_BROADCAST: &str = "fsm.broadcast";
/// Topic for journal appends (including failed ones).
pub const TOPIC_JOURNAL_APPEND: &str = "fsm.journal.append";
/// Effect lifecycle topics.
pub const TOPIC_EFFECT_STARTED: &str = "effect.started";
pub const TOPIC_EFFECT_COMPLETED: &str = "effect.completed";
pub const TOPIC_EFFECT_FAILED: &str = "effect.failed";
pub const TOPIC_EFFECT_CANCELLED: &str = "effect.cancelled";
pub const TOPIC_EFFECT_TIMEOUT: &str = "effect.timeout";
pub const TOPIC_EFFECT_RETRY: &str = "effect.retry";
pub const TOPIC_EFFECT_CIRCUIT_BREAKER: &str = "effect.circuit_breaker";
pub const TOPIC_EFFECT_COMPOSITION: &str = "effect.composition";

/// A single structured telemetry event.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    /// One of the `TOPIC_*` constants.
    pub topic: &'static str,
    /// Structured payload; field names follow the topic table above.
    pub fields: Map<String, Value>,
}

impl TelemetryEvent {
    /// Start building an event for a topic.
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            fields: Map::new(),
        }
    }

    /// Attach a field.
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Attach a field only when present.
    pub fn opt_field(mut self, key: &str, value: Option<impl Into<Value>>) -> Self {
        if let Some(v) = value {
            self.fields.insert(key.to_string(), v.into());
        }
        self
    }
}

/// Consumes telemetry events.
///
/// Sinks observe, they don't act: no access to the registry, no emitting
/// back into the runtime. Implementations must return quickly; anything slow
/// belongs behind a channel owned by the sink.
pub trait TelemetrySink: Send + Sync + 'static {
    /// Called once per event, on the producing task.
    fn emit(&self, event: TelemetryEvent);
}

/// Shared handle to the configured sink.
pub type TelemetryHandle = Arc<dyn TelemetrySink>;

/// Default sink: forwards every event to `tracing` at debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        debug!(
            topic = event.topic,
            fields = %serde_json::Value::Object(event.fields),
            "telemetry"
        );
    }
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Maximum events the recording sink retains.
const MAX_RECORDED_EVENTS: usize = 10_000;

/// Bounded in-memory sink for tests and debugging.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    /// Create an empty recording sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TelemetryEvent>> {
        // Recording is observability-only; prefer availability on poison.
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of every recorded event.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock().clone()
    }

    /// Recorded events for one topic.
    pub fn by_topic(&self, topic: &str) -> Vec<TelemetryEvent> {
        self.lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of recorded events for one topic.
    pub fn count(&self, topic: &str) -> usize {
        self.lock().iter().filter(|e| e.topic == topic).count()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: TelemetryEvent) {
        let mut events = self.lock();
        if events.len() >= MAX_RECORDED_EVENTS {
            events.remove(0);
        }
        events.push(event);
    }
}
