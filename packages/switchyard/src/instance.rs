//! Live FSM instances.
//!
//! An [`FsmInstance`] is the mutable value for one machine: current state,
//! data map, metadata, perf counters, subscribers, and per-plugin storage.
//! It is created by the manager, mutated only by the transition engine
//! (atomically from an observer's point of view), and destroyed by the
//! manager. The journal, not the instance, is the durable history.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::kind::FsmKind;

/// The instance data map: symbol-keyed, order-irrelevant, JSON values.
pub type DataMap = serde_json::Map<String, Value>;

/// Timestamps, version counter, and tags for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMetadata {
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// Bumped on every successful transition and data update.
    pub updated_at: DateTime<Utc>,
    /// Monotonic per-instance version, starts at 1.
    pub version: u64,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl InstanceMetadata {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            version: 1,
            tags: Vec::new(),
        }
    }

    /// Record a mutation: bump version, refresh `updated_at`.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// Rolling transition counters for one instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfCounters {
    /// Successful transitions since creation.
    pub transition_count: u64,
    /// Timestamp of the most recent successful transition.
    pub last_transition_at: Option<DateTime<Utc>>,
    /// Running mean transition duration in microseconds.
    pub avg_transition_time_us: f64,
}

impl PerfCounters {
    /// Fold one transition duration into the running mean.
    pub fn record_transition(&mut self, duration_us: u64) {
        self.transition_count += 1;
        self.last_transition_at = Some(Utc::now());
        let count = self.transition_count as f64;
        self.avg_transition_time_us += (duration_us as f64 - self.avg_transition_time_us) / count;
    }
}

/// A live FSM instance.
///
/// Cloneable by value; the registry hands out snapshots and the engine
/// writes a replacement back after each step, so observers see either the
/// pre- or post-transition value, never an intermediate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmInstance {
    /// Process-wide unique id: readable kind prefix plus random suffix.
    pub id: String,
    /// Fully-qualified name of the kind this instance runs.
    pub kind_name: String,
    /// Owning tenant, if any.
    pub tenant_id: Option<String>,
    /// Element of the kind's state set.
    pub current_state: String,
    /// User payload, plugin scratch space, effect outputs.
    #[serde(default)]
    pub data: DataMap,
    /// Ids of FSMs notified on every state change. Runtime-only: not
    /// persisted to snapshots.
    #[serde(skip)]
    pub subscribers: BTreeSet<String>,
    /// Timestamps, version, tags.
    pub metadata: InstanceMetadata,
    /// Rolling transition counters.
    #[serde(default)]
    pub performance: PerfCounters,
    /// Per-plugin storage keyed by plugin name.
    #[serde(default)]
    pub plugin_state: BTreeMap<String, Value>,
}

impl FsmInstance {
    /// Construct a fresh instance of `kind` in its initial state.
    ///
    /// `id` falls back to a generated `<prefix>-<8 hex>` when `None`.
    pub fn new(
        kind: &FsmKind,
        initial_data: DataMap,
        id: Option<String>,
        tenant_id: Option<String>,
    ) -> Self {
        let id = id.unwrap_or_else(|| generate_id(kind.short_name()));
        Self {
            id,
            kind_name: kind.name().to_string(),
            tenant_id,
            current_state: kind.initial_state().to_string(),
            data: initial_data,
            subscribers: BTreeSet::new(),
            metadata: InstanceMetadata::new(Utc::now()),
            performance: PerfCounters::default(),
            plugin_state: BTreeMap::new(),
        }
    }

    /// Shallow-merge `patch` into `data`; patch wins on key collision.
    pub fn merge_data(&mut self, patch: DataMap) {
        for (key, value) in patch {
            self.data.insert(key, value);
        }
    }

    /// Read a data value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Write a data value.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Generate a readable instance id: lowercased kind short name plus the
/// first eight hex digits of a v4 UUID.
pub fn generate_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix.to_lowercase(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::FsmKind;
    use serde_json::json;

    fn door_kind() -> std::sync::Arc<FsmKind> {
        FsmKind::builder("Demo.Door")
            .states(["closed", "open"])
            .initial("closed")
            .transition("closed", "open_cmd", "open")
            .transition("open", "close_cmd", "closed")
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_instance_starts_in_initial_state() {
        let kind = door_kind();
        let instance = FsmInstance::new(&kind, DataMap::new(), None, Some("t1".into()));

        assert_eq!(instance.current_state, "closed");
        assert_eq!(instance.kind_name, "Demo.Door");
        assert_eq!(instance.tenant_id.as_deref(), Some("t1"));
        assert_eq!(instance.metadata.version, 1);
        assert_eq!(instance.performance.transition_count, 0);
    }

    #[test]
    fn test_generated_id_has_prefix_and_suffix() {
        let kind = door_kind();
        let instance = FsmInstance::new(&kind, DataMap::new(), None, None);

        let (prefix, suffix) = instance.id.split_once('-').unwrap();
        assert_eq!(prefix, "door");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let kind = door_kind();
        let instance =
            FsmInstance::new(&kind, DataMap::new(), Some("door-custom".into()), None);
        assert_eq!(instance.id, "door-custom");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let seen: std::collections::HashSet<_> =
            (0..100).map(|_| generate_id("door")).collect();
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_merge_data_event_data_wins() {
        let kind = door_kind();
        let mut instance = FsmInstance::new(&kind, DataMap::new(), None, None);
        instance.put("a", json!(1)).put("b", json!(2));

        let mut patch = DataMap::new();
        patch.insert("b".into(), json!(20));
        patch.insert("c".into(), json!(30));
        instance.merge_data(patch);

        assert_eq!(instance.get("a"), Some(&json!(1)));
        assert_eq!(instance.get("b"), Some(&json!(20)));
        assert_eq!(instance.get("c"), Some(&json!(30)));
    }

    #[test]
    fn test_touch_bumps_version() {
        let kind = door_kind();
        let mut instance = FsmInstance::new(&kind, DataMap::new(), None, None);
        let before = instance.metadata.version;
        instance.metadata.touch();
        assert_eq!(instance.metadata.version, before + 1);
    }

    #[test]
    fn test_perf_running_mean() {
        let mut perf = PerfCounters::default();
        perf.record_transition(100);
        perf.record_transition(300);
        assert_eq!(perf.transition_count, 2);
        assert!((perf.avg_transition_time_us - 200.0).abs() < f64::EPSILON);
        assert!(perf.last_transition_at.is_some());
    }

    #[test]
    fn test_subscribers_not_serialized() {
        let kind = door_kind();
        let mut instance = FsmInstance::new(&kind, DataMap::new(), None, None);
        instance.subscribers.insert("watcher-1".into());

        let json = serde_json::to_value(&instance).unwrap();
        assert!(json.get("subscribers").is_none());

        let back: FsmInstance = serde_json::from_value(json).unwrap();
        assert!(back.subscribers.is_empty());
        assert_eq!(back.current_state, instance.current_state);
    }
}
