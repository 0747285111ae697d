//! Plugins - named cross-cutting extensions with three lifecycle methods.
//!
//! A plugin sees every instance of the kinds it is installed on:
//! - `init` runs once at instance construction
//! - `before_transition` runs after validation, before any state change
//! - `after_transition` runs once the new state is in place
//!
//! Each method is a pure transformation: it takes the instance and returns
//! it (possibly replaced). Any IO a plugin performs is at its own risk and
//! must not block for unbounded time.
//!
//! # Failure semantics
//!
//! Plugin failure **aborts** the transition: the caller gets
//! `FsmError::PluginFailed` and the instance back in its pre-plugin form.
//! This is the opposite of hooks, which are advisory. Panics inside a plugin
//! are caught by the engine and converted to the same error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use crate::instance::{DataMap, FsmInstance};

/// Context passed to `before_transition` and `after_transition`.
///
/// `new_state` is `None` before the state change and `Some` after it.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    /// State the instance was in when the event arrived.
    pub old_state: &'a str,
    /// Target state; populated only for `after_transition`.
    pub new_state: Option<&'a str>,
    /// The driving event.
    pub event: &'a str,
    /// Payload carried by the event.
    pub event_data: &'a DataMap,
}

/// A cross-cutting extension installed on a kind.
///
/// All three methods default to the identity transformation, so a plugin
/// implements only the phases it cares about. Per-plugin storage lives in
/// `instance.plugin_state` keyed by [`Plugin::name`].
pub trait Plugin: Send + Sync + 'static {
    /// Stable name; keys `plugin_state` and appears in error tags.
    fn name(&self) -> &str;

    /// Called once at instance construction, in installation order.
    fn init(&self, instance: FsmInstance, _options: &DataMap) -> Result<FsmInstance, String> {
        Ok(instance)
    }

    /// Called before the state change. Returning `Err` aborts the transition.
    fn before_transition(
        &self,
        instance: FsmInstance,
        _ctx: &TransitionContext<'_>,
    ) -> Result<FsmInstance, String> {
        Ok(instance)
    }

    /// Called after the state change. Returning `Err` aborts the transition.
    fn after_transition(
        &self,
        instance: FsmInstance,
        _ctx: &TransitionContext<'_>,
    ) -> Result<FsmInstance, String> {
        Ok(instance)
    }
}

// =============================================================================
// Logger Plugin
// =============================================================================

/// Built-in plugin that logs every transition through `tracing`.
#[derive(Debug, Default)]
pub struct LoggerPlugin;

impl LoggerPlugin {
    /// Create a logger plugin.
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for LoggerPlugin {
    fn name(&self) -> &str {
        "logger"
    }

    fn init(&self, instance: FsmInstance, _options: &DataMap) -> Result<FsmInstance, String> {
        info!(
            fsm_id = %instance.id,
            kind = %instance.kind_name,
            state = %instance.current_state,
            "fsm created"
        );
        Ok(instance)
    }

    fn after_transition(
        &self,
        instance: FsmInstance,
        ctx: &TransitionContext<'_>,
    ) -> Result<FsmInstance, String> {
        info!(
            fsm_id = %instance.id,
            from = ctx.old_state,
            to = ctx.new_state.unwrap_or(""),
            event = ctx.event,
            "fsm transition"
        );
        Ok(instance)
    }
}

// =============================================================================
// Audit Plugin
// =============================================================================

/// One audited transition.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// Which instance transitioned.
    pub fsm_id: String,
    /// Pre-transition state.
    pub from: String,
    /// Post-transition state.
    pub to: String,
    /// The driving event.
    pub event: String,
    /// When the transition was audited.
    pub at: DateTime<Utc>,
}

/// Maximum records the audit trail retains.
const MAX_AUDIT_RECORDS: usize = 1000;

/// Bounded in-memory trail shared by [`AuditPlugin`] and its readers.
#[derive(Debug, Default)]
pub struct AuditTrail {
    records: Mutex<VecDeque<AuditRecord>>,
}

impl AuditTrail {
    /// Create an empty trail.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditRecord>> {
        // Audit is observability-only; prefer availability on poison.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, record: AuditRecord) {
        let mut records = self.lock();
        if records.len() >= MAX_AUDIT_RECORDS {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// All retained records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Retained records for one instance.
    pub fn for_fsm(&self, fsm_id: &str) -> Vec<AuditRecord> {
        self.lock()
            .iter()
            .filter(|r| r.fsm_id == fsm_id)
            .cloned()
            .collect()
    }

    /// The most recent `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditRecord> {
        self.lock().iter().rev().take(n).cloned().collect()
    }
}

/// Built-in plugin that records transitions into a shared [`AuditTrail`]
/// and counts them in `plugin_state`.
#[derive(Debug, Default)]
pub struct AuditPlugin {
    trail: Arc<AuditTrail>,
}

impl AuditPlugin {
    /// Create an audit plugin with its own trail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an audit plugin writing into a shared trail.
    pub fn with_trail(trail: Arc<AuditTrail>) -> Self {
        Self { trail }
    }

    /// Handle to the underlying trail.
    pub fn trail(&self) -> Arc<AuditTrail> {
        self.trail.clone()
    }
}

impl Plugin for AuditPlugin {
    fn name(&self) -> &str {
        "audit"
    }

    fn init(&self, mut instance: FsmInstance, _options: &DataMap) -> Result<FsmInstance, String> {
        instance
            .plugin_state
            .insert(self.name().to_string(), json!({"transitions_seen": 0}));
        Ok(instance)
    }

    fn after_transition(
        &self,
        mut instance: FsmInstance,
        ctx: &TransitionContext<'_>,
    ) -> Result<FsmInstance, String> {
        self.trail.push(AuditRecord {
            fsm_id: instance.id.clone(),
            from: ctx.old_state.to_string(),
            to: ctx.new_state.unwrap_or_default().to_string(),
            event: ctx.event.to_string(),
            at: Utc::now(),
        });

        let seen = instance
            .plugin_state
            .get(self.name())
            .and_then(|v| v.get("transitions_seen"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        instance
            .plugin_state
            .insert(self.name().to_string(), json!({"transitions_seen": seen + 1}));
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::FsmKind;

    fn instance() -> FsmInstance {
        let kind = FsmKind::builder("Demo.Gate")
            .states(["shut", "ajar"])
            .initial("shut")
            .transition("shut", "push", "ajar")
            .build()
            .unwrap();
        FsmInstance::new(&kind, DataMap::new(), None, None)
    }

    #[test]
    fn test_default_plugin_methods_are_identity() {
        struct Noop;
        impl Plugin for Noop {
            fn name(&self) -> &str {
                "noop"
            }
        }

        let inst = instance();
        let id = inst.id.clone();
        let ctx = TransitionContext {
            old_state: "shut",
            new_state: None,
            event: "push",
            event_data: &DataMap::new(),
        };
        let out = Noop.before_transition(inst, &ctx).unwrap();
        assert_eq!(out.id, id);
    }

    #[test]
    fn test_audit_plugin_records_and_counts() {
        let plugin = AuditPlugin::new();
        let trail = plugin.trail();

        let inst = plugin.init(instance(), &DataMap::new()).unwrap();
        let ctx = TransitionContext {
            old_state: "shut",
            new_state: Some("ajar"),
            event: "push",
            event_data: &DataMap::new(),
        };
        let inst = plugin.after_transition(inst, &ctx).unwrap();
        let inst = plugin.after_transition(inst, &ctx).unwrap();

        assert_eq!(trail.records().len(), 2);
        assert_eq!(trail.for_fsm(&inst.id).len(), 2);
        assert_eq!(
            inst.plugin_state["audit"]["transitions_seen"],
            json!(2)
        );
    }

    #[test]
    fn test_audit_trail_is_bounded() {
        let trail = AuditTrail::new();
        for i in 0..(MAX_AUDIT_RECORDS + 5) {
            trail.push(AuditRecord {
                fsm_id: format!("f-{i}"),
                from: "a".into(),
                to: "b".into(),
                event: "e".into(),
                at: Utc::now(),
            });
        }
        assert_eq!(trail.records().len(), MAX_AUDIT_RECORDS);
        // Oldest entries were evicted.
        assert_eq!(trail.records()[0].fsm_id, "f-5");
    }

    #[test]
    fn test_recent_returns_newest_first() {
        let trail = AuditTrail::new();
        for i in 0..3 {
            trail.push(AuditRecord {
                fsm_id: format!("f-{i}"),
                from: "a".into(),
                to: "b".into(),
                event: "e".into(),
                at: Utc::now(),
            });
        }
        let recent = trail.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].fsm_id, "f-2");
        assert_eq!(recent[1].fsm_id, "f-1");
    }
}
