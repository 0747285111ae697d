//! The transition engine - one deterministic, hooked, validated, observable
//! step.
//!
//! `navigate` advances an instance on an event:
//!
//! ```text
//! lookup -> validate -> pre-plugins -> exit hooks -> state change
//!        -> enter hooks -> post-plugins -> metrics -> journal -> broadcast
//!        -> cancel old-state effects -> start new-state effects
//! ```
//!
//! The order is part of the contract. Steps through the journal append are
//! synchronous with respect to the caller; broadcast delivery and effect
//! execution happen on independent workers.
//!
//! # Failure semantics
//!
//! - No matching transition or a validator rejection: pure no-op. No state
//!   change, no journal record, no broadcast.
//! - Plugin failure (error or panic): the transition aborts and the registry
//!   keeps the pre-transition instance.
//! - Hook crash: advisory. Logged, the instance from before the crashing
//!   hook is used, and the transition completes.
//! - Journal append failure: logged and surfaced via telemetry; the
//!   in-memory transition stands.
//!
//! Callers serialize writes per instance by holding
//! `Registry::lock_for(id)` across the call; the engine itself takes no
//! locks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{error, warn};

use crate::bus::{PubSub, EVENT_STATE_CHANGED};
use crate::error::FsmError;
use crate::executor::EffectsEngine;
use crate::instance::{DataMap, FsmInstance};
use crate::journal::EventJournal;
use crate::kind::{FsmKind, Hook};
use crate::plugin::TransitionContext;
use crate::registry::Registry;
use crate::telemetry::{TelemetryEvent, TelemetryHandle, TOPIC_BROADCAST, TOPIC_TRANSITION};

/// Drives instances through their transition tables.
pub struct TransitionEngine {
    registry: Arc<Registry>,
    journal: Arc<EventJournal>,
    bus: Arc<PubSub>,
    effects: Arc<EffectsEngine>,
    telemetry: TelemetryHandle,
}

impl TransitionEngine {
    /// Create an engine over the shared runtime components.
    pub fn new(
        registry: Arc<Registry>,
        journal: Arc<EventJournal>,
        bus: Arc<PubSub>,
        effects: Arc<EffectsEngine>,
        telemetry: TelemetryHandle,
    ) -> Self {
        Self {
            registry,
            journal,
            bus,
            effects,
            telemetry,
        }
    }

    /// Finish constructing a freshly registered instance: plugin `init`
    /// hooks, initial-state entry hooks, and the `created` journal record.
    ///
    /// The caller has already registered the instance (registration precedes
    /// any side effect) and holds its write lock. A plugin `init` failure
    /// unregisters the instance and aborts creation.
    pub fn initialize(
        &self,
        kind: &Arc<FsmKind>,
        instance: Arc<FsmInstance>,
    ) -> Result<Arc<FsmInstance>, FsmError> {
        let initial_data = instance.data.clone();
        let mut current = (*instance).clone();

        for installed in kind.plugins() {
            let plugin = &installed.plugin;
            let name = plugin.name().to_string();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                plugin.init(current.clone(), &installed.options)
            }));
            current = match outcome {
                Ok(Ok(next)) => next,
                Ok(Err(reason)) => {
                    self.registry.unregister(&current.id);
                    return Err(FsmError::PluginFailed {
                        plugin: name,
                        reason,
                    });
                }
                Err(panic) => {
                    self.registry.unregister(&current.id);
                    return Err(FsmError::PluginFailed {
                        plugin: name,
                        reason: panic_message(panic),
                    });
                }
            };
        }

        current = run_hooks(
            kind.enter_hooks(kind.initial_state()),
            current,
            "enter",
            kind.initial_state(),
        );

        if let Err(e) = self.journal.append_created(kind, &current, &initial_data) {
            error!(fsm_id = %current.id, error = %e, "journal append failed for created record");
        }

        Ok(self.registry.update(current))
    }

    /// Advance `instance` on `event`.
    ///
    /// The caller holds `Registry::lock_for(instance.id)`; concurrent events
    /// for one id are thereby serialized in arrival order.
    pub fn navigate(
        &self,
        kind: &Arc<FsmKind>,
        instance: Arc<FsmInstance>,
        event: &str,
        event_data: &DataMap,
    ) -> Result<Arc<FsmInstance>, FsmError> {
        let started = Instant::now();
        let old_state = instance.current_state.clone();

        // 1. Lookup. No match means no side effects at all.
        let new_state = kind
            .resolve(&old_state, event)
            .ok_or_else(|| FsmError::InvalidTransition {
                state: old_state.clone(),
                event: event.to_string(),
            })?
            .to_string();

        // 2. Validations, threading the instance.
        let mut current = (*instance).clone();
        for validation in kind.validations() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                validation(current.clone(), event, event_data)
            }));
            current = match outcome {
                Ok(Ok(next)) => next,
                Ok(Err(reason)) => return Err(FsmError::ValidationError { reason }),
                Err(panic) => {
                    return Err(FsmError::ValidationError {
                        reason: panic_message(panic),
                    })
                }
            };
        }

        // 3. Pre-plugins. Failure aborts with the registry untouched.
        let pre_ctx = TransitionContext {
            old_state: &old_state,
            new_state: None,
            event,
            event_data,
        };
        for installed in kind.plugins() {
            current = run_plugin(
                &installed.plugin,
                |p, i| p.before_transition(i, &pre_ctx),
                current,
            )?;
        }

        // 4. Exit hooks (advisory).
        current = run_hooks(kind.exit_hooks(&old_state), current, "exit", &old_state);

        // 5. State change and shallow data merge; event data wins.
        current.current_state = new_state.clone();
        current.merge_data(event_data.clone());
        current.metadata.touch();

        // 6. Enter hooks (advisory).
        current = run_hooks(kind.enter_hooks(&new_state), current, "enter", &new_state);

        // 7. Post-plugins. Failure still aborts the whole step.
        let post_ctx = TransitionContext {
            old_state: &old_state,
            new_state: Some(&new_state),
            event,
            event_data,
        };
        for installed in kind.plugins() {
            current = run_plugin(
                &installed.plugin,
                |p, i| p.after_transition(i, &post_ctx),
                current,
            )?;
        }

        // 8. Metrics.
        let duration_us = started.elapsed().as_micros() as u64;
        current.performance.record_transition(duration_us);

        // 9. Journal. Append failure is a durability failure, not a
        // transition failure.
        if let Err(e) = self
            .journal
            .append_transition(kind, &current, &old_state, event, event_data)
        {
            error!(fsm_id = %current.id, error = %e, "journal append failed for transition record");
        }

        self.telemetry.emit(
            TelemetryEvent::new(TOPIC_TRANSITION)
                .field("fsm_id", current.id.as_str())
                .field("kind", kind.name())
                .field("from", old_state.as_str())
                .field("to", new_state.as_str())
                .field("event", event)
                .field("duration_us", duration_us)
                .opt_field("tenant_id", current.tenant_id.as_deref()),
        );

        // 10. Broadcast to the tenant topic and to subscriber channels.
        let payload = json!({
            "fsm_id": current.id,
            "event": event,
            "from": old_state,
            "to": new_state,
            "data": current.data,
            "timestamp": current.metadata.updated_at,
        });
        self.bus.publish(
            &crate::bus::tenant_topic(current.tenant_id.as_deref()),
            EVENT_STATE_CHANGED,
            payload.clone(),
        );
        for subscriber in &current.subscribers {
            self.bus
                .publish(&format!("fsm:{subscriber}"), EVENT_STATE_CHANGED, payload.clone());
        }
        self.telemetry.emit(
            TelemetryEvent::new(TOPIC_BROADCAST)
                .opt_field("tenant_id", current.tenant_id.as_deref())
                .field("subscribers_notified", current.subscribers.len() as u64),
        );

        // 11-12. Swap effect executions: cancel the old state's, start the
        // new state's. Both non-blocking.
        self.effects.cancel_state(&current.id, &old_state);
        let updated = self.registry.update(current);
        self.effects.spawn_for_state(kind, &updated, &new_state);

        Ok(updated)
    }
}

impl std::fmt::Debug for TransitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionEngine").finish_non_exhaustive()
    }
}

/// Run a hook list in order. A panicking hook is logged and skipped; the
/// instance from before that hook is carried forward.
fn run_hooks(hooks: &[Hook], mut instance: FsmInstance, direction: &str, state: &str) -> FsmInstance {
    for hook in hooks {
        match catch_unwind(AssertUnwindSafe(|| hook(instance.clone()))) {
            Ok(next) => instance = next,
            Err(panic) => {
                warn!(
                    state,
                    direction,
                    panic = %panic_message(panic),
                    "hook panicked; continuing"
                );
            }
        }
    }
    instance
}

fn run_plugin<F>(
    plugin: &Arc<dyn crate::plugin::Plugin>,
    call: F,
    instance: FsmInstance,
) -> Result<FsmInstance, FsmError>
where
    F: FnOnce(&dyn crate::plugin::Plugin, FsmInstance) -> Result<FsmInstance, String>,
{
    let name = plugin.name().to_string();
    match catch_unwind(AssertUnwindSafe(|| call(plugin.as_ref(), instance))) {
        Ok(Ok(next)) => Ok(next),
        Ok(Err(reason)) => Err(FsmError::PluginFailed {
            plugin: name,
            reason,
        }),
        Err(panic) => Err(FsmError::PluginFailed {
            plugin: name,
            reason: panic_message(panic),
        }),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::KindRegistry;
    use crate::effect::Effect;
    use crate::plugin::Plugin;
    use crate::provider::{FunctionRegistry, StubProvider};
    use crate::telemetry::{RecordingSink, TOPIC_EFFECT_CANCELLED};
    use std::time::Duration;

    struct Stack {
        engine: TransitionEngine,
        registry: Arc<Registry>,
        journal: Arc<EventJournal>,
        bus: Arc<PubSub>,
        kinds: Arc<KindRegistry>,
        telemetry: Arc<RecordingSink>,
        _dir: tempfile::TempDir,
    }

    fn stack() -> Stack {
        let dir = tempfile::tempdir().unwrap();
        let telemetry: Arc<RecordingSink> = Arc::new(RecordingSink::new());
        let kinds = Arc::new(KindRegistry::new());
        let registry = Arc::new(Registry::new(kinds.clone(), telemetry.clone(), 8));
        let journal = Arc::new(EventJournal::new(dir.path(), telemetry.clone()));
        let bus = Arc::new(PubSub::new(64));
        let effects = Arc::new(EffectsEngine::new(
            Arc::new(FunctionRegistry::new()),
            Arc::new(StubProvider::new()),
            registry.clone(),
            telemetry.clone(),
            Duration::from_millis(10),
        ));
        let engine = TransitionEngine::new(
            registry.clone(),
            journal.clone(),
            bus.clone(),
            effects,
            telemetry.clone(),
        );
        Stack {
            engine,
            registry,
            journal,
            bus,
            kinds,
            telemetry,
            _dir: dir,
        }
    }

    fn door(kinds: &KindRegistry) -> Arc<FsmKind> {
        let kind = FsmKind::builder("Demo.Door")
            .states(["closed", "opening", "open", "closing"])
            .initial("closed")
            .transition("closed", "open_cmd", "opening")
            .transition("opening", "fully_open", "open")
            .transition("open", "close_cmd", "closing")
            .transition("closing", "fully_closed", "closed")
            .build()
            .unwrap();
        kinds.register(kind.clone()).unwrap();
        kind
    }

    fn spawn_instance(stack: &Stack, kind: &Arc<FsmKind>) -> Arc<FsmInstance> {
        let instance = FsmInstance::new(kind, DataMap::new(), None, Some("t1".into()));
        let registered = stack.registry.register(instance);
        stack.engine.initialize(kind, registered).unwrap()
    }

    #[tokio::test]
    async fn test_navigate_walks_the_table() {
        let s = stack();
        let kind = door(&s.kinds);
        let instance = spawn_instance(&s, &kind);

        let mut event_data = DataMap::new();
        event_data.insert("user".into(), json!("u"));
        let after = s
            .engine
            .navigate(&kind, instance, "open_cmd", &event_data)
            .unwrap();
        assert_eq!(after.current_state, "opening");
        assert_eq!(after.get("user"), Some(&json!("u")));
        assert_eq!(after.performance.transition_count, 1);
        assert_eq!(after.metadata.version, 2);

        let after = s
            .engine
            .navigate(&kind, after, "fully_open", &DataMap::new())
            .unwrap();
        assert_eq!(after.current_state, "open");

        let records = s.journal.list(&after.id).unwrap();
        assert_eq!(records.len(), 3); // created + 2 transitions
        assert_eq!(s.telemetry.count(TOPIC_TRANSITION), 2);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_a_noop() {
        let s = stack();
        let kind = door(&s.kinds);
        let instance = spawn_instance(&s, &kind);
        let mut rx = s.bus.subscribe("fsm:t1");
        let records_before = s.journal.list(&instance.id).unwrap().len();

        let err = s
            .engine
            .navigate(&kind, instance.clone(), "fully_open", &DataMap::new())
            .unwrap_err();
        assert!(matches!(err, FsmError::InvalidTransition { .. }));

        let current = s.registry.get(&instance.id).unwrap();
        assert_eq!(current.current_state, "closed");
        assert_eq!(current.metadata.version, instance.metadata.version);
        assert_eq!(s.journal.list(&instance.id).unwrap().len(), records_before);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_validation_rejection_is_a_noop() {
        let s = stack();
        let kind = FsmKind::builder("Demo.Gate")
            .states(["pending", "approved"])
            .initial("pending")
            .transition("pending", "approve", "approved")
            .validate(|instance, _event, event_data| {
                match event_data.get("user").and_then(|v| v.as_str()) {
                    Some(user) if !user.is_empty() => Ok(instance),
                    _ => Err("missing_user".to_string()),
                }
            })
            .build()
            .unwrap();
        s.kinds.register(kind.clone()).unwrap();
        let instance = spawn_instance(&s, &kind);

        let mut event_data = DataMap::new();
        event_data.insert("user".into(), json!(""));
        let err = s
            .engine
            .navigate(&kind, instance.clone(), "approve", &event_data)
            .unwrap_err();
        match err {
            FsmError::ValidationError { reason } => assert_eq!(reason, "missing_user"),
            other => panic!("expected ValidationError, got {other:?}"),
        }
        assert_eq!(
            s.registry.get(&instance.id).unwrap().current_state,
            "pending"
        );
        assert_eq!(s.journal.list(&instance.id).unwrap().len(), 1);

        // A valid user passes.
        event_data.insert("user".into(), json!("ada"));
        let after = s.engine.navigate(&kind, instance, "approve", &event_data).unwrap();
        assert_eq!(after.current_state, "approved");
    }

    #[tokio::test]
    async fn test_plugin_failure_aborts_with_registry_untouched() {
        struct VetoPlugin;
        impl Plugin for VetoPlugin {
            fn name(&self) -> &str {
                "veto"
            }
            fn before_transition(
                &self,
                _instance: FsmInstance,
                _ctx: &TransitionContext<'_>,
            ) -> Result<FsmInstance, String> {
                Err("vetoed".to_string())
            }
        }

        let s = stack();
        let kind = FsmKind::builder("Demo.Vetoed")
            .states(["a", "b"])
            .initial("a")
            .transition("a", "go", "b")
            .plugin(VetoPlugin, DataMap::new())
            .build()
            .unwrap();
        s.kinds.register(kind.clone()).unwrap();
        let instance = spawn_instance(&s, &kind);

        let err = s
            .engine
            .navigate(&kind, instance.clone(), "go", &DataMap::new())
            .unwrap_err();
        match err {
            FsmError::PluginFailed { plugin, reason } => {
                assert_eq!(plugin, "veto");
                assert_eq!(reason, "vetoed");
            }
            other => panic!("expected PluginFailed, got {other:?}"),
        }
        assert_eq!(s.registry.get(&instance.id).unwrap().current_state, "a");
        assert_eq!(s.journal.list(&instance.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_plugin_panic_is_converted() {
        struct PanicPlugin;
        impl Plugin for PanicPlugin {
            fn name(&self) -> &str {
                "panicky"
            }
            fn after_transition(
                &self,
                _instance: FsmInstance,
                _ctx: &TransitionContext<'_>,
            ) -> Result<FsmInstance, String> {
                panic!("plugin exploded");
            }
        }

        let s = stack();
        let kind = FsmKind::builder("Demo.Panicky")
            .states(["a", "b"])
            .initial("a")
            .transition("a", "go", "b")
            .plugin(PanicPlugin, DataMap::new())
            .build()
            .unwrap();
        s.kinds.register(kind.clone()).unwrap();
        let instance = spawn_instance(&s, &kind);

        let err = s
            .engine
            .navigate(&kind, instance.clone(), "go", &DataMap::new())
            .unwrap_err();
        match err {
            FsmError::PluginFailed { reason, .. } => assert!(reason.contains("exploded")),
            other => panic!("expected PluginFailed, got {other:?}"),
        }
        assert_eq!(s.registry.get(&instance.id).unwrap().current_state, "a");
    }

    #[tokio::test]
    async fn test_hook_panic_is_advisory() {
        let s = stack();
        let kind = FsmKind::builder("Demo.Hooky")
            .states(["a", "b"])
            .initial("a")
            .transition("a", "go", "b")
            .on_exit("a", |_| panic!("exit hook crashed"))
            .on_enter("b", |mut i| {
                i.put("entered", json!(true));
                i
            })
            .build()
            .unwrap();
        s.kinds.register(kind.clone()).unwrap();
        let instance = spawn_instance(&s, &kind);

        let after = s
            .engine
            .navigate(&kind, instance, "go", &DataMap::new())
            .unwrap();
        assert_eq!(after.current_state, "b");
        assert_eq!(after.get("entered"), Some(&json!(true)));
        assert_eq!(s.journal.list(&after.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_hooks_and_plugins_do_not_change_resolved_state() {
        let s = stack();
        let kind = FsmKind::builder("Demo.Meddler")
            .states(["a", "b", "c"])
            .initial("a")
            .transition("a", "go", "b")
            // A hook that tries to redirect the machine.
            .on_enter("b", |mut i| {
                i.current_state = "c".to_string();
                i
            })
            .build()
            .unwrap();
        s.kinds.register(kind.clone()).unwrap();
        let instance = spawn_instance(&s, &kind);

        let after = s
            .engine
            .navigate(&kind, instance, "go", &DataMap::new())
            .unwrap();
        // The journal records the table-resolved target regardless.
        let records = s.journal.list(&after.id).unwrap();
        match records.last().unwrap() {
            crate::journal::JournalRecord::Transition { to, .. } => assert_eq!(to, "b"),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_published_on_tenant_topic() {
        let s = stack();
        let kind = door(&s.kinds);
        let instance = spawn_instance(&s, &kind);
        let mut rx = s.bus.subscribe("fsm:t1");

        s.engine
            .navigate(&kind, instance.clone(), "open_cmd", &DataMap::new())
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, EVENT_STATE_CHANGED);
        assert_eq!(msg.payload["fsm_id"], json!(instance.id));
        assert_eq!(msg.payload["from"], json!("closed"));
        assert_eq!(msg.payload["to"], json!("opening"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_on_their_channel() {
        let s = stack();
        let kind = door(&s.kinds);
        let instance = spawn_instance(&s, &kind);

        let mut subscribed = (*instance).clone();
        subscribed.subscribers.insert("watcher-1".into());
        let instance = s.registry.update(subscribed);
        let mut rx = s.bus.subscribe("fsm:watcher-1");

        s.engine
            .navigate(&kind, instance, "open_cmd", &DataMap::new())
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload["to"], json!("opening"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_entering_new_state_cancels_old_effects() {
        let s = stack();
        let kind = FsmKind::builder("Demo.Fx")
            .states(["a", "b"])
            .initial("a")
            .transition("a", "go", "b")
            .effect(
                "a",
                Effect::sequence([
                    Effect::delay(5_000),
                    Effect::put_data("marker", json!("set")),
                ]),
            )
            .build()
            .unwrap();
        s.kinds.register(kind.clone()).unwrap();
        let instance = spawn_instance(&s, &kind);

        // Enter the initial state's effect by hand (creation does not
        // launch effects), then transition away within 100ms.
        let effects = Arc::new(EffectsEngine::new(
            Arc::new(FunctionRegistry::new()),
            Arc::new(StubProvider::new()),
            s.registry.clone(),
            s.telemetry.clone(),
            Duration::from_millis(10),
        ));
        let engine = TransitionEngine::new(
            s.registry.clone(),
            s.journal.clone(),
            s.bus.clone(),
            effects.clone(),
            s.telemetry.clone(),
        );
        effects.spawn_for_state(&kind, &instance, "a");
        tokio::time::sleep(Duration::from_millis(20)).await;

        engine.navigate(&kind, instance.clone(), "go", &DataMap::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let current = s.registry.get(&instance.id).unwrap();
        assert!(current.get("marker").is_none());
        assert!(s.telemetry.count(TOPIC_EFFECT_CANCELLED) >= 1);
    }

    #[tokio::test]
    async fn test_metrics_running_mean_over_transitions() {
        let s = stack();
        let kind = door(&s.kinds);
        let mut instance = spawn_instance(&s, &kind);

        for event in ["open_cmd", "fully_open", "close_cmd", "fully_closed"] {
            instance = s
                .engine
                .navigate(&kind, instance, event, &DataMap::new())
                .unwrap();
        }
        assert_eq!(instance.performance.transition_count, 4);
        assert!(instance.performance.avg_transition_time_us >= 0.0);
        assert!(instance.performance.last_transition_at.is_some());
    }
}
