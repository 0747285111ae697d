//! The manager - thin orchestration API over the runtime components.
//!
//! Everything a hosting process needs goes through here: create and destroy
//! instances, send events, read state and metrics, batch operations,
//! subscriptions, broadcast, named effects, reload. The manager owns the
//! wiring (registry, journal, bus, effects engine, transition engine,
//! snapshot store) and converts every lower-layer failure into a tagged
//! [`FsmError`]; nothing panics across this boundary.
//!
//! # Example
//!
//! ```ignore
//! let manager = FsmManager::builder(RuntimeConfig::default())
//!     .kind(door_kind)
//!     .build()?;
//!
//! let id = manager.create_fsm("Demo.Door", DataMap::new(), Some("t1")).await?;
//! manager.send_event(&id, "open_cmd", DataMap::new()).await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::bus::{tenant_topic, PubSub, EVENT_CREATED, EVENT_DESTROYED};
use crate::config::RuntimeConfig;
use crate::discovery::{KindInfo, KindRegistry};
use crate::engine::TransitionEngine;
use crate::error::{DefineError, FsmError};
use crate::executor::EffectsEngine;
use crate::instance::{DataMap, FsmInstance, PerfCounters};
use crate::journal::{replay_state, EventJournal};
use crate::kind::FsmKind;
use crate::provider::{AiProvider, FunctionRegistry, StubProvider};
use crate::registry::{Registry, RegistryStats};
use crate::snapshot::SnapshotStore;
use crate::telemetry::{TelemetryHandle, TracingSink};

/// Options for [`FsmManager::create_fsm_with_options`].
#[derive(Debug, Default, Clone)]
pub struct CreateOptions {
    /// Explicit instance id; generated when absent.
    pub id: Option<String>,
    /// Tags recorded in the instance metadata.
    pub tags: Vec<String>,
}

/// Manager counters merged with registry stats.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    /// Instances created through this manager.
    pub fsms_created: u64,
    /// Instances destroyed through this manager.
    pub fsms_destroyed: u64,
    /// Events accepted (transition succeeded).
    pub events_sent: u64,
    /// Events rejected or failed.
    pub events_failed: u64,
    /// Registry counters.
    pub registry: RegistryStats,
}

/// Builder wiring the runtime together.
pub struct ManagerBuilder {
    config: RuntimeConfig,
    telemetry: TelemetryHandle,
    provider: Arc<dyn AiProvider>,
    functions: Arc<FunctionRegistry>,
    kinds: Vec<Arc<FsmKind>>,
}

impl ManagerBuilder {
    fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            telemetry: Arc::new(TracingSink),
            provider: Arc::new(StubProvider::new()),
            functions: Arc::new(FunctionRegistry::new()),
            kinds: Vec::new(),
        }
    }

    /// Replace the telemetry sink.
    pub fn telemetry(mut self, telemetry: TelemetryHandle) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Replace the AI provider backing the AI effect leaves.
    pub fn provider(mut self, provider: Arc<dyn AiProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Replace the function registry backing `call` leaves.
    pub fn functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    /// Register a kind.
    pub fn kind(mut self, kind: Arc<FsmKind>) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Wire everything together.
    pub fn build(self) -> Result<Arc<FsmManager>, DefineError> {
        let kinds = Arc::new(KindRegistry::new());
        for kind in self.kinds {
            kinds.register(kind)?;
        }
        let registry = Arc::new(Registry::new(
            kinds.clone(),
            self.telemetry.clone(),
            self.config.lock_shards,
        ));
        let journal = Arc::new(EventJournal::new(
            &self.config.data_dir,
            self.telemetry.clone(),
        ));
        let bus = Arc::new(PubSub::new(self.config.bus_capacity));
        let effects = Arc::new(EffectsEngine::new(
            self.functions,
            self.provider,
            registry.clone(),
            self.telemetry.clone(),
            self.config.effect_cancel_grace,
        ));
        let engine = TransitionEngine::new(
            registry.clone(),
            journal.clone(),
            bus.clone(),
            effects.clone(),
            self.telemetry.clone(),
        );
        let snapshots = SnapshotStore::new(&self.config.data_dir);
        Ok(Arc::new(FsmManager {
            config: self.config,
            kinds,
            registry,
            journal,
            bus,
            effects,
            engine,
            snapshots,
            fsms_created: AtomicU64::new(0),
            fsms_destroyed: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
        }))
    }
}

/// Public lifecycle API for a switchyard runtime.
pub struct FsmManager {
    config: RuntimeConfig,
    kinds: Arc<KindRegistry>,
    registry: Arc<Registry>,
    journal: Arc<EventJournal>,
    bus: Arc<PubSub>,
    effects: Arc<EffectsEngine>,
    engine: TransitionEngine,
    snapshots: SnapshotStore,
    fsms_created: AtomicU64,
    fsms_destroyed: AtomicU64,
    events_sent: AtomicU64,
    events_failed: AtomicU64,
}

impl FsmManager {
    /// Start wiring a manager.
    pub fn builder(config: RuntimeConfig) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    /// The pub/sub bus (subscribe to `fsm:<tenant>` topics here).
    pub fn bus(&self) -> &Arc<PubSub> {
        &self.bus
    }

    /// The event journal.
    pub fn journal(&self) -> &Arc<EventJournal> {
        &self.journal
    }

    /// The effects engine (for wiring functions or cancelling out-of-band).
    pub fn effects(&self) -> &Arc<EffectsEngine> {
        &self.effects
    }

    /// Register a kind after construction.
    pub fn register_kind(&self, kind: Arc<FsmKind>) -> Result<(), DefineError> {
        self.kinds.register(kind)
    }

    /// Discovery: every registered kind with introspection metadata.
    pub fn list_kinds(&self) -> Vec<KindInfo> {
        self.kinds.list_kinds()
    }

    /// Create an instance of a kind. Returns its id.
    pub async fn create_fsm(
        &self,
        kind_name: &str,
        initial_data: DataMap,
        tenant_id: Option<&str>,
    ) -> Result<String, FsmError> {
        self.create_fsm_with_options(kind_name, initial_data, tenant_id, CreateOptions::default())
            .await
    }

    /// Create an instance with an explicit id or tags.
    pub async fn create_fsm_with_options(
        &self,
        kind_name: &str,
        initial_data: DataMap,
        tenant_id: Option<&str>,
        options: CreateOptions,
    ) -> Result<String, FsmError> {
        let kind = self.lookup_kind(kind_name)?;
        let mut instance = FsmInstance::new(
            &kind,
            initial_data,
            options.id,
            tenant_id.map(String::from),
        );
        instance.metadata.tags = options.tags;
        let id = instance.id.clone();

        let _guard = self.registry.lock_for(&id).lock().await;
        // Registration precedes any side effect.
        let registered = self.registry.register(instance);
        let initialized = self.engine.initialize(&kind, registered)?;

        if let Err(e) = self.snapshots.save(&initialized) {
            warn!(fsm_id = %id, error = %e, "snapshot save failed after create");
        }
        self.bus.publish(
            &tenant_topic(tenant_id),
            EVENT_CREATED,
            json!({
                "fsm_id": id,
                "kind": kind.name(),
                "tenant_id": tenant_id,
                "initial_state": initialized.current_state,
            }),
        );
        self.fsms_created.fetch_add(1, Ordering::Relaxed);
        info!(fsm_id = %id, kind = %kind.name(), "fsm created");
        Ok(id)
    }

    /// Destroy an instance: unregister, cancel its effects, drop its
    /// snapshot. Journal records remain readable.
    pub async fn destroy_fsm(&self, id: &str) -> Result<(), FsmError> {
        let _guard = self.registry.lock_for(id).lock().await;
        let instance = self
            .registry
            .unregister(id)
            .ok_or_else(|| FsmError::NotFound { id: id.to_string() })?;
        self.effects.cancel_effects(id);
        if let Err(e) = self.snapshots.remove(&instance) {
            warn!(fsm_id = %id, error = %e, "snapshot removal failed");
        }
        self.bus.publish(
            &tenant_topic(instance.tenant_id.as_deref()),
            EVENT_DESTROYED,
            json!({"fsm_id": id, "kind": instance.kind_name}),
        );
        self.fsms_destroyed.fetch_add(1, Ordering::Relaxed);
        info!(fsm_id = %id, "fsm destroyed");
        Ok(())
    }

    /// Drive an instance with an event.
    ///
    /// Writes for one id are serialized in arrival order; waiting longer
    /// than the configured navigate ceiling for that slot yields
    /// `FsmError::Timeout`.
    pub async fn send_event(
        &self,
        id: &str,
        event: &str,
        event_data: DataMap,
    ) -> Result<Arc<FsmInstance>, FsmError> {
        validate_event_name(event)?;
        let lock = self.registry.lock_for(id);
        let _guard = match timeout(self.config.navigate_timeout, lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.events_failed.fetch_add(1, Ordering::Relaxed);
                return Err(FsmError::Timeout {
                    ms: self.config.navigate_timeout.as_millis() as u64,
                });
            }
        };

        let result = self
            .registry
            .get(id)
            .ok_or_else(|| FsmError::NotFound { id: id.to_string() })
            .and_then(|instance| {
                let kind = self.lookup_kind(&instance.kind_name)?;
                self.engine.navigate(&kind, instance, event, &event_data)
            });

        match &result {
            Ok(instance) => {
                self.events_sent.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.snapshots.save(instance) {
                    warn!(fsm_id = %id, error = %e, "snapshot save failed after transition");
                }
            }
            Err(_) => {
                self.events_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Send a batch of events in order. Observationally equivalent to the
    /// same `send_event` calls made sequentially.
    pub async fn batch_send_events(
        &self,
        events: Vec<(String, String, DataMap)>,
    ) -> Vec<Result<Arc<FsmInstance>, FsmError>> {
        let mut results = Vec::with_capacity(events.len());
        for (id, event, event_data) in events {
            results.push(self.send_event(&id, &event, event_data).await);
        }
        results
    }

    /// Current snapshot of an instance.
    pub fn get_fsm_state(&self, id: &str) -> Result<Arc<FsmInstance>, FsmError> {
        self.registry
            .get(id)
            .ok_or_else(|| FsmError::NotFound { id: id.to_string() })
    }

    /// Perf counters for an instance.
    pub fn get_fsm_metrics(&self, id: &str) -> Result<PerfCounters, FsmError> {
        Ok(self.get_fsm_state(id)?.performance.clone())
    }

    /// Shallow-merge a patch into an instance's data map.
    pub async fn update_fsm_data(
        &self,
        id: &str,
        patch: DataMap,
    ) -> Result<Arc<FsmInstance>, FsmError> {
        let _guard = self.registry.lock_for(id).lock().await;
        let updated = self.registry.update_data(id, |data| {
            for (key, value) in patch {
                data.insert(key, value);
            }
        })?;
        if let Err(e) = self.snapshots.save(&updated) {
            warn!(fsm_id = %id, error = %e, "snapshot save failed after data update");
        }
        Ok(updated)
    }

    /// Every live instance owned by a tenant.
    pub fn get_tenant_fsms(&self, tenant_id: Option<&str>) -> Vec<Arc<FsmInstance>> {
        self.registry.list_by_tenant(tenant_id)
    }

    /// Manager counters merged with registry stats.
    pub fn get_stats(&self) -> ManagerStats {
        ManagerStats {
            fsms_created: self.fsms_created.load(Ordering::Relaxed),
            fsms_destroyed: self.fsms_destroyed.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            registry: self.registry.stats(),
        }
    }

    /// Run one of the kind's named effect trees to completion.
    pub async fn run_named_effect(&self, id: &str, name: &str) -> Result<Value, FsmError> {
        let instance = self.get_fsm_state(id)?;
        let kind = self.lookup_kind(&instance.kind_name)?;
        self.effects
            .run_named(&kind, &instance, name)
            .await
            .map_err(FsmError::from)
    }

    /// Subscribe `subscriber_id` to an instance's state changes; messages
    /// arrive on topic `fsm:<subscriber_id>`.
    pub async fn subscribe(&self, id: &str, subscriber_id: &str) -> Result<(), FsmError> {
        self.edit_subscribers(id, |subs| {
            subs.insert(subscriber_id.to_string());
        })
        .await
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, id: &str, subscriber_id: &str) -> Result<(), FsmError> {
        self.edit_subscribers(id, |subs| {
            subs.remove(subscriber_id);
        })
        .await
    }

    async fn edit_subscribers(
        &self,
        id: &str,
        edit: impl FnOnce(&mut std::collections::BTreeSet<String>),
    ) -> Result<(), FsmError> {
        let _guard = self.registry.lock_for(id).lock().await;
        let current = self
            .registry
            .get(id)
            .ok_or_else(|| FsmError::NotFound { id: id.to_string() })?;
        let mut next = (*current).clone();
        edit(&mut next.subscribers);
        self.registry.update(next);
        Ok(())
    }

    /// Deliver an event to every registered instance (optionally scoped to
    /// one tenant) via its kind's broadcast handler. Best-effort.
    pub fn broadcast(
        &self,
        event_type: &str,
        event_data: &Value,
        tenant_id: Option<&str>,
    ) -> usize {
        self.registry.broadcast(event_type, event_data, tenant_id)
    }

    /// Rehydrate instances from snapshots. Returns how many were restored.
    pub fn reload_from_disk(&self) -> usize {
        self.registry.reload_from_disk(&self.snapshots)
    }

    /// Derive an instance's final state by replaying its journal records
    /// through the reference interpreter (no hooks, no plugins).
    pub fn replay(&self, id: &str) -> Result<Option<String>, FsmError> {
        let records = self.journal.list(id).map_err(|e| FsmError::Unexpected {
            detail: e.to_string(),
        })?;
        Ok(replay_state(&records))
    }

    fn lookup_kind(&self, name: &str) -> Result<Arc<FsmKind>, FsmError> {
        self.kinds.get(name).ok_or_else(|| FsmError::UnknownModule {
            name: name.to_string(),
        })
    }
}

impl std::fmt::Debug for FsmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsmManager")
            .field("kinds", &self.kinds.len())
            .field("instances", &self.registry.stats().current_count)
            .finish_non_exhaustive()
    }
}

fn validate_event_name(event: &str) -> Result<(), FsmError> {
    let valid = !event.is_empty()
        && event
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(FsmError::InvalidEventName {
            name: event.to_string(),
        })
    }
}
