//! In-memory instance registry.
//!
//! Three indexes - by id, by tenant, by kind - kept consistent on every
//! mutation. Reads are served from consistent snapshots (instances are
//! handed out as `Arc`); writes to a single instance are serialized through
//! a fixed pool of id-sharded locks, which gives the per-id ordering
//! guarantee without a global writer.
//!
//! The registry is authoritative for liveness only. Destroying an instance
//! removes it here; its journal records remain readable.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};

use crate::discovery::KindRegistry;
use crate::error::FsmError;
use crate::instance::{DataMap, FsmInstance};
use crate::snapshot::SnapshotStore;
use crate::telemetry::{TelemetryEvent, TelemetryHandle, TOPIC_BROADCAST};

/// Counters reported by [`Registry::stats`].
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Instances registered since startup.
    pub total_registered: u64,
    /// Instances unregistered since startup.
    pub total_unregistered: u64,
    /// Instances currently live.
    pub current_count: usize,
    /// Timestamp of the most recent mutation.
    pub last_activity: Option<DateTime<Utc>>,
}

/// Tenant- and kind-indexed registry of live instances.
pub struct Registry {
    by_id: DashMap<String, Arc<FsmInstance>>,
    by_tenant: DashMap<String, BTreeSet<String>>,
    by_kind: DashMap<String, BTreeSet<String>>,
    locks: Vec<AsyncMutex<()>>,
    kinds: Arc<KindRegistry>,
    telemetry: TelemetryHandle,
    total_registered: AtomicU64,
    total_unregistered: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl Registry {
    /// Create a registry with `shards` per-id write locks.
    pub fn new(kinds: Arc<KindRegistry>, telemetry: TelemetryHandle, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            by_id: DashMap::new(),
            by_tenant: DashMap::new(),
            by_kind: DashMap::new(),
            locks: (0..shards).map(|_| AsyncMutex::new(())).collect(),
            kinds,
            telemetry,
            total_registered: AtomicU64::new(0),
            total_unregistered: AtomicU64::new(0),
            last_activity: Mutex::new(None),
        }
    }

    /// The write lock serializing mutations for `id`.
    ///
    /// Everything that mutates a single instance (send_event, data updates,
    /// broadcast delivery) holds this lock for the duration of the step.
    pub fn lock_for(&self, id: &str) -> &AsyncMutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let shard = (hasher.finish() as usize) % self.locks.len();
        &self.locks[shard]
    }

    fn touch_activity(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());
    }

    fn tenant_key(tenant_id: Option<&str>) -> String {
        tenant_id.unwrap_or("no_tenant").to_string()
    }

    /// Insert a fresh instance into all three indexes.
    pub fn register(&self, instance: FsmInstance) -> Arc<FsmInstance> {
        let instance = Arc::new(instance);
        self.by_tenant
            .entry(Self::tenant_key(instance.tenant_id.as_deref()))
            .or_default()
            .insert(instance.id.clone());
        self.by_kind
            .entry(instance.kind_name.clone())
            .or_default()
            .insert(instance.id.clone());
        self.by_id.insert(instance.id.clone(), instance.clone());
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        self.touch_activity();
        debug!(fsm_id = %instance.id, kind = %instance.kind_name, "registered");
        instance
    }

    /// Current snapshot of an instance.
    pub fn get(&self, id: &str) -> Option<Arc<FsmInstance>> {
        self.by_id.get(id).map(|i| i.clone())
    }

    /// Replace an instance's snapshot after a mutation.
    ///
    /// Callers hold [`Registry::lock_for`] across the read-modify-write.
    pub fn update(&self, instance: FsmInstance) -> Arc<FsmInstance> {
        let instance = Arc::new(instance);
        self.by_id.insert(instance.id.clone(), instance.clone());
        self.touch_activity();
        instance
    }

    /// Mutate an instance's data map in place (version bumped).
    pub fn update_data(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut DataMap),
    ) -> Result<Arc<FsmInstance>, FsmError> {
        let current = self.get(id).ok_or_else(|| FsmError::NotFound {
            id: id.to_string(),
        })?;
        let mut next = (*current).clone();
        mutate(&mut next.data);
        next.metadata.touch();
        Ok(self.update(next))
    }

    /// Remove an instance from all three indexes.
    pub fn unregister(&self, id: &str) -> Option<Arc<FsmInstance>> {
        let (_, instance) = self.by_id.remove(id)?;
        let tenant_key = Self::tenant_key(instance.tenant_id.as_deref());
        if let Some(mut ids) = self.by_tenant.get_mut(&tenant_key) {
            ids.remove(id);
        }
        if let Some(mut ids) = self.by_kind.get_mut(&instance.kind_name) {
            ids.remove(id);
        }
        self.total_unregistered.fetch_add(1, Ordering::Relaxed);
        self.touch_activity();
        debug!(fsm_id = %id, "unregistered");
        Some(instance)
    }

    /// Snapshots of every instance owned by a tenant.
    pub fn list_by_tenant(&self, tenant_id: Option<&str>) -> Vec<Arc<FsmInstance>> {
        self.by_tenant
            .get(&Self::tenant_key(tenant_id))
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Snapshots of every instance of a kind.
    pub fn list_by_kind(&self, kind_name: &str) -> Vec<Arc<FsmInstance>> {
        self.by_kind
            .get(kind_name)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Snapshots of every live instance.
    pub fn list_all(&self) -> Vec<Arc<FsmInstance>> {
        self.by_id.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_unregistered: self.total_unregistered.load(Ordering::Relaxed),
            current_count: self.by_id.len(),
            last_activity: *self
                .last_activity
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Deliver an event to every registered instance (optionally one
    /// tenant's), invoking each kind's broadcast handler on an independent
    /// worker. Best-effort, fire-and-forget: no back-pressure, no delivery
    /// guarantee.
    ///
    /// Returns the number of instances a delivery was dispatched to.
    pub fn broadcast(
        self: &Arc<Self>,
        event_type: &str,
        event_data: &Value,
        tenant_id: Option<&str>,
    ) -> usize {
        let targets = match tenant_id {
            Some(_) => self.list_by_tenant(tenant_id),
            None => self.list_all(),
        };
        let mut notified = 0;
        for target in targets {
            let Some(kind) = self.kinds.get(&target.kind_name) else {
                continue;
            };
            if kind.broadcast_handler().is_none() {
                continue;
            }
            notified += 1;
            let registry = self.clone();
            let id = target.id.clone();
            let event_type = event_type.to_string();
            let event_data = event_data.clone();
            tokio::spawn(async move {
                registry.deliver_broadcast(&id, &event_type, &event_data).await;
            });
        }
        self.telemetry.emit(
            TelemetryEvent::new(TOPIC_BROADCAST)
                .opt_field("tenant_id", tenant_id)
                .field("subscribers_notified", notified as u64),
        );
        notified
    }

    /// Run one broadcast delivery under the target's write lock.
    pub(crate) async fn deliver_broadcast(&self, id: &str, event_type: &str, event_data: &Value) {
        let _guard = self.lock_for(id).lock().await;
        let Some(current) = self.get(id) else {
            return;
        };
        let Some(kind) = self.kinds.get(&current.kind_name) else {
            return;
        };
        let Some(handler) = kind.broadcast_handler() else {
            return;
        };
        let next = catch_unwind(AssertUnwindSafe(|| {
            handler((*current).clone(), event_type, event_data)
        }));
        match next {
            Ok(instance) => {
                self.update(instance);
            }
            Err(_) => {
                error!(fsm_id = %id, event_type, "broadcast handler panicked");
            }
        }
    }

    /// Rehydrate instances from snapshots on disk.
    ///
    /// Instances whose kind is unknown or whose id is already live are
    /// skipped. The journal is not replayed here; that is the replay tool's
    /// job. Returns the number of instances restored.
    pub fn reload_from_disk(&self, store: &SnapshotStore) -> usize {
        let mut restored = 0;
        let snapshots = match store.load_all() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(error = %e, "snapshot reload failed");
                return 0;
            }
        };
        for snapshot in snapshots {
            if self.by_id.contains_key(&snapshot.id) {
                continue;
            }
            if self.kinds.get(&snapshot.kind_name).is_none() {
                error!(
                    fsm_id = %snapshot.id,
                    kind = %snapshot.kind_name,
                    "snapshot references unregistered kind; skipping"
                );
                continue;
            }
            self.register(snapshot);
            restored += 1;
        }
        restored
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("current_count", &self.by_id.len())
            .field("tenants", &self.by_tenant.len())
            .field("kinds", &self.by_kind.len())
            .finish()
    }
}
