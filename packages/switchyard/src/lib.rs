//! # Switchyard
//!
//! A multi-tenant finite-state-machine runtime where kinds declare,
//! engines transition, and effects execute.
//!
//! ## Core Concepts
//!
//! Switchyard separates **declaration** from **execution**:
//! - [`FsmKind`] = the compiled, immutable machine definition (states,
//!   transitions, hooks, validations, components, plugins, effects)
//! - [`FsmInstance`] = a live mutable value of a kind, owned by a tenant
//! - [`Effect`] = a declarative side-effect tree, cancelled on state exit
//!
//! The key principle: **the transition table decides, everything else
//! observes**. Hooks, plugins, and effects never change the resolved
//! target state.
//!
//! ## Architecture
//!
//! ```text
//! Caller
//!     │
//!     ▼ send_event()
//! FsmManager ──► Registry lookup (per-id serialized)
//!     │
//!     ▼
//! TransitionEngine
//!     │  validate → pre-plugins → exit hooks → state change
//!     │  → enter hooks → post-plugins → metrics
//!     │
//!     ├──► EventJournal.append ──► data/<tenant>/events/.../DD.jsonl
//!     ├──► PubSub.publish ──────► fsm:<tenant_id>
//!     └──► EffectsEngine ───────► cancel (fsm_id, old_state)
//!                                 spawn  (fsm_id, new_state)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **First match wins** - duplicate `(from, event)` pairs resolve
//!    later-added-shadows-earlier, locals last
//! 2. **Transitions are atomic to observers** - readers see pre- or
//!    post-transition state, never an intermediate
//! 3. **One record per transition** - the journal is append-only with a
//!    process-wide monotonic `seq`
//! 4. **Invalid events are no-ops** - no state change, no record, no
//!    broadcast
//! 5. **Effects are scoped to their state** - entering a new state cancels
//!    the previous state's effect tree
//!
//! ## Example
//!
//! ```ignore
//! use switchyard::{DataMap, Effect, FsmKind, FsmManager, RuntimeConfig};
//!
//! let door = FsmKind::builder("Demo.Door")
//!     .states(["closed", "opening", "open", "closing"])
//!     .initial("closed")
//!     .transition("closed", "open_cmd", "opening")
//!     .transition("opening", "fully_open", "open")
//!     .transition("open", "close_cmd", "closing")
//!     .transition("closing", "fully_closed", "closed")
//!     .effect("opening", Effect::sequence([
//!         Effect::delay(250),
//!         Effect::put_data("motor", serde_json::json!("running")),
//!     ]))
//!     .build()?;
//!
//! let manager = FsmManager::builder(RuntimeConfig::from_env())
//!     .kind(door)
//!     .build()?;
//!
//! let id = manager.create_fsm("Demo.Door", DataMap::new(), Some("t1")).await?;
//! manager.send_event(&id, "open_cmd", DataMap::new()).await?;
//! ```
//!
//! ## What This Is Not
//!
//! Switchyard is **not**:
//! - A wall-clock job scheduler
//! - A cross-node consensus system (the journal is the cross-process
//!   contract)
//! - A payload schema validator beyond user-declared validators
//! - A distributed transaction coordinator (compensation is scoped to one
//!   effect tree)

// Core modules
mod breaker;
mod bus;
mod config;
mod discovery;
mod effect;
mod engine;
mod error;
mod executor;
mod instance;
mod journal;
mod kind;
mod manager;
mod plugin;
mod provider;
mod registry;
mod snapshot;
mod telemetry;


// Re-export kind declaration types
pub use kind::{
    module_short_name, BroadcastHook, FsmKind, Hook, InstalledPlugin, KindBuilder, Transition,
    Validation,
};

// Re-export instance types
pub use instance::{DataMap, FsmInstance, InstanceMetadata, PerfCounters};

// Re-export plugin types
pub use plugin::{AuditPlugin, AuditRecord, AuditTrail, LoggerPlugin, Plugin, TransitionContext};

// Re-export effect types
pub use effect::{
    Backoff, BreakerOptions, ComplexityClass, Effect, LogLevel, RetryOptions, SagaStep, UpdateFn,
};

// Re-export the effects engine
pub use executor::{CancelFlag, EffectCtx, EffectsEngine};

// Re-export breaker introspection types
pub use breaker::{BreakerDecision, BreakerState, BreakerTable};

// Re-export provider seams
pub use provider::{AiProvider, EffectFunction, FunctionRegistry, StubProvider};

// Re-export journal types
pub use journal::{replay_state, sanitize_id, EventJournal, JournalRecord};

// Re-export snapshot store
pub use snapshot::SnapshotStore;

// Re-export registry types
pub use registry::{Registry, RegistryStats};

// Re-export the transition engine
pub use engine::TransitionEngine;

// Re-export manager types (primary entry point)
pub use manager::{CreateOptions, FsmManager, ManagerBuilder, ManagerStats};

// Re-export discovery types
pub use discovery::{KindInfo, KindRegistry};

// Re-export pub/sub types
pub use bus::{tenant_topic, BusMessage, PubSub};

// Re-export telemetry types
pub use telemetry::{
    NullSink, RecordingSink, TelemetryEvent, TelemetryHandle, TelemetrySink, TracingSink,
};

// Re-export error types
pub use error::{DefineError, EffectError, FsmError, JournalError, SnapshotError};

// Re-export runtime configuration
pub use config::RuntimeConfig;

// Re-export commonly used external types
pub use async_trait::async_trait;
