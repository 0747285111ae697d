//! Effect execution.
//!
//! The effects engine interprets [`Effect`] trees on spawned workers, keyed
//! by `(fsm_id, state)`. Entering a new state cancels the previous state's
//! execution; cancellation is cooperative first (every cancellable primitive
//! observes the flag) and forced after a short grace period.
//!
//! Effect results never touch FSM state directly. An effect that wants the
//! next transition to see something writes it into the instance `data` map
//! through the data leaves; everything else lives in telemetry.
//!
//! # Cancellation
//!
//! Every running execution registers a [`CancelFlag`]. `cancel_state` and
//! `cancel_effects` flip the flag and notify waiters; workers translate it
//! into `EffectError::Cancelled` at the next cancellation point. A worker
//! that has not finished when the grace period elapses is aborted.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::{join_all, select_all};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::breaker::{BreakerDecision, BreakerState, BreakerTable};
use crate::effect::{Effect, LogLevel, SagaStep};
use crate::error::EffectError;
use crate::instance::{DataMap, FsmInstance};
use crate::kind::FsmKind;
use crate::provider::{AiProvider, FunctionRegistry};
use crate::registry::Registry;
use crate::telemetry::{
    TelemetryEvent, TelemetryHandle, TOPIC_EFFECT_CANCELLED, TOPIC_EFFECT_CIRCUIT_BREAKER,
    TOPIC_EFFECT_COMPLETED, TOPIC_EFFECT_COMPOSITION, TOPIC_EFFECT_FAILED, TOPIC_EFFECT_RETRY,
    TOPIC_EFFECT_STARTED, TOPIC_EFFECT_TIMEOUT,
};

// =============================================================================
// Cancellation
// =============================================================================

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// One-way cancellation flag shared by an execution's nodes.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<CancelInner>);

impl CancelFlag {
    /// Create an uncancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake waiters.
    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        // Register interest before the re-check so a cancel between the
        // check and the await cannot be missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelFlag")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Execution context
// =============================================================================

/// Context threaded through one effect execution.
#[derive(Clone)]
pub struct EffectCtx {
    /// Process-wide monotonic execution id.
    pub execution_id: u64,
    /// The instance the execution belongs to.
    pub fsm_id: String,
    /// Owning tenant, if any.
    pub tenant_id: Option<String>,
    /// State the instance was in when the execution launched.
    pub state_at_start: String,
    kind: Arc<FsmKind>,
    cancel: CancelFlag,
}

impl EffectCtx {
    /// Has this execution been cancelled?
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct RunningEffect {
    execution_id: u64,
    cancel: CancelFlag,
    abort: AbortHandle,
}

type EffectFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, EffectError>> + Send + 'a>>;

// =============================================================================
// Engine
// =============================================================================

/// Interprets effect trees with cancellation keyed by `(fsm_id, state)`.
pub struct EffectsEngine {
    functions: Arc<FunctionRegistry>,
    provider: Arc<dyn AiProvider>,
    registry: Arc<Registry>,
    breakers: BreakerTable,
    running: DashMap<(String, String), RunningEffect>,
    telemetry: TelemetryHandle,
    next_execution_id: AtomicU64,
    cancel_grace: Duration,
}

impl EffectsEngine {
    /// Create an engine.
    pub fn new(
        functions: Arc<FunctionRegistry>,
        provider: Arc<dyn AiProvider>,
        registry: Arc<Registry>,
        telemetry: TelemetryHandle,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            functions,
            provider,
            registry,
            breakers: BreakerTable::new(),
            running: DashMap::new(),
            telemetry,
            next_execution_id: AtomicU64::new(0),
            cancel_grace,
        }
    }

    /// The registered function table (for embedder wiring).
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Breaker table (for introspection and tests).
    pub fn breakers(&self) -> &BreakerTable {
        &self.breakers
    }

    /// Number of executions currently registered for an instance.
    pub fn running_count(&self, fsm_id: &str) -> usize {
        self.running
            .iter()
            .filter(|entry| entry.key().0 == fsm_id)
            .count()
    }

    /// Launch the entry effect for `state`, if the kind declares one.
    ///
    /// Non-blocking: the tree runs on a spawned worker. Any execution
    /// already registered under `(fsm_id, state)` is cancelled first.
    pub fn spawn_for_state(
        self: &Arc<Self>,
        kind: &Arc<FsmKind>,
        instance: &FsmInstance,
        state: &str,
    ) {
        let Some(effect) = kind.effect_for(state) else {
            return;
        };
        let _ = self.spawn_execution(kind, instance, state.to_string(), effect.clone());
    }

    /// Run a named effect tree to completion.
    ///
    /// The execution is registered under `(fsm_id, "named:<name>")` so
    /// `cancel_effects` reaches it like any state execution.
    pub async fn run_named(
        self: &Arc<Self>,
        kind: &Arc<FsmKind>,
        instance: &FsmInstance,
        name: &str,
    ) -> Result<Value, EffectError> {
        let Some(effect) = kind.named_effect(name) else {
            return Err(EffectError::ValidationFailed {
                detail: format!("unknown named effect '{name}'"),
            });
        };
        let handle =
            self.spawn_execution(kind, instance, format!("named:{name}"), effect.clone());
        match handle.await {
            Ok(result) => result,
            // The worker was aborted after a cancel.
            Err(_) => Err(EffectError::Cancelled),
        }
    }

    /// Cancel the execution registered under `(fsm_id, state)`.
    pub fn cancel_state(&self, fsm_id: &str, state: &str) {
        self.cancel_key(&(fsm_id.to_string(), state.to_string()));
    }

    /// Cancel every execution registered for an instance.
    pub fn cancel_effects(&self, fsm_id: &str) {
        let keys: Vec<_> = self
            .running
            .iter()
            .filter(|entry| entry.key().0 == fsm_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.cancel_key(&key);
        }
    }

    fn cancel_key(&self, key: &(String, String)) {
        if let Some((_, entry)) = self.running.remove(key) {
            debug!(fsm_id = %key.0, state = %key.1, execution_id = entry.execution_id, "cancelling effect");
            entry.cancel.cancel();
            let abort = entry.abort;
            let grace = self.cancel_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                // No-op if the worker wound down cooperatively.
                abort.abort();
            });
        }
    }

    fn spawn_execution(
        self: &Arc<Self>,
        kind: &Arc<FsmKind>,
        instance: &FsmInstance,
        key_state: String,
        effect: Effect,
    ) -> JoinHandle<Result<Value, EffectError>> {
        let execution_id = self.next_execution_id.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = EffectCtx {
            execution_id,
            fsm_id: instance.id.clone(),
            tenant_id: instance.tenant_id.clone(),
            state_at_start: key_state.clone(),
            kind: kind.clone(),
            cancel: CancelFlag::new(),
        };
        let key = (instance.id.clone(), key_state);

        // Replace any execution already keyed here.
        self.cancel_key(&key);

        self.telemetry.emit(
            TelemetryEvent::new(TOPIC_EFFECT_STARTED)
                .field("execution_id", execution_id)
                .field("effect_type", effect.effect_type())
                .field("fsm_id", ctx.fsm_id.as_str())
                .opt_field("tenant_id", ctx.tenant_id.as_deref())
                .field("state", ctx.state_at_start.as_str()),
        );

        let engine = self.clone();
        let worker_key = key.clone();
        let worker_ctx = ctx.clone();
        // The worker must not deregister itself before it is registered.
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = ready_rx.await;
            let started = Instant::now();
            let result = match effect.validate() {
                Ok(()) => {
                    engine
                        .run_tree(&effect, &worker_ctx, Value::String(String::new()))
                        .await
                }
                Err(e) => Err(e),
            };
            let duration_us = started.elapsed().as_micros() as u64;
            let event = |topic| {
                TelemetryEvent::new(topic)
                    .field("execution_id", execution_id)
                    .field("effect_type", effect.effect_type())
                    .field("fsm_id", worker_ctx.fsm_id.as_str())
                    .opt_field("tenant_id", worker_ctx.tenant_id.as_deref())
                    .field("duration_us", duration_us)
            };
            match &result {
                Ok(_) => engine.telemetry.emit(event(TOPIC_EFFECT_COMPLETED)),
                Err(EffectError::Cancelled) => {
                    engine.telemetry.emit(event(TOPIC_EFFECT_CANCELLED))
                }
                Err(e) => {
                    warn!(
                        fsm_id = %worker_ctx.fsm_id,
                        execution_id,
                        error = %e,
                        "effect failed"
                    );
                    engine
                        .telemetry
                        .emit(event(TOPIC_EFFECT_FAILED).field("error", e.tag()));
                }
            }
            engine
                .running
                .remove_if(&worker_key, |_, entry| entry.execution_id == execution_id);
            result
        });

        self.running.insert(
            key,
            RunningEffect {
                execution_id,
                cancel: ctx.cancel.clone(),
                abort: handle.abort_handle(),
            },
        );
        let _ = ready_tx.send(());
        handle
    }

    // =========================================================================
    // Interpreter
    // =========================================================================

    /// Interpret one tree node. `last` carries the previous sibling's result
    /// inside a sequence and is `""` elsewhere.
    fn run_tree<'a>(
        &'a self,
        effect: &'a Effect,
        ctx: &'a EffectCtx,
        last: Value,
    ) -> EffectFuture<'a> {
        Box::pin(async move {
            if ctx.cancel.is_cancelled() {
                return Err(EffectError::Cancelled);
            }
            match effect {
                Effect::Literal(value) => Ok(value.clone()),
                Effect::GetResult => Ok(last),
                Effect::Delay { ms } => self.run_delay(ctx, *ms).await,
                Effect::Log { level, message } => {
                    self.run_log(ctx, *level, message);
                    Ok(json!("logged"))
                }
                Effect::PutData { key, value } => {
                    self.mutate_data(ctx, |data| {
                        data.insert(key.clone(), value.clone());
                    })
                    .await?;
                    Ok(value.clone())
                }
                Effect::GetData { key } => {
                    let value = self.read_data(ctx, key).await?;
                    Ok(value.unwrap_or_else(|| Value::String(String::new())))
                }
                Effect::GetDataStrict { key } => {
                    self.read_data(ctx, key)
                        .await?
                        .ok_or_else(|| EffectError::ValidationFailed {
                            detail: format!("missing data key '{key}'"),
                        })
                }
                Effect::MergeData { map } => {
                    self.mutate_data(ctx, |data| {
                        for (key, value) in map {
                            data.insert(key.clone(), value.clone());
                        }
                    })
                    .await?;
                    Ok(json!("merged"))
                }
                Effect::UpdateData { key, func } => {
                    let func = func.clone();
                    let key_owned = key.clone();
                    let mut updated = Value::Null;
                    self.mutate_data(ctx, |data| {
                        let old = data
                            .get(&key_owned)
                            .cloned()
                            .unwrap_or_else(|| Value::String(String::new()));
                        let new = (func.0)(old);
                        updated = new.clone();
                        data.insert(key_owned.clone(), new);
                    })
                    .await?;
                    Ok(updated)
                }
                Effect::Call {
                    target,
                    function,
                    args,
                } => self.run_call(ctx, target, function, args, last).await,
                Effect::CallLlm { config } => {
                    effect.validate()?;
                    self.run_provider(ctx, self.provider.call_llm(config)).await
                }
                Effect::EmbedText { config } => {
                    self.run_provider(ctx, self.provider.embed_text(config)).await
                }
                Effect::VectorSearch { config } => {
                    self.run_provider(ctx, self.provider.vector_search(config))
                        .await
                }
                Effect::InvokeAgent { config } => {
                    self.run_provider(ctx, self.provider.invoke_agent(config))
                        .await
                }
                Effect::CoordinateAgents { agents } => {
                    effect.validate()?;
                    self.run_provider(ctx, self.provider.coordinate_agents(agents))
                        .await
                }
                Effect::RagPipeline { config } => {
                    self.run_provider(ctx, self.provider.rag_pipeline(config))
                        .await
                }
                Effect::Named { name } => match ctx.kind.named_effect(name) {
                    Some(named) => self.run_tree(named, ctx, last).await,
                    None => Err(EffectError::ValidationFailed {
                        detail: format!("unknown named effect '{name}'"),
                    }),
                },
                Effect::Sequence(children) => self.run_sequence(ctx, children, last).await,
                Effect::Parallel(children) => self.run_parallel(ctx, children).await,
                Effect::Race(children) => self.run_race(ctx, children).await,
                Effect::Retry { child, options } => {
                    self.run_retry(ctx, child, options, last).await
                }
                Effect::Timeout { child, ms } => self.run_timeout(ctx, child, *ms, last).await,
                Effect::WithCompensation {
                    action,
                    compensation,
                } => self.run_with_compensation(ctx, action, compensation, last).await,
                Effect::CircuitBreaker { child, options } => {
                    self.run_circuit_breaker(ctx, child, options, last).await
                }
                Effect::Saga(steps) => self.run_saga(ctx, steps).await,
            }
        })
    }

    async fn run_delay(&self, ctx: &EffectCtx, ms: u64) -> Result<Value, EffectError> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(EffectError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!("delayed")),
        }
    }

    fn run_log(&self, ctx: &EffectCtx, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(fsm_id = %ctx.fsm_id, "{message}"),
            LogLevel::Info => info!(fsm_id = %ctx.fsm_id, "{message}"),
            LogLevel::Warn => warn!(fsm_id = %ctx.fsm_id, "{message}"),
            LogLevel::Error => error!(fsm_id = %ctx.fsm_id, "{message}"),
        }
    }

    async fn run_call(
        &self,
        ctx: &EffectCtx,
        target: &str,
        function: &str,
        args: &[Effect],
        last: Value,
    ) -> Result<Value, EffectError> {
        let mut resolved = Vec::with_capacity(args.len());
        for arg in args {
            resolved.push(self.run_tree(arg, ctx, last.clone()).await?);
        }
        let f = self.functions.get(target, function).ok_or_else(|| {
            EffectError::FunctionNotExported {
                target: format!("{target}.{function}"),
            }
        })?;

        let invocation = std::panic::AssertUnwindSafe(f(resolved)).catch_unwind();
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(EffectError::Cancelled),
            outcome = invocation => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(EffectError::CallFailed {
                    detail: e.to_string(),
                }),
                Err(_) => Err(EffectError::CallFailed {
                    detail: format!("{target}.{function} panicked"),
                }),
            },
        }
    }

    async fn run_provider<F>(&self, ctx: &EffectCtx, call: F) -> Result<Value, EffectError>
    where
        F: Future<Output = Result<Value, EffectError>>,
    {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(EffectError::Cancelled),
            result = call => result,
        }
    }

    async fn run_sequence(
        &self,
        ctx: &EffectCtx,
        children: &[Effect],
        mut last: Value,
    ) -> Result<Value, EffectError> {
        self.emit_composition(ctx, "sequence", children.len());
        for child in children {
            last = self.run_tree(child, ctx, last).await?;
        }
        Ok(last)
    }

    async fn run_parallel(
        &self,
        ctx: &EffectCtx,
        children: &[Effect],
    ) -> Result<Value, EffectError> {
        self.emit_composition(ctx, "parallel", children.len());
        let futures: Vec<_> = children
            .iter()
            .map(|child| self.run_tree(child, ctx, Value::String(String::new())))
            .collect();
        // Waits for every child, then reports the first error in input
        // order, or all results in input order.
        let outcomes = join_all(futures).await;
        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(value) => results.push(value),
                Err(e) => return Err(e),
            }
        }
        Ok(Value::Array(results))
    }

    async fn run_race(&self, ctx: &EffectCtx, children: &[Effect]) -> Result<Value, EffectError> {
        if children.is_empty() {
            return Err(EffectError::ValidationFailed {
                detail: "race requires at least one child".to_string(),
            });
        }
        self.emit_composition(ctx, "race", children.len());
        let futures: Vec<_> = children
            .iter()
            .map(|child| self.run_tree(child, ctx, Value::String(String::new())))
            .collect();
        // The losers are dropped, which cancels them: they were never
        // spawned as independent tasks.
        let (winner, _, _) = select_all(futures).await;
        winner
    }

    async fn run_retry(
        &self,
        ctx: &EffectCtx,
        child: &Effect,
        options: &crate::effect::RetryOptions,
        last: Value,
    ) -> Result<Value, EffectError> {
        for attempt in 1..=options.attempts {
            match self.run_tree(child, ctx, last.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    self.telemetry.emit(
                        TelemetryEvent::new(TOPIC_EFFECT_RETRY)
                            .field("execution_id", ctx.execution_id)
                            .field("fsm_id", ctx.fsm_id.as_str())
                            .field("attempt", attempt)
                            .field("error", e.tag()),
                    );
                    if attempt == options.attempts {
                        break;
                    }
                    let backoff = Duration::from_millis(options.delay_ms(attempt));
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(EffectError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        Err(EffectError::MaxRetriesExceeded)
    }

    async fn run_timeout(
        &self,
        ctx: &EffectCtx,
        child: &Effect,
        ms: u64,
        last: Value,
    ) -> Result<Value, EffectError> {
        match tokio::time::timeout(
            Duration::from_millis(ms),
            self.run_tree(child, ctx, last),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                self.telemetry.emit(
                    TelemetryEvent::new(TOPIC_EFFECT_TIMEOUT)
                        .field("execution_id", ctx.execution_id)
                        .field("fsm_id", ctx.fsm_id.as_str())
                        .field("timeout_ms", ms),
                );
                Err(EffectError::Timeout)
            }
        }
    }

    async fn run_with_compensation(
        &self,
        ctx: &EffectCtx,
        action: &Effect,
        compensation: &Effect,
        last: Value,
    ) -> Result<Value, EffectError> {
        match self.run_tree(action, ctx, last.clone()).await {
            Ok(value) => Ok(value),
            Err(action_error) => {
                match self.run_tree(compensation, ctx, last).await {
                    // Compensation ran for its side effects; the original
                    // failure is what the caller sees.
                    Ok(_) => Err(action_error),
                    Err(comp_error) => Err(EffectError::CompensationFailed {
                        detail: comp_error.to_string(),
                    }),
                }
            }
        }
    }

    async fn run_circuit_breaker(
        &self,
        ctx: &EffectCtx,
        child: &Effect,
        options: &crate::effect::BreakerOptions,
        last: Value,
    ) -> Result<Value, EffectError> {
        let leaf_type = child.effect_type();
        match self.breakers.check(&ctx.fsm_id, leaf_type, options) {
            BreakerDecision::Reject => {
                self.emit_breaker(ctx, leaf_type, "open");
                Err(EffectError::CircuitBreakerOpen)
            }
            BreakerDecision::Proceed | BreakerDecision::Probe => {
                match self.run_tree(child, ctx, last).await {
                    Ok(value) => {
                        self.breakers.record_success(&ctx.fsm_id, leaf_type);
                        Ok(value)
                    }
                    Err(EffectError::Cancelled) => {
                        // Cancellation says nothing about the child's health.
                        Err(EffectError::Cancelled)
                    }
                    Err(e) => {
                        let state = self.breakers.record_failure(&ctx.fsm_id, leaf_type, options);
                        if state == BreakerState::Open {
                            self.emit_breaker(ctx, leaf_type, "opened");
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    async fn run_saga(&self, ctx: &EffectCtx, steps: &[SagaStep]) -> Result<Value, EffectError> {
        self.emit_composition(ctx, "saga", steps.len());
        let mut results = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            match self
                .run_tree(&step.action, ctx, Value::String(String::new()))
                .await
            {
                Ok(value) => results.push(value),
                Err(action_error) => {
                    // Unwind: compensate completed steps in reverse order.
                    for (comp_index, completed) in steps[..index].iter().enumerate().rev() {
                        if let Err(comp_error) = self
                            .run_tree(&completed.compensation, ctx, Value::String(String::new()))
                            .await
                        {
                            warn!(
                                fsm_id = %ctx.fsm_id,
                                step = comp_index,
                                error = %comp_error,
                                "saga compensation failed"
                            );
                        }
                    }
                    return Err(action_error);
                }
            }
        }
        Ok(json!({"completed": results.len(), "results": results}))
    }

    // =========================================================================
    // Data access
    // =========================================================================

    async fn read_data(&self, ctx: &EffectCtx, key: &str) -> Result<Option<Value>, EffectError> {
        match self.registry.get(&ctx.fsm_id) {
            Some(instance) => Ok(instance.data.get(key).cloned()),
            // The instance was destroyed while the effect was in flight.
            None => Err(EffectError::Cancelled),
        }
    }

    async fn mutate_data(
        &self,
        ctx: &EffectCtx,
        mutate: impl FnOnce(&mut DataMap),
    ) -> Result<(), EffectError> {
        let _guard = self.registry.lock_for(&ctx.fsm_id).lock().await;
        self.registry
            .update_data(&ctx.fsm_id, mutate)
            .map(|_| ())
            .map_err(|_| EffectError::Cancelled)
    }

    fn emit_composition(&self, ctx: &EffectCtx, operator: &'static str, children: usize) {
        self.telemetry.emit(
            TelemetryEvent::new(TOPIC_EFFECT_COMPOSITION)
                .field("execution_id", ctx.execution_id)
                .field("effect_type", operator)
                .field("fsm_id", ctx.fsm_id.as_str())
                .field("children", children as u64),
        );
    }

    fn emit_breaker(&self, ctx: &EffectCtx, leaf_type: &'static str, state: &str) {
        self.telemetry.emit(
            TelemetryEvent::new(TOPIC_EFFECT_CIRCUIT_BREAKER)
                .field("execution_id", ctx.execution_id)
                .field("fsm_id", ctx.fsm_id.as_str())
                .field("leaf_type", leaf_type)
                .field("state", state),
        );
    }
}

impl std::fmt::Debug for EffectsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectsEngine")
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::KindRegistry;
    use crate::effect::{Backoff, BreakerOptions, RetryOptions};
    use crate::provider::StubProvider;
    use crate::telemetry::RecordingSink;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        engine: Arc<EffectsEngine>,
        registry: Arc<Registry>,
        kinds: Arc<KindRegistry>,
        telemetry: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let kinds = Arc::new(KindRegistry::new());
        let telemetry = Arc::new(RecordingSink::new());
        let registry = Arc::new(Registry::new(kinds.clone(), telemetry.clone(), 8));
        let engine = Arc::new(EffectsEngine::new(
            Arc::new(FunctionRegistry::new()),
            Arc::new(StubProvider::new()),
            registry.clone(),
            telemetry.clone(),
            Duration::from_millis(10),
        ));
        Fixture {
            engine,
            registry,
            kinds,
            telemetry,
        }
    }

    fn plain_kind(kinds: &KindRegistry, name: &str) -> Arc<FsmKind> {
        let kind = FsmKind::builder(name)
            .states(["idle", "busy"])
            .initial("idle")
            .transition("idle", "go", "busy")
            .build()
            .unwrap();
        kinds.register(kind.clone()).unwrap();
        kind
    }

    fn live_instance(fixture: &Fixture, kind: &Arc<FsmKind>) -> Arc<FsmInstance> {
        let instance = FsmInstance::new(kind, DataMap::new(), None, Some("t1".into()));
        fixture.registry.register(instance)
    }

    fn ctx_for(instance: &FsmInstance, kind: &Arc<FsmKind>) -> EffectCtx {
        EffectCtx {
            execution_id: 1,
            fsm_id: instance.id.clone(),
            tenant_id: instance.tenant_id.clone(),
            state_at_start: instance.current_state.clone(),
            kind: kind.clone(),
            cancel: CancelFlag::new(),
        }
    }

    #[tokio::test]
    async fn test_sequence_threads_last_result() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Seq");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        f.engine.functions().register("Echo", "upper", |args| async move {
            let s = args.first().and_then(Value::as_str).unwrap_or("").to_uppercase();
            Ok(json!(s))
        });

        let tree = Effect::sequence([
            Effect::literal("hello"),
            Effect::call("Echo", "upper", [Effect::get_result()]),
        ]);
        let result = f
            .engine
            .run_tree(&tree, &ctx, Value::String(String::new()))
            .await
            .unwrap();
        assert_eq!(result, json!("HELLO"));
    }

    #[tokio::test]
    async fn test_get_result_outside_sequence_is_empty() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Empty");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let result = f
            .engine
            .run_tree(&Effect::get_result(), &ctx, Value::String(String::new()))
            .await
            .unwrap();
        assert_eq!(result, json!(""));
    }

    #[tokio::test]
    async fn test_data_leaves_read_and_write() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Data");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let tree = Effect::sequence([
            Effect::put_data("name", json!("sy")),
            Effect::update_data("name", |v| {
                json!(format!("{}!", v.as_str().unwrap_or("")))
            }),
            Effect::get_data("name"),
        ]);
        let result = f
            .engine
            .run_tree(&tree, &ctx, Value::String(String::new()))
            .await
            .unwrap();
        assert_eq!(result, json!("sy!"));

        // Missing keys read as "" in the lenient leaf and fail in the
        // strict one.
        let lenient = f
            .engine
            .run_tree(&Effect::get_data("missing"), &ctx, Value::Null)
            .await
            .unwrap();
        assert_eq!(lenient, json!(""));
        let strict = f
            .engine
            .run_tree(&Effect::get_data_strict("missing"), &ctx, Value::Null)
            .await;
        assert!(matches!(strict, Err(EffectError::ValidationFailed { .. })));
    }

    #[tokio::test]
    async fn test_call_missing_function_is_not_exported() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Missing");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let result = f
            .engine
            .run_tree(&Effect::call("Nope", "f", []), &ctx, Value::Null)
            .await;
        match result {
            Err(EffectError::FunctionNotExported { target }) => assert_eq!(target, "Nope.f"),
            other => panic!("expected FunctionNotExported, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_error_and_panic_are_captured() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Crash");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        f.engine
            .functions()
            .register("Svc", "fails", |_| async { anyhow::bail!("nope") });
        f.engine.functions().register("Svc", "panics", |_| async {
            panic!("boom");
            #[allow(unreachable_code)]
            Ok(Value::Null)
        });

        let err = f
            .engine
            .run_tree(&Effect::call("Svc", "fails", []), &ctx, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, EffectError::CallFailed { .. }));

        let err = f
            .engine
            .run_tree(&Effect::call("Svc", "panics", []), &ctx, Value::Null)
            .await
            .unwrap_err();
        match err {
            EffectError::CallFailed { detail } => assert!(detail.contains("panicked")),
            other => panic!("expected CallFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parallel_waits_for_all_and_orders_results() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Par");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let tree = Effect::parallel([
            Effect::sequence([Effect::delay(30), Effect::literal("slow")]),
            Effect::literal("fast"),
        ]);
        let result = f
            .engine
            .run_tree(&tree, &ctx, Value::Null)
            .await
            .unwrap();
        assert_eq!(result, json!(["slow", "fast"]));
    }

    #[tokio::test]
    async fn test_parallel_returns_first_error_in_input_order() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.ParErr");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let completed = Arc::new(AtomicUsize::new(0));
        let completed_clone = completed.clone();
        f.engine.functions().register("Probe", "late", move |_| {
            let completed = completed_clone.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(json!("late"))
            }
        });

        let tree = Effect::parallel([
            Effect::get_data_strict("missing"),
            Effect::call("Probe", "late", []),
        ]);
        let err = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap_err();
        assert!(matches!(err, EffectError::ValidationFailed { .. }));
        // The slow sibling still ran to completion before the error
        // was reported.
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_race_first_result_wins() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Race");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let tree = Effect::race([
            Effect::sequence([Effect::delay(200), Effect::literal("slow")]),
            Effect::sequence([Effect::delay(5), Effect::literal("quick")]),
        ]);
        let result = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap();
        assert_eq!(result, json!("quick"));
    }

    #[tokio::test]
    async fn test_retry_attempt_ceiling() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Retry");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        f.engine.functions().register("Flaky", "always", move |_| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("still broken")
            }
        });

        let tree = Effect::retry(
            Effect::call("Flaky", "always", []),
            RetryOptions::default()
                .attempts(3)
                .backoff(Backoff::Constant)
                .base_delay_ms(1),
        );
        let err = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap_err();
        assert!(matches!(err, EffectError::MaxRetriesExceeded));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.telemetry.count(TOPIC_EFFECT_RETRY), 3);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Transient");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        f.engine.functions().register("Flaky", "thrice", move |_| {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("warming up")
                }
                Ok(json!("warm"))
            }
        });

        let tree = Effect::retry(
            Effect::call("Flaky", "thrice", []),
            RetryOptions::default()
                .attempts(5)
                .backoff(Backoff::Constant)
                .base_delay_ms(1),
        );
        let result = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap();
        assert_eq!(result, json!("warm"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_observed_promptly() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Timeout");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let tree = Effect::timeout(Effect::delay(60_000), 100);
        let err = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap_err();
        assert!(matches!(err, EffectError::Timeout));
        assert_eq!(f.telemetry.count(TOPIC_EFFECT_TIMEOUT), 1);
    }

    #[tokio::test]
    async fn test_with_compensation_runs_on_failure_only() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Comp");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let compensated = Arc::new(AtomicUsize::new(0));
        let compensated_clone = compensated.clone();
        f.engine.functions().register("Comp", "undo", move |_| {
            let compensated = compensated_clone.clone();
            async move {
                compensated.fetch_add(1, Ordering::SeqCst);
                Ok(json!("undone"))
            }
        });

        // Success path: compensation untouched.
        let ok = Effect::with_compensation(Effect::literal(1), Effect::call("Comp", "undo", []));
        assert_eq!(f.engine.run_tree(&ok, &ctx, Value::Null).await.unwrap(), json!(1));
        assert_eq!(compensated.load(Ordering::SeqCst), 0);

        // Failure path: compensation runs, original error surfaces.
        let failing = Effect::with_compensation(
            Effect::get_data_strict("missing"),
            Effect::call("Comp", "undo", []),
        );
        let err = f.engine.run_tree(&failing, &ctx, Value::Null).await.unwrap_err();
        assert!(matches!(err, EffectError::ValidationFailed { .. }));
        assert_eq!(compensated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compensation_failure_is_reported() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.CompFail");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let tree = Effect::with_compensation(
            Effect::get_data_strict("missing"),
            Effect::get_data_strict("also_missing"),
        );
        let err = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap_err();
        assert!(matches!(err, EffectError::CompensationFailed { .. }));
    }

    #[tokio::test]
    async fn test_saga_compensates_in_reverse_order() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Saga");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let log: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        for name in ["reserve", "release", "charge", "refund", "ship", "recall"] {
            let log = log.clone();
            let name = name.to_string();
            f.engine.functions().register("Order", &name.clone(), move |_| {
                let log = log.clone();
                let name = name.clone();
                async move {
                    log.lock().unwrap().push(name.clone());
                    if name == "ship" {
                        anyhow::bail!("no trucks")
                    }
                    Ok(json!(name))
                }
            });
        }

        let tree = Effect::saga([
            SagaStep {
                action: Effect::call("Order", "reserve", []),
                compensation: Effect::call("Order", "release", []),
            },
            SagaStep {
                action: Effect::call("Order", "charge", []),
                compensation: Effect::call("Order", "refund", []),
            },
            SagaStep {
                action: Effect::call("Order", "ship", []),
                compensation: Effect::call("Order", "recall", []),
            },
        ]);

        let err = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap_err();
        assert!(matches!(err, EffectError::CallFailed { .. }));
        let calls = log.lock().unwrap().clone();
        assert_eq!(calls, ["reserve", "charge", "ship", "refund", "release"]);
    }

    #[tokio::test]
    async fn test_circuit_breaker_trips_and_recovers() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Breaker");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let healthy = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let healthy_clone = healthy.clone();
        let calls_clone = calls.clone();
        f.engine.functions().register("RemoteSvc", "ping", move |_| {
            let healthy = healthy_clone.clone();
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if healthy.load(Ordering::SeqCst) {
                    Ok(json!("pong"))
                } else {
                    anyhow::bail!("connection refused")
                }
            }
        });

        let tree = Effect::circuit_breaker(
            Effect::call("RemoteSvc", "ping", []),
            BreakerOptions {
                failure_threshold: 2,
                recovery_timeout_ms: 50,
            },
        );

        // Two failures trip it open.
        for _ in 0..2 {
            let err = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap_err();
            assert!(matches!(err, EffectError::CallFailed { .. }));
        }
        assert_eq!(
            f.engine.breakers().state(&ctx.fsm_id, "call"),
            Some(BreakerState::Open)
        );

        // Third run is rejected without invoking the child.
        let before = calls.load(Ordering::SeqCst);
        let err = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap_err();
        assert!(matches!(err, EffectError::CircuitBreakerOpen));
        assert_eq!(calls.load(Ordering::SeqCst), before);

        // After recovery, one successful probe closes it.
        tokio::time::sleep(Duration::from_millis(60)).await;
        healthy.store(true, Ordering::SeqCst);
        let result = f.engine.run_tree(&tree, &ctx, Value::Null).await.unwrap();
        assert_eq!(result, json!("pong"));
        assert_eq!(
            f.engine.breakers().state(&ctx.fsm_id, "call"),
            Some(BreakerState::Closed)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_state_entry_spawn_and_cancel() {
        let f = fixture();
        let kind = FsmKind::builder("Demo.Entry")
            .states(["a", "b"])
            .initial("a")
            .transition("a", "go", "b")
            .effect(
                "a",
                Effect::sequence([Effect::delay(5_000), Effect::put_data("marker", json!("set"))]),
            )
            .build()
            .unwrap();
        f.kinds.register(kind.clone()).unwrap();
        let instance = live_instance(&f, &kind);

        f.engine.spawn_for_state(&kind, &instance, "a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.engine.running_count(&instance.id), 1);

        f.engine.cancel_state(&instance.id, "a");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.engine.running_count(&instance.id), 0);
        let current = f.registry.get(&instance.id).unwrap();
        assert!(current.get("marker").is_none());
        assert_eq!(f.telemetry.count(TOPIC_EFFECT_CANCELLED), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_named_effect_runs_to_completion() {
        let f = fixture();
        let kind = FsmKind::builder("Demo.NamedFx")
            .states(["a"])
            .initial("a")
            .named_effect("warmup", Effect::put_data("warm", json!(true)))
            .build()
            .unwrap();
        f.kinds.register(kind.clone()).unwrap();
        let instance = live_instance(&f, &kind);

        let result = f.engine.run_named(&kind, &instance, "warmup").await.unwrap();
        assert_eq!(result, json!(true));
        let current = f.registry.get(&instance.id).unwrap();
        assert_eq!(current.get("warm"), Some(&json!(true)));

        let missing = f.engine.run_named(&kind, &instance, "nope").await;
        assert!(matches!(missing, Err(EffectError::ValidationFailed { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_tree_fails_without_running() {
        let f = fixture();
        let kind = FsmKind::builder("Demo.Invalid")
            .states(["a"])
            .initial("a")
            .effect("a", Effect::call_llm(json!({"provider": "stub"})))
            .build()
            .unwrap();
        f.kinds.register(kind.clone()).unwrap();
        let instance = live_instance(&f, &kind);

        f.engine.spawn_for_state(&kind, &instance, "a");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.telemetry.count(TOPIC_EFFECT_FAILED), 1);
        assert_eq!(f.telemetry.count(TOPIC_EFFECT_COMPLETED), 0);
    }

    #[tokio::test]
    async fn test_stub_provider_leaves() {
        let f = fixture();
        let kind = plain_kind(&f.kinds, "Demo.Ai");
        let instance = live_instance(&f, &kind);
        let ctx = ctx_for(&instance, &kind);

        let llm = Effect::call_llm(json!({"provider": "stub", "model": "m", "prompt": "hi"}));
        let result = f.engine.run_tree(&llm, &ctx, Value::Null).await.unwrap();
        assert!(result["completion"].as_str().unwrap().contains("hi"));

        let coord = Effect::coordinate_agents([json!({
            "id": "a", "model": "m", "role": "r", "task": "t"
        })]);
        let result = f.engine.run_tree(&coord, &ctx, Value::Null).await.unwrap();
        assert_eq!(result["results"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_flag_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel();
        assert!(tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .unwrap()
            .unwrap());
    }
}
