//! Declarative effect trees.
//!
//! An [`Effect`] describes side-effect work without performing it: leaves
//! name an operation (function call, delay, data read/write, provider call)
//! and composites describe how children combine (sequence, parallel, race,
//! retry, timeout, compensation, circuit breaker, saga). The effects engine
//! interprets the tree; cancellation is tied to state exit.
//!
//! Trees are plain values: cheap to clone, built once per kind declaration,
//! shared by reference from the kind.
//!
//! # Example
//!
//! ```ignore
//! let effect = Effect::sequence([
//!     Effect::call("Inventory", "reserve", [Effect::get_data("sku")]),
//!     Effect::put_data("reserved", serde_json::json!(true)),
//! ]);
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::EffectError;
use crate::instance::DataMap;

/// Routing/pooling class advertised by each leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComplexityClass {
    /// Pure data plumbing (data ops, logging, result passing).
    Simple,
    /// Short local work (delays, registered function calls).
    Medium,
    /// External IO (named effects, compensations, sagas).
    Complex,
    /// Provider-backed AI work (LLM, embeddings, agents, RAG).
    AiIntensive,
}

/// Log level for the `log` leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Closure wrapper so `update_data` stays cloneable and debuggable.
#[derive(Clone)]
pub struct UpdateFn(pub Arc<dyn Fn(Value) -> Value + Send + Sync>);

impl UpdateFn {
    /// Wrap a transformation.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for UpdateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpdateFn")
    }
}

/// Options for the `retry` operator.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Maximum attempts (the child runs at most this many times).
    pub attempts: u32,
    /// Delay strategy between attempts.
    pub backoff: Backoff,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential,
            base_delay_ms: 1000,
        }
    }
}

impl RetryOptions {
    /// Set the attempt ceiling.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the backoff strategy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the base delay.
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// Delay before the given retry (1-based attempt that just failed).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.backoff.delay_ms(self.base_delay_ms, attempt)
    }
}

/// Backoff strategies for `retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time.
    Constant,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt-1)`.
    Exponential,
    /// `base * fib(attempt)`.
    Fibonacci,
}

impl Backoff {
    /// Delay in milliseconds after the given 1-based failed attempt.
    pub fn delay_ms(&self, base: u64, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        match self {
            Backoff::Constant => base,
            Backoff::Linear => base.saturating_mul(attempt as u64),
            Backoff::Exponential => base.saturating_mul(1u64 << (attempt - 1).min(32)),
            Backoff::Fibonacci => base.saturating_mul(fibonacci(attempt)),
        }
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Options for the `circuit_breaker` operator.
#[derive(Debug, Clone)]
pub struct BreakerOptions {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe.
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

/// One saga step: an action and the compensation that undoes it.
#[derive(Debug, Clone)]
pub struct SagaStep {
    /// The forward action.
    pub action: Effect,
    /// Runs (in reverse step order) when a later action fails.
    pub compensation: Effect,
}

/// A declarative side-effect tree.
#[derive(Debug, Clone)]
pub enum Effect {
    /// A constant value; useful as a call argument.
    Literal(Value),
    /// Invoke a registered function with resolved arguments.
    Call {
        target: String,
        function: String,
        args: Vec<Effect>,
    },
    /// Cancellable wait.
    Delay { ms: u64 },
    /// Structured log line.
    Log { level: LogLevel, message: String },
    /// Write one data key.
    PutData { key: String, value: Value },
    /// Read one data key; missing keys read as `""`.
    GetData { key: String },
    /// Read one data key; missing keys fail validation.
    GetDataStrict { key: String },
    /// Shallow-merge a map into the data.
    MergeData { map: DataMap },
    /// Transform one data key in place.
    UpdateData { key: String, func: UpdateFn },
    /// The previous sibling's result inside a sequence (`""` elsewhere).
    GetResult,
    /// Provider-backed LLM call. Config requires `provider`, `model`, `prompt`.
    CallLlm { config: Value },
    /// Provider-backed embedding.
    EmbedText { config: Value },
    /// Provider-backed vector search.
    VectorSearch { config: Value },
    /// Provider-backed single-agent invocation.
    InvokeAgent { config: Value },
    /// Provider-backed multi-agent coordination. Each agent entry requires
    /// `id`, `model`, `role`, `task`.
    CoordinateAgents { agents: Vec<Value> },
    /// Provider-backed retrieval pipeline.
    RagPipeline { config: Value },
    /// Run one of the kind's named effect trees.
    Named { name: String },
    /// Children run left to right; first failure aborts.
    Sequence(Vec<Effect>),
    /// Children run concurrently; wait for all.
    Parallel(Vec<Effect>),
    /// Children run concurrently; first result wins, the rest are cancelled.
    Race(Vec<Effect>),
    /// Re-run the child on failure with backoff.
    Retry {
        child: Box<Effect>,
        options: RetryOptions,
    },
    /// Cancel the child if it exceeds the deadline.
    Timeout { child: Box<Effect>, ms: u64 },
    /// Run `compensation` for its side effects when `action` fails.
    WithCompensation {
        action: Box<Effect>,
        compensation: Box<Effect>,
    },
    /// Guard the child with a per-`(fsm_id, leaf_type)` breaker.
    CircuitBreaker {
        child: Box<Effect>,
        options: BreakerOptions,
    },
    /// Ordered action/compensation pairs with reverse-order compensation.
    Saga(Vec<SagaStep>),
}

impl Effect {
    /// A constant argument value.
    pub fn literal(value: impl Into<Value>) -> Self {
        Effect::Literal(value.into())
    }

    /// Invoke the registered function `target.function`.
    pub fn call<I>(target: impl Into<String>, function: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = Effect>,
    {
        Effect::Call {
            target: target.into(),
            function: function.into(),
            args: args.into_iter().collect(),
        }
    }

    /// Cancellable wait.
    pub fn delay(ms: u64) -> Self {
        Effect::Delay { ms }
    }

    /// Structured log line.
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Effect::Log {
            level,
            message: message.into(),
        }
    }

    /// Write one data key.
    pub fn put_data(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Effect::PutData {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Read one data key (missing reads as `""`).
    pub fn get_data(key: impl Into<String>) -> Self {
        Effect::GetData { key: key.into() }
    }

    /// Read one data key, failing when missing.
    pub fn get_data_strict(key: impl Into<String>) -> Self {
        Effect::GetDataStrict { key: key.into() }
    }

    /// Shallow-merge a map into the data.
    pub fn merge_data(map: DataMap) -> Self {
        Effect::MergeData { map }
    }

    /// Transform one data key in place.
    pub fn update_data<F>(key: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Effect::UpdateData {
            key: key.into(),
            func: UpdateFn::new(func),
        }
    }

    /// The previous sibling's result inside a sequence.
    pub fn get_result() -> Self {
        Effect::GetResult
    }

    /// Provider-backed LLM call.
    pub fn call_llm(config: Value) -> Self {
        Effect::CallLlm { config }
    }

    /// Provider-backed embedding.
    pub fn embed_text(config: Value) -> Self {
        Effect::EmbedText { config }
    }

    /// Provider-backed vector search.
    pub fn vector_search(config: Value) -> Self {
        Effect::VectorSearch { config }
    }

    /// Provider-backed single-agent invocation.
    pub fn invoke_agent(config: Value) -> Self {
        Effect::InvokeAgent { config }
    }

    /// Provider-backed multi-agent coordination.
    pub fn coordinate_agents<I>(agents: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Effect::CoordinateAgents {
            agents: agents.into_iter().collect(),
        }
    }

    /// Provider-backed retrieval pipeline.
    pub fn rag_pipeline(config: Value) -> Self {
        Effect::RagPipeline { config }
    }

    /// Run one of the kind's named effect trees.
    pub fn named(name: impl Into<String>) -> Self {
        Effect::Named { name: name.into() }
    }

    /// Children run left to right; first failure aborts.
    pub fn sequence<I>(children: I) -> Self
    where
        I: IntoIterator<Item = Effect>,
    {
        Effect::Sequence(children.into_iter().collect())
    }

    /// Children run concurrently; wait for all.
    pub fn parallel<I>(children: I) -> Self
    where
        I: IntoIterator<Item = Effect>,
    {
        Effect::Parallel(children.into_iter().collect())
    }

    /// Children run concurrently; first result wins.
    pub fn race<I>(children: I) -> Self
    where
        I: IntoIterator<Item = Effect>,
    {
        Effect::Race(children.into_iter().collect())
    }

    /// Re-run the child on failure with backoff.
    pub fn retry(child: Effect, options: RetryOptions) -> Self {
        Effect::Retry {
            child: Box::new(child),
            options,
        }
    }

    /// Cancel the child if it exceeds the deadline.
    pub fn timeout(child: Effect, ms: u64) -> Self {
        Effect::Timeout {
            child: Box::new(child),
            ms,
        }
    }

    /// Run `compensation` for its side effects when `action` fails.
    pub fn with_compensation(action: Effect, compensation: Effect) -> Self {
        Effect::WithCompensation {
            action: Box::new(action),
            compensation: Box::new(compensation),
        }
    }

    /// Guard the child with a circuit breaker.
    pub fn circuit_breaker(child: Effect, options: BreakerOptions) -> Self {
        Effect::CircuitBreaker {
            child: Box::new(child),
            options,
        }
    }

    /// Ordered action/compensation pairs with reverse-order compensation.
    pub fn saga<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = SagaStep>,
    {
        Effect::Saga(steps.into_iter().collect())
    }

    /// Stable tag used in telemetry fields and breaker keys.
    pub fn effect_type(&self) -> &'static str {
        match self {
            Effect::Literal(_) => "literal",
            Effect::Call { .. } => "call",
            Effect::Delay { .. } => "delay",
            Effect::Log { .. } => "log",
            Effect::PutData { .. } => "put_data",
            Effect::GetData { .. } => "get_data",
            Effect::GetDataStrict { .. } => "get_data_strict",
            Effect::MergeData { .. } => "merge_data",
            Effect::UpdateData { .. } => "update_data",
            Effect::GetResult => "get_result",
            Effect::CallLlm { .. } => "call_llm",
            Effect::EmbedText { .. } => "embed_text",
            Effect::VectorSearch { .. } => "vector_search",
            Effect::InvokeAgent { .. } => "invoke_agent",
            Effect::CoordinateAgents { .. } => "coordinate_agents",
            Effect::RagPipeline { .. } => "rag_pipeline",
            Effect::Named { .. } => "named_effect",
            Effect::Sequence(_) => "sequence",
            Effect::Parallel(_) => "parallel",
            Effect::Race(_) => "race",
            Effect::Retry { .. } => "retry",
            Effect::Timeout { .. } => "timeout",
            Effect::WithCompensation { .. } => "with_compensation",
            Effect::CircuitBreaker { .. } => "circuit_breaker",
            Effect::Saga(_) => "saga",
        }
    }

    /// Routing class: leaves advertise their own, composites inherit the
    /// heaviest child.
    pub fn complexity(&self) -> ComplexityClass {
        match self {
            Effect::Literal(_)
            | Effect::Log { .. }
            | Effect::PutData { .. }
            | Effect::GetData { .. }
            | Effect::GetDataStrict { .. }
            | Effect::MergeData { .. }
            | Effect::UpdateData { .. }
            | Effect::GetResult => ComplexityClass::Simple,
            Effect::Call { .. } | Effect::Delay { .. } => ComplexityClass::Medium,
            Effect::Named { .. } => ComplexityClass::Complex,
            Effect::CallLlm { .. }
            | Effect::EmbedText { .. }
            | Effect::VectorSearch { .. }
            | Effect::InvokeAgent { .. }
            | Effect::CoordinateAgents { .. }
            | Effect::RagPipeline { .. } => ComplexityClass::AiIntensive,
            Effect::Sequence(children) | Effect::Parallel(children) | Effect::Race(children) => {
                children
                    .iter()
                    .map(Effect::complexity)
                    .max()
                    .unwrap_or(ComplexityClass::Simple)
            }
            Effect::Retry { child, .. }
            | Effect::Timeout { child, .. }
            | Effect::CircuitBreaker { child, .. } => child.complexity(),
            Effect::WithCompensation {
                action,
                compensation,
            } => action.complexity().max(compensation.complexity()),
            Effect::Saga(steps) => steps
                .iter()
                .map(|s| s.action.complexity().max(s.compensation.complexity()))
                .max()
                .unwrap_or(ComplexityClass::Complex),
        }
    }

    /// Check the tree before execution.
    ///
    /// `call_llm` configs must carry `provider`, `model`, and `prompt`;
    /// every `coordinate_agents` entry must carry `id`, `model`, `role`,
    /// and `task`.
    pub fn validate(&self) -> Result<(), EffectError> {
        match self {
            Effect::CallLlm { config } => require_keys(config, &["provider", "model", "prompt"]),
            Effect::CoordinateAgents { agents } => {
                for agent in agents {
                    require_keys(agent, &["id", "model", "role", "task"])?;
                }
                Ok(())
            }
            Effect::Call { args, .. } => {
                for arg in args {
                    arg.validate()?;
                }
                Ok(())
            }
            Effect::Sequence(children) | Effect::Parallel(children) | Effect::Race(children) => {
                for child in children {
                    child.validate()?;
                }
                Ok(())
            }
            Effect::Retry { child, .. }
            | Effect::Timeout { child, .. }
            | Effect::CircuitBreaker { child, .. } => child.validate(),
            Effect::WithCompensation {
                action,
                compensation,
            } => {
                action.validate()?;
                compensation.validate()
            }
            Effect::Saga(steps) => {
                for step in steps {
                    step.action.validate()?;
                    step.compensation.validate()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn require_keys(config: &Value, keys: &[&str]) -> Result<(), EffectError> {
    let object = config.as_object().ok_or_else(|| EffectError::ValidationFailed {
        detail: "config must be an object".to_string(),
    })?;
    for key in keys {
        if !object.contains_key(*key) {
            return Err(EffectError::ValidationFailed {
                detail: format!("missing required key '{key}'"),
            });
        }
    }
    Ok(())
}
