//! Pluggable targets for effect leaves.
//!
//! Two seams:
//!
//! - [`FunctionRegistry`] resolves `call(target, function, args)` leaves to
//!   registered async functions. Functions use `anyhow` internally; the
//!   effects engine converts failures to tagged effect errors.
//! - [`AiProvider`] backs the AI leaves (`call_llm`, `embed_text`,
//!   `vector_search`, `invoke_agent`, `coordinate_agents`, `rag_pipeline`).
//!   The engine's only contract with a provider is transport and telemetry;
//!   [`StubProvider`] satisfies it without any network.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::error::EffectError;

/// Boxed future returned by registered functions.
pub type FunctionFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// A registered effect function.
pub type EffectFunction = Arc<dyn Fn(Vec<Value>) -> FunctionFuture + Send + Sync>;

/// Registry resolving `Target.function` keys to async functions.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, EffectFunction>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(target: &str, function: &str) -> String {
        format!("{target}.{function}")
    }

    /// Register an async function under `target.function`. Later
    /// registrations replace earlier ones.
    pub fn register<F, Fut>(&self, target: &str, function: &str, f: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.functions.insert(
            Self::key(target, function),
            Arc::new(move |args| Box::pin(f(args))),
        );
    }

    /// Look up a function.
    pub fn get(&self, target: &str, function: &str) -> Option<EffectFunction> {
        self.functions
            .get(&Self::key(target, function))
            .map(|f| f.clone())
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// Backs the AI-intensive effect leaves.
///
/// Implementations wrap real LLM/embedding/vector stacks; the runtime only
/// moves configs in and results out.
#[async_trait]
pub trait AiProvider: Send + Sync + 'static {
    /// Execute one LLM call. Config carries `provider`, `model`, `prompt`.
    async fn call_llm(&self, config: &Value) -> Result<Value, EffectError>;

    /// Embed text into a vector.
    async fn embed_text(&self, config: &Value) -> Result<Value, EffectError>;

    /// Query a vector index.
    async fn vector_search(&self, config: &Value) -> Result<Value, EffectError>;

    /// Invoke a single agent.
    async fn invoke_agent(&self, config: &Value) -> Result<Value, EffectError>;

    /// Coordinate several agents; each entry carries `id`, `model`, `role`,
    /// `task`.
    async fn coordinate_agents(&self, agents: &[Value]) -> Result<Value, EffectError>;

    /// Run a retrieval-augmented pipeline.
    async fn rag_pipeline(&self, config: &Value) -> Result<Value, EffectError>;
}

/// Provider that answers locally with canned shapes.
///
/// Good enough for tests and for embedders that wire real providers later;
/// the core's correctness does not depend on what a provider returns.
#[derive(Debug, Default)]
pub struct StubProvider;

impl StubProvider {
    /// Create a stub provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AiProvider for StubProvider {
    async fn call_llm(&self, config: &Value) -> Result<Value, EffectError> {
        let prompt = config.get("prompt").and_then(Value::as_str).unwrap_or("");
        Ok(json!({
            "model": config.get("model").cloned().unwrap_or(Value::Null),
            "completion": format!("stub completion for: {prompt}"),
        }))
    }

    async fn embed_text(&self, config: &Value) -> Result<Value, EffectError> {
        let text = config.get("text").and_then(Value::as_str).unwrap_or("");
        // Deterministic toy embedding: byte sum and length.
        let sum: u32 = text.bytes().map(u32::from).sum();
        Ok(json!({"embedding": [sum, text.len()]}))
    }

    async fn vector_search(&self, _config: &Value) -> Result<Value, EffectError> {
        Ok(json!({"matches": []}))
    }

    async fn invoke_agent(&self, config: &Value) -> Result<Value, EffectError> {
        Ok(json!({
            "agent": config.get("id").cloned().unwrap_or(Value::Null),
            "output": "stub agent output",
        }))
    }

    async fn coordinate_agents(&self, agents: &[Value]) -> Result<Value, EffectError> {
        let results: Vec<Value> = agents
            .iter()
            .map(|agent| {
                json!({
                    "agent": agent.get("id").cloned().unwrap_or(Value::Null),
                    "role": agent.get("role").cloned().unwrap_or(Value::Null),
                    "output": "stub coordination output",
                })
            })
            .collect();
        Ok(json!({"results": results}))
    }

    async fn rag_pipeline(&self, config: &Value) -> Result<Value, EffectError> {
        Ok(json!({
            "query": config.get("query").cloned().unwrap_or(Value::Null),
            "answer": "stub rag answer",
            "sources": [],
        }))
    }
}
