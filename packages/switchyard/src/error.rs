//! Structured error types for the switchyard runtime.
//!
//! `FsmError` covers everything the manager and transition engine can return;
//! `EffectError` covers everything an effect tree can produce; `DefineError`
//! covers build-time kind validation; `JournalError` and `SnapshotError`
//! cover durable storage.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the public API.**
//!
//! - `anyhow` is internal transport (ergonomic inside registered effect
//!   functions and providers)
//! - the tagged enums below are the only errors callers see
//!
//! # Propagation policy
//!
//! - Invalid requests and precondition failures abort a transition with no
//!   side effects and no journal record.
//! - Plugin failures abort the transition with the instance unchanged.
//! - Hook crashes are advisory: logged, swallowed, the transition completes.
//! - Journal append errors never fail a transition; they surface through
//!   telemetry only.
//! - Effect errors stay inside the effects engine; they reach FSM state only
//!   if an effect chose to write into `data`.

use thiserror::Error;

/// Errors returned by the manager and the transition engine.
///
/// Each variant is a tag callers can pattern-match on; none of them carry
/// `anyhow::Error`.
#[derive(Debug, Error)]
pub enum FsmError {
    /// No instance is registered under the given id.
    #[error("fsm not found: {id}")]
    NotFound {
        /// The id that failed to resolve.
        id: String,
    },

    /// No transition exists for `(current_state, event)`.
    ///
    /// Guaranteed side-effect free: no state change, no journal record,
    /// no broadcast.
    #[error("no transition from state '{state}' on event '{event}'")]
    InvalidTransition {
        /// State the instance was in when the event arrived.
        state: String,
        /// The rejected event.
        event: String,
    },

    /// The referenced kind has not been registered.
    #[error("unknown module: {name}")]
    UnknownModule {
        /// The fully-qualified kind name that failed to resolve.
        name: String,
    },

    /// The event name is empty or contains characters outside
    /// `[A-Za-z0-9_.-]`.
    #[error("invalid event name: {name:?}")]
    InvalidEventName {
        /// The rejected event name.
        name: String,
    },

    /// A declared validator rejected the event before any state change.
    #[error("validation failed: {reason}")]
    ValidationError {
        /// Reason supplied by the validator.
        reason: String,
    },

    /// A plugin's `before_transition` or `after_transition` failed.
    ///
    /// The transition is aborted and the caller gets the instance back in
    /// its pre-plugin form.
    #[error("plugin '{plugin}' failed: {reason}")]
    PluginFailed {
        /// Name of the failing plugin.
        plugin: String,
        /// Failure detail (error return or caught panic message).
        reason: String,
    },

    /// The navigate soft ceiling elapsed before the transition finished.
    ///
    /// The transition may still complete internally.
    #[error("transition timed out after {ms}ms")]
    Timeout {
        /// The configured ceiling.
        ms: u64,
    },

    /// An out-of-band effect execution failed.
    #[error(transparent)]
    Effect(#[from] EffectError),

    /// Anything unexpected from lower layers, converted at the manager
    /// boundary so no panic or foreign error escapes.
    #[error("unexpected error: {detail}")]
    Unexpected {
        /// Sanitized description of what went wrong.
        detail: String,
    },
}

/// Errors produced by effect-tree execution.
#[derive(Debug, Error)]
pub enum EffectError {
    /// `timeout(e, ms)` elapsed before `e` produced a result.
    #[error("effect timed out")]
    Timeout,

    /// The execution was cancelled, either by a new state entry or an
    /// explicit `cancel_effects` call.
    #[error("effect cancelled")]
    Cancelled,

    /// `retry(e, opts)` exhausted its attempts.
    #[error("max retries exceeded")]
    MaxRetriesExceeded,

    /// The guarding circuit breaker is open; the child was not invoked.
    #[error("circuit breaker open")]
    CircuitBreakerOpen,

    /// A provider reported rate limiting.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// The LLM provider failed.
    #[error("llm error: {detail}")]
    LlmError {
        /// Provider-supplied detail.
        detail: String,
    },

    /// Agent invocation or coordination failed.
    #[error("agent error: {detail}")]
    AgentError {
        /// Provider-supplied detail.
        detail: String,
    },

    /// A network-level failure from a provider or registered function.
    #[error("network error: {detail}")]
    NetworkError {
        /// Transport-level detail.
        detail: String,
    },

    /// The effect tree failed pre-execution validation.
    #[error("effect validation failed: {detail}")]
    ValidationFailed {
        /// What was missing or malformed.
        detail: String,
    },

    /// The tree contains an effect kind this engine does not implement.
    #[error("unimplemented effect: {kind}")]
    UnimplementedEffect {
        /// The unhandled effect kind.
        kind: String,
    },

    /// `call(target, function, ..)` referenced an unregistered function.
    #[error("function not exported: {target}")]
    FunctionNotExported {
        /// The `Target.function` key that failed to resolve.
        target: String,
    },

    /// A registered function returned an error or panicked.
    #[error("call failed: {detail}")]
    CallFailed {
        /// Error or panic message from the function.
        detail: String,
    },

    /// A compensation ran after its action failed, and itself failed.
    #[error("compensation failed: {detail}")]
    CompensationFailed {
        /// Error from the compensation branch.
        detail: String,
    },
}

impl EffectError {
    /// Short tag for telemetry fields.
    pub fn tag(&self) -> &'static str {
        match self {
            EffectError::Timeout => "timeout",
            EffectError::Cancelled => "cancelled",
            EffectError::MaxRetriesExceeded => "max_retries_exceeded",
            EffectError::CircuitBreakerOpen => "circuit_breaker_open",
            EffectError::RateLimitExceeded => "rate_limit_exceeded",
            EffectError::LlmError { .. } => "llm_error",
            EffectError::AgentError { .. } => "agent_error",
            EffectError::NetworkError { .. } => "network_error",
            EffectError::ValidationFailed { .. } => "validation_failed",
            EffectError::UnimplementedEffect { .. } => "unimplemented_effect",
            EffectError::FunctionNotExported { .. } => "function_not_exported",
            EffectError::CallFailed { .. } => "call_failed",
            EffectError::CompensationFailed { .. } => "compensation_failed",
        }
    }

    /// True for errors that should not be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EffectError::Cancelled
                | EffectError::ValidationFailed { .. }
                | EffectError::UnimplementedEffect { .. }
                | EffectError::FunctionNotExported { .. }
        )
    }
}

/// Build-time errors from `KindBuilder::build`.
#[derive(Debug, Error)]
pub enum DefineError {
    /// The kind declares no states.
    #[error("kind '{kind}' declares no states")]
    NoStates {
        /// The offending kind.
        kind: String,
    },

    /// No initial state was declared, or it is not a member of `states`.
    #[error("kind '{kind}' initial state '{state}' is not a declared state")]
    BadInitialState {
        /// The offending kind.
        kind: String,
        /// The missing or undeclared initial state.
        state: String,
    },

    /// A transition references a state outside the (merged) state set.
    #[error("kind '{kind}' transition ({from}, {event}, {to}) references undeclared state '{state}'")]
    UndeclaredState {
        /// The offending kind.
        kind: String,
        /// Transition source.
        from: String,
        /// Transition event.
        event: String,
        /// Transition target.
        to: String,
        /// Which of the three was undeclared.
        state: String,
    },

    /// A kind with this name is already registered.
    #[error("kind '{kind}' is already registered")]
    DuplicateKind {
        /// The duplicated name.
        kind: String,
    },
}

/// Errors from the append-only event journal.
#[derive(Debug, Error)]
pub enum JournalError {
    /// An append could not be completed.
    ///
    /// Appends are a single `write` of one newline-terminated line to a file
    /// opened in append mode, so a failed append never leaves a partial line.
    #[error("journal append failed: {reason}")]
    AppendFailed {
        /// IO-level reason.
        reason: String,
    },

    /// A read or directory walk failed.
    #[error("journal read failed: {reason}")]
    ReadFailed {
        /// IO-level reason.
        reason: String,
    },
}

/// Errors from the instance snapshot store.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Writing the snapshot (or the rename that commits it) failed.
    #[error("snapshot write failed: {reason}")]
    WriteFailed {
        /// IO-level reason.
        reason: String,
    },

    /// Reading or deserializing a snapshot failed.
    #[error("snapshot read failed: {reason}")]
    ReadFailed {
        /// IO-level reason.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = FsmError::InvalidTransition {
            state: "closing".into(),
            event: "open_cmd".into(),
        };
        assert!(err.to_string().contains("closing"));
        assert!(err.to_string().contains("open_cmd"));
    }

    #[test]
    fn test_fsm_error_is_pattern_matchable() {
        let err = FsmError::PluginFailed {
            plugin: "audit".into(),
            reason: "boom".into(),
        };
        match &err {
            FsmError::PluginFailed { plugin, .. } => assert_eq!(plugin, "audit"),
            _ => panic!("expected PluginFailed"),
        }
    }

    #[test]
    fn test_effect_error_tags_are_stable() {
        assert_eq!(EffectError::Timeout.tag(), "timeout");
        assert_eq!(EffectError::Cancelled.tag(), "cancelled");
        assert_eq!(
            EffectError::FunctionNotExported {
                target: "Svc.ping".into()
            }
            .tag(),
            "function_not_exported"
        );
    }

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        assert!(EffectError::Cancelled.is_terminal());
        assert!(EffectError::ValidationFailed {
            detail: "x".into()
        }
        .is_terminal());
        assert!(!EffectError::Timeout.is_terminal());
        assert!(!EffectError::NetworkError {
            detail: "reset".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_define_error_display_names_the_kind() {
        let err = DefineError::BadInitialState {
            kind: "Demo.Door".into(),
            state: "ajar".into(),
        };
        assert!(err.to_string().contains("Demo.Door"));
        assert!(err.to_string().contains("ajar"));
    }
}
