//! Per-key circuit breakers guarding wrapped effects.
//!
//! Each key `(fsm_id, leaf_type)` owns a small state machine:
//!
//! ```text
//! closed --[threshold consecutive failures]--> open
//! open   --[recovery timeout elapsed]-------> half_open (one probe)
//! half_open --[probe succeeds]--> closed
//! half_open --[probe fails]-----> open
//! ```
//!
//! While open, the wrapped effect is not invoked at all; callers get
//! `EffectError::CircuitBreakerOpen` immediately.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::effect::BreakerOptions;

/// Breaker position for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow through; failures are counted.
    Closed,
    /// Requests are rejected until the recovery timeout elapses.
    Open,
    /// One probe is in flight; its outcome decides the next state.
    HalfOpen,
}

/// What the caller should do with the wrapped effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Breaker closed: run the child normally.
    Proceed,
    /// Breaker recovering: run the child as the single probe.
    Probe,
    /// Breaker open: do not run the child.
    Reject,
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Shared table of breakers keyed by `(fsm_id, leaf_type)`.
#[derive(Default)]
pub struct BreakerTable {
    entries: DashMap<(String, String), Mutex<BreakerEntry>>,
}

impl BreakerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        fsm_id: &str,
        leaf_type: &str,
        f: impl FnOnce(&mut BreakerEntry) -> T,
    ) -> T {
        let entry = self
            .entries
            .entry((fsm_id.to_string(), leaf_type.to_string()))
            .or_insert_with(|| Mutex::new(BreakerEntry::new()));
        let mut guard = entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Decide whether the wrapped effect may run right now.
    pub fn check(
        &self,
        fsm_id: &str,
        leaf_type: &str,
        options: &BreakerOptions,
    ) -> BreakerDecision {
        let recovery = Duration::from_millis(options.recovery_timeout_ms);
        self.with_entry(fsm_id, leaf_type, |entry| match entry.state {
            BreakerState::Closed => BreakerDecision::Proceed,
            BreakerState::HalfOpen => BreakerDecision::Reject,
            BreakerState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|t| t.elapsed() >= recovery)
                    .unwrap_or(true);
                if elapsed {
                    entry.state = BreakerState::HalfOpen;
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Reject
                }
            }
        })
    }

    /// Record a successful child run: the breaker closes and the failure
    /// count resets.
    pub fn record_success(&self, fsm_id: &str, leaf_type: &str) {
        self.with_entry(fsm_id, leaf_type, |entry| {
            entry.state = BreakerState::Closed;
            entry.consecutive_failures = 0;
            entry.opened_at = None;
        });
    }

    /// Record a failed child run. A failed probe reopens immediately;
    /// reaching the threshold trips a closed breaker open.
    ///
    /// Returns the state after recording.
    pub fn record_failure(
        &self,
        fsm_id: &str,
        leaf_type: &str,
        options: &BreakerOptions,
    ) -> BreakerState {
        self.with_entry(fsm_id, leaf_type, |entry| {
            entry.consecutive_failures += 1;
            match entry.state {
                BreakerState::HalfOpen => {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(Instant::now());
                }
                BreakerState::Closed => {
                    if entry.consecutive_failures >= options.failure_threshold {
                        entry.state = BreakerState::Open;
                        entry.opened_at = Some(Instant::now());
                    }
                }
                BreakerState::Open => {}
            }
            entry.state
        })
    }

    /// Current state of one breaker, if it exists.
    pub fn state(&self, fsm_id: &str, leaf_type: &str) -> Option<BreakerState> {
        self.entries
            .get(&(fsm_id.to_string(), leaf_type.to_string()))
            .map(|entry| {
                entry
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .state
            })
    }
}

impl std::fmt::Debug for BreakerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}
