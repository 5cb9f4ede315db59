//! Circuit breaker guarding a downstream dependency.
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: too many consecutive failures, calls are skipped
//! - **HalfOpen**: cool-down elapsed, one trial call permitted
//!
//! Opening the breaker never fails jobs permanently; the worker defers
//! them so the dependency is not hammered during an outage.
//!
//! State lives in the durable store (one row per dependency key) so every
//! worker process observes the same breaker. The transition functions here
//! are pure; each store backend applies them under per-key atomicity.

use crate::error::Result;
use crate::store::GuardStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before permitting a trial call.
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cool_down: Duration::from_secs(60),
        }
    }
}

/// Durable per-key breaker state.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerRecord {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Pure transition: a successful call. HalfOpen closes, Closed resets the
/// failure counter.
pub(crate) fn on_success(record: &mut BreakerRecord) -> CircuitState {
    match record.state {
        CircuitState::HalfOpen => {
            record.state = CircuitState::Closed;
            record.consecutive_failures = 0;
            record.opened_at = None;
        }
        CircuitState::Closed => {
            record.consecutive_failures = 0;
        }
        CircuitState::Open => {}
    }
    record.state
}

/// Pure transition: a failed call. Crossing the threshold while Closed
/// opens the circuit; a failed HalfOpen trial re-opens it.
pub(crate) fn on_failure(
    record: &mut BreakerRecord,
    config: &BreakerConfig,
    now: DateTime<Utc>,
) -> CircuitState {
    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
    match record.state {
        CircuitState::Closed => {
            if record.consecutive_failures >= config.failure_threshold {
                record.state = CircuitState::Open;
                record.opened_at = Some(now);
            }
        }
        CircuitState::HalfOpen => {
            record.state = CircuitState::Open;
            record.opened_at = Some(now);
        }
        CircuitState::Open => {}
    }
    record.state
}

/// Pure transition: gate check. Open transitions to HalfOpen once the
/// cool-down elapsed, permitting exactly one trial call (returns false).
pub(crate) fn check_open(
    record: &mut BreakerRecord,
    config: &BreakerConfig,
    now: DateTime<Utc>,
) -> bool {
    match record.state {
        CircuitState::Open => {
            let elapsed_since_open = record
                .opened_at
                .map(|at| now.signed_duration_since(at))
                .unwrap_or_else(chrono::Duration::zero);
            let cool_down =
                chrono::Duration::from_std(config.cool_down).unwrap_or(chrono::Duration::MAX);
            if elapsed_since_open >= cool_down {
                record.state = CircuitState::HalfOpen;
                false
            } else {
                true
            }
        }
        CircuitState::Closed | CircuitState::HalfOpen => false,
    }
}

/// Store-backed circuit breaker shared by all workers.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn GuardStore>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn GuardStore>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Whether calls to `key` should be skipped right now. An open breaker
    /// whose cool-down elapsed flips to half-open and answers false once,
    /// permitting a single trial call.
    pub async fn is_open(&self, key: &str) -> Result<bool> {
        self.store.breaker_is_open(key, &self.config).await
    }

    pub async fn record_success(&self, key: &str) -> Result<CircuitState> {
        self.store.breaker_record_success(key, &self.config).await
    }

    pub async fn record_failure(&self, key: &str) -> Result<CircuitState> {
        let state = self.store.breaker_record_failure(key, &self.config).await?;
        if state == CircuitState::Open {
            tracing::warn!(key, "circuit breaker open");
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cool_down: Duration::from_secs(60),
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let config = config();
        let now = Utc::now();
        let mut record = BreakerRecord::new("ai");

        assert_eq!(on_failure(&mut record, &config, now), CircuitState::Closed);
        assert_eq!(on_failure(&mut record, &config, now), CircuitState::Closed);
        assert_eq!(on_failure(&mut record, &config, now), CircuitState::Open);
        assert_eq!(record.opened_at, Some(now));
    }

    #[test]
    fn success_resets_failure_counter_while_closed() {
        let config = config();
        let now = Utc::now();
        let mut record = BreakerRecord::new("ai");

        on_failure(&mut record, &config, now);
        on_failure(&mut record, &config, now);
        on_success(&mut record);
        assert_eq!(record.consecutive_failures, 0);

        // Two more failures do not trip it: the streak was broken.
        on_failure(&mut record, &config, now);
        assert_eq!(
            on_failure(&mut record, &config, now),
            CircuitState::Closed
        );
    }

    #[test]
    fn cool_down_permits_exactly_one_trial() {
        let config = config();
        let opened = Utc::now();
        let mut record = BreakerRecord::new("ai");
        for _ in 0..3 {
            on_failure(&mut record, &config, opened);
        }

        // Before cool-down: still open.
        let early = opened + chrono::Duration::seconds(30);
        assert!(check_open(&mut record, &config, early));

        // After cool-down: half-open, one trial permitted.
        let later = opened + chrono::Duration::seconds(61);
        assert!(!check_open(&mut record, &config, later));
        assert_eq!(record.state, CircuitState::HalfOpen);
        // Further checks while half-open also pass; the state machine has
        // already transitioned.
        assert!(!check_open(&mut record, &config, later));
    }

    #[test]
    fn half_open_trial_success_closes() {
        let mut record = BreakerRecord::new("ai");
        record.state = CircuitState::HalfOpen;
        record.consecutive_failures = 3;

        assert_eq!(on_success(&mut record), CircuitState::Closed);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.opened_at, None);
    }

    #[test]
    fn half_open_trial_failure_reopens() {
        let config = config();
        let now = Utc::now();
        let mut record = BreakerRecord::new("ai");
        record.state = CircuitState::HalfOpen;
        record.consecutive_failures = 3;

        assert_eq!(on_failure(&mut record, &config, now), CircuitState::Open);
        assert_eq!(record.opened_at, Some(now));
    }

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            CircuitState::Closed,
            CircuitState::Open,
            CircuitState::HalfOpen,
        ] {
            assert_eq!(CircuitState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CircuitState::parse("bogus"), None);
    }
}
