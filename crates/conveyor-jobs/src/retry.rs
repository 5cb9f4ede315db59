//! Retry decisions as a pure function of attempt count.
//!
//! `attempts` is the number of executions charged so far (1-based: a job
//! that just failed its first run has `attempts == 1`). The delay doubles
//! per attempt and is capped, so delays are monotone non-decreasing.

use std::time::Duration;

/// Default ceiling before dead-lettering.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY_MS: u64 = 5_000;
// Cap backoff at 24 hours.
const DEFAULT_MAX_DELAY_MS: u64 = 86_400_000;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Reschedule the job after `delay`.
    Retry { delay: Duration },
    /// Attempts exhausted; quarantine the job.
    DeadLetter,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Decide what happens after a failed execution.
    ///
    /// `delay = base_delay * 2^(attempts - 1)`, capped at `max_delay`.
    /// Once `attempts >= max_attempts` the decision is always DeadLetter.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> Decision {
        if attempts >= max_attempts {
            return Decision::DeadLetter;
        }

        let exp = attempts.saturating_sub(1).min(32);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay.as_millis() as u64);

        Decision::Retry {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy_100ms() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(3600))
    }

    #[test]
    fn first_failure_waits_base_delay() {
        let decision = policy_100ms().decide(1, 3);
        assert_eq!(
            decision,
            Decision::Retry {
                delay: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = policy_100ms();
        assert_eq!(
            policy.decide(2, 5),
            Decision::Retry {
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(
            policy.decide(3, 5),
            Decision::Retry {
                delay: Duration::from_millis(400)
            }
        );
    }

    #[test]
    fn exhausted_attempts_dead_letter() {
        let policy = policy_100ms();
        assert_eq!(policy.decide(3, 3), Decision::DeadLetter);
        assert_eq!(policy.decide(4, 3), Decision::DeadLetter);
        assert_eq!(policy.decide(1, 1), Decision::DeadLetter);
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        match policy.decide(20, 100) {
            Decision::Retry { delay } => assert_eq!(delay, Duration::from_secs(60)),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    proptest! {
        /// Backoff monotonicity: decide(n).delay <= decide(n+1).delay for
        /// all n below the ceiling.
        #[test]
        fn prop_backoff_monotone(n in 1u32..40, max in 50u32..100) {
            let policy = policy_100ms();
            let (a, b) = (policy.decide(n, max), policy.decide(n + 1, max));
            if let (Decision::Retry { delay: d1 }, Decision::Retry { delay: d2 }) = (a, b) {
                prop_assert!(d1 <= d2);
            }
        }

        /// The decision is DeadLetter exactly when attempts reach the ceiling.
        #[test]
        fn prop_dead_letter_iff_exhausted(attempts in 1u32..20, max in 1u32..20) {
            let decision = RetryPolicy::default().decide(attempts, max);
            if attempts >= max {
                prop_assert_eq!(decision, Decision::DeadLetter);
            } else {
                prop_assert!(
                    matches!(decision, Decision::Retry { .. }),
                    "expected retry for attempts={} max={}",
                    attempts,
                    max
                );
            }
        }

        /// Large attempt counts never overflow.
        #[test]
        fn prop_no_overflow(attempts in 1u32..u32::MAX, max in 2u32..u32::MAX) {
            let _ = RetryPolicy::default().decide(attempts, max);
        }
    }
}
