//! Token-bucket rate limiter for calls to a protected dependency.
//!
//! Bucket state is durable and keyed per dependency, so the limit holds
//! across all worker processes sharing the store. A denied token is not a
//! job failure: the worker defers the job without charging an attempt.

use crate::error::Result;
use crate::store::GuardStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Bucket capacity: the largest burst permitted.
    pub capacity: f64,
    /// Tokens replenished per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 1.0,
        }
    }
}

/// Durable per-key bucket state. New buckets start full.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRecord {
    pub key: String,
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
}

impl BucketRecord {
    pub fn new(key: &str, config: &RateLimiterConfig, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            tokens: config.capacity,
            last_refill_at: now,
        }
    }
}

/// Pure read-modify-write step: refill for elapsed time (capped at
/// capacity), then consume one token if available.
pub(crate) fn try_acquire(
    record: &mut BucketRecord,
    config: &RateLimiterConfig,
    now: DateTime<Utc>,
) -> bool {
    let elapsed_ms = now
        .signed_duration_since(record.last_refill_at)
        .num_milliseconds()
        .max(0) as f64;
    record.tokens =
        (record.tokens + elapsed_ms / 1000.0 * config.refill_per_sec).min(config.capacity);
    record.last_refill_at = now;

    if record.tokens >= 1.0 {
        record.tokens -= 1.0;
        true
    } else {
        false
    }
}

/// Store-backed token bucket shared by all workers.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn GuardStore>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn GuardStore>, config: RateLimiterConfig) -> Self {
        Self { store, config }
    }

    /// Consume one token for `key` if available.
    pub async fn try_acquire(&self, key: &str) -> Result<bool> {
        self.store.limiter_try_acquire(key, &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimiterConfig {
        RateLimiterConfig {
            capacity: 5.0,
            refill_per_sec: 1.0,
        }
    }

    #[test]
    fn burst_up_to_capacity_then_denied() {
        let config = config();
        let now = Utc::now();
        let mut bucket = BucketRecord::new("ai", &config, now);

        for _ in 0..5 {
            assert!(try_acquire(&mut bucket, &config, now));
        }
        assert!(!try_acquire(&mut bucket, &config, now));
    }

    #[test]
    fn one_second_refills_exactly_one_token() {
        let config = config();
        let start = Utc::now();
        let mut bucket = BucketRecord::new("ai", &config, start);
        for _ in 0..5 {
            try_acquire(&mut bucket, &config, start);
        }

        let later = start + chrono::Duration::seconds(1);
        assert!(try_acquire(&mut bucket, &config, later));
        assert!(!try_acquire(&mut bucket, &config, later));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let config = config();
        let start = Utc::now();
        let mut bucket = BucketRecord::new("ai", &config, start);

        let much_later = start + chrono::Duration::days(1);
        let mut granted = 0;
        while try_acquire(&mut bucket, &config, much_later) {
            granted += 1;
        }
        assert_eq!(granted, 5);
    }

    #[test]
    fn clock_skew_backwards_does_not_refill() {
        let config = config();
        let start = Utc::now();
        let mut bucket = BucketRecord::new("ai", &config, start);
        for _ in 0..5 {
            try_acquire(&mut bucket, &config, start);
        }

        let earlier = start - chrono::Duration::seconds(30);
        assert!(!try_acquire(&mut bucket, &config, earlier));
    }
}
