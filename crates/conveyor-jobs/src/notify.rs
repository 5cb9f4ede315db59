//! Alert hooks for operator-visible events. The core invokes these; the
//! deployment supplies the delivery mechanism (email, webhook, pager).

use crate::store::DeadLetter;
use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// A job exhausted its retries and was quarantined.
    async fn job_dead_lettered(&self, entry: &DeadLetter);

    /// A circuit breaker tripped open for a dependency key.
    async fn breaker_opened(&self, key: &str);
}

/// Default notifier: structured log records only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn job_dead_lettered(&self, entry: &DeadLetter) {
        tracing::error!(
            job_id = entry.id,
            job_type = %entry.job_type,
            attempts = entry.attempts,
            error = %entry.error_message,
            "job moved to dead-letter queue"
        );
    }

    async fn breaker_opened(&self, key: &str) {
        tracing::warn!(key, "circuit breaker opened; deferring dependent jobs");
    }
}
