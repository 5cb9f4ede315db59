use std::time::Duration;
use thiserror::Error;

use crate::store::JobId;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store is unreachable or an operation against it failed. Never
    /// counted against a job's attempts; callers log and back off.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    /// The claim on a processing job was lost (reclaimed by the reaper,
    /// cancelled, or taken over). The holder must abandon the job without
    /// any further state mutation.
    #[error("claim on job {0} lost")]
    ClaimLost(JobId),

    /// Business-logic failure inside a handler. Always charged against
    /// the job's attempts and routed through the retry policy.
    #[error("handler error: {0}")]
    Handler(String),

    /// Raised by circuit-breaker or rate-limiter gating. The job is
    /// deferred, not failed, and the attempt is not charged.
    #[error("dependency '{key}' unavailable, retry after {retry_after:?}")]
    DependencyUnavailable { key: String, retry_after: Duration },

    #[error("handler exceeded its {0}s budget")]
    Timeout(u64),

    #[error("unknown job type: {0}")]
    UnknownJobType(String),
}

pub type Result<T> = std::result::Result<T, JobError>;
