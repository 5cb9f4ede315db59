//! Durable storage for jobs, the dead-letter queue, and guard state.
//!
//! The store is the single synchronization point between worker processes:
//! claiming, breaker state, and limiter state are all atomic
//! read-modify-write operations against it, never in-process locks.

use crate::breaker::{BreakerConfig, CircuitState};
use crate::error::Result;
use crate::limiter::RateLimiterConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Store-assigned, monotonically increasing job identifier.
pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    /// Parked by an operator, written directly to the store rather than
    /// through this API; no queue operation produces it. The queue only
    /// reads it: never claimable, counted in [`QueueCounts::failed`], and
    /// [`JobStore::cancel`] may move it to cancelled. Terminal handler
    /// failures do not pass through this state: they move straight to
    /// the DLQ.
    Failed,
    /// Cancelled externally; workers and the reaper leave it untouched.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// A stored job row.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Higher is served first.
    pub priority: i32,
    /// Executions charged so far; incremented when the job is claimed.
    pub attempts: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for a job to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(job_type: &str, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.to_string(),
            payload,
            priority: 0,
            max_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Immutable snapshot of a job that exhausted its retries, kept for
/// operator triage and manual re-submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The original job id.
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub attempts: u32,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Per-status totals for the operational surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dead_lettered: u64,
}

/// Durable job table operations.
///
/// Every state-changing method that takes a `worker_id` verifies the claim
/// and answers [`crate::JobError::ClaimLost`] when the row is no longer
/// owned by that worker; the caller must then abandon the job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job; returns its assigned id.
    async fn enqueue(&self, job: NewJob) -> Result<JobId>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Atomically claim up to `limit` eligible pending jobs, ordered by
    /// `priority DESC, created_at ASC`, transitioning them to processing
    /// with the attempt charged. Concurrent callers never receive the same
    /// job (skip-locked semantics).
    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<Job>>;

    /// Refresh liveness on a processing job.
    async fn heartbeat(&self, job_id: JobId, worker_id: &str) -> Result<()>;

    async fn complete(&self, job_id: JobId, worker_id: &str) -> Result<()>;

    /// Schedule another attempt after `delay`, recording the failure. The
    /// attempt stays charged.
    async fn retry(&self, job_id: JobId, worker_id: &str, delay: Duration, error: &str)
        -> Result<()>;

    /// Return the job to pending after `delay` without charging the
    /// attempt taken at claim. Used for breaker/limiter skips, which
    /// reflect external unavailability rather than job-intrinsic failure.
    async fn defer(&self, job_id: JobId, worker_id: &str, delay: Duration) -> Result<()>;

    /// Atomically copy the job into the DLQ and delete it from the main
    /// table. The two tables never both contain the job.
    async fn dead_letter(&self, job_id: JobId, worker_id: &str, error: &str)
        -> Result<DeadLetter>;

    /// Reset processing jobs whose heartbeat is older than the threshold
    /// back to pending (immediately eligible), rolling back the attempt
    /// charged at claim. Returns how many were reclaimed.
    async fn reclaim_stale(&self, stale_threshold: Duration) -> Result<u64>;

    /// Externally cancel a pending or processing job. Idempotent; terminal
    /// jobs are left as they are.
    async fn cancel(&self, job_id: JobId) -> Result<()>;

    async fn list_dlq(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Re-submit a dead-lettered job as a fresh pending job with
    /// `attempts = 0`, consuming the DLQ entry. Returns the new job id.
    async fn requeue_dlq(&self, dlq_id: JobId) -> Result<JobId>;

    async fn counts(&self) -> Result<QueueCounts>;
}

/// Durable, per-key atomic state for circuit breakers and rate limiters.
///
/// Backends apply the pure transition functions from [`crate::breaker`]
/// and [`crate::limiter`] under per-key atomicity (a mutex in memory, a
/// row lock in Postgres), so concurrent workers never see torn state.
#[async_trait]
pub trait GuardStore: Send + Sync {
    /// Gate check; may transition an open breaker to half-open once its
    /// cool-down elapsed (then answers false, permitting one trial call).
    async fn breaker_is_open(&self, key: &str, config: &BreakerConfig) -> Result<bool>;

    async fn breaker_record_success(
        &self,
        key: &str,
        config: &BreakerConfig,
    ) -> Result<CircuitState>;

    /// Returns the state after the failure so callers can detect the
    /// closed-to-open transition and alert.
    async fn breaker_record_failure(
        &self,
        key: &str,
        config: &BreakerConfig,
    ) -> Result<CircuitState>;

    /// Consume one token for `key` if the bucket has any.
    async fn limiter_try_acquire(&self, key: &str, config: &RateLimiterConfig) -> Result<bool>;
}
