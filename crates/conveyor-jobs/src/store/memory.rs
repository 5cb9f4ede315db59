//! In-memory store (not persistent). Single-process only, but it honors
//! the same atomicity contract as the durable backends, so tests and dev
//! runs exercise the exact claim/retry/DLQ semantics.

use super::{DeadLetter, Job, JobId, JobStatus, JobStore, NewJob, QueueCounts};
use crate::breaker::{self, BreakerConfig, BreakerRecord, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::error::{JobError, Result};
use crate::limiter::{self, BucketRecord, RateLimiterConfig};
use crate::store::GuardStore;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    next_id: JobId,
    jobs: HashMap<JobId, Job>,
    dlq: Vec<DeadLetter>,
    breakers: HashMap<String, BreakerRecord>,
    buckets: HashMap<String, BucketRecord>,
}

/// In-memory job and guard store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| JobError::Storage("lock poisoned".to_string()))
    }

    fn to_chrono(delay: Duration) -> ChronoDuration {
        ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::MAX)
    }
}

/// Verifies the caller still owns the processing row.
fn owned_job<'a>(
    inner: &'a mut Inner,
    job_id: JobId,
    worker_id: &str,
) -> Result<&'a mut Job> {
    let job = inner
        .jobs
        .get_mut(&job_id)
        .ok_or(JobError::ClaimLost(job_id))?;
    if job.status != JobStatus::Processing || job.worker_id.as_deref() != Some(worker_id) {
        return Err(JobError::ClaimLost(job_id));
    }
    Ok(job)
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.jobs.insert(
            id,
            Job {
                id,
                job_type: new_job.job_type,
                payload: new_job.payload,
                status: JobStatus::Pending,
                priority: new_job.priority,
                attempts: 0,
                max_attempts: new_job.max_attempts,
                worker_id: None,
                heartbeat_at: None,
                next_attempt_at: None,
                error_message: None,
                created_at: now,
                completed_at: None,
            },
        );
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;

        let mut eligible: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending
                    && job.attempts < job.max_attempts
                    && job.next_attempt_at.map(|at| at <= now).unwrap_or(true)
            })
            .map(|job| job.id)
            .collect();

        eligible.sort_by(|a, b| {
            let (ja, jb) = (&inner.jobs[a], &inner.jobs[b]);
            jb.priority
                .cmp(&ja.priority)
                .then(ja.created_at.cmp(&jb.created_at))
                .then(ja.id.cmp(&jb.id))
        });
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let job = inner.jobs.get_mut(&id).expect("job present");
            job.status = JobStatus::Processing;
            job.worker_id = Some(worker_id.to_string());
            job.heartbeat_at = Some(now);
            job.next_attempt_at = None;
            job.attempts += 1;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn heartbeat(&self, job_id: JobId, worker_id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let job = owned_job(&mut inner, job_id, worker_id)?;
        job.heartbeat_at = Some(now);
        Ok(())
    }

    async fn complete(&self, job_id: JobId, worker_id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let job = owned_job(&mut inner, job_id, worker_id)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.worker_id = None;
        job.heartbeat_at = None;
        Ok(())
    }

    async fn retry(
        &self,
        job_id: JobId,
        worker_id: &str,
        delay: Duration,
        error: &str,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let job = owned_job(&mut inner, job_id, worker_id)?;
        job.status = JobStatus::Pending;
        job.next_attempt_at = Some(now + Self::to_chrono(delay));
        job.error_message = Some(error.to_string());
        job.worker_id = None;
        job.heartbeat_at = None;
        Ok(())
    }

    async fn defer(&self, job_id: JobId, worker_id: &str, delay: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let job = owned_job(&mut inner, job_id, worker_id)?;
        job.status = JobStatus::Pending;
        job.next_attempt_at = Some(now + Self::to_chrono(delay));
        job.worker_id = None;
        job.heartbeat_at = None;
        // The skip is not the job's fault; give the attempt back.
        job.attempts = job.attempts.saturating_sub(1);
        Ok(())
    }

    async fn dead_letter(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<DeadLetter> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        owned_job(&mut inner, job_id, worker_id)?;
        let job = inner.jobs.remove(&job_id).expect("job present");
        let entry = DeadLetter {
            id: job.id,
            job_type: job.job_type,
            payload: job.payload,
            priority: job.priority,
            attempts: job.attempts,
            error_message: error.to_string(),
            failed_at: now,
            created_at: job.created_at,
        };
        inner.dlq.push(entry.clone());
        Ok(entry)
    }

    async fn reclaim_stale(&self, stale_threshold: Duration) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = now - Self::to_chrono(stale_threshold);
        let mut inner = self.lock()?;

        let mut reclaimed = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Processing
                && job.heartbeat_at.map(|at| at < cutoff).unwrap_or(true)
            {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.heartbeat_at = None;
                job.next_attempt_at = None;
                // The claim's attempt charge is rolled back: the crashed
                // worker may never have started the handler.
                job.attempts = job.attempts.saturating_sub(1);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        let mut inner = self.lock()?;
        let job = inner.jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        match job.status {
            JobStatus::Pending | JobStatus::Processing | JobStatus::Failed => {
                job.status = JobStatus::Cancelled;
                job.worker_id = None;
                job.heartbeat_at = None;
                job.next_attempt_at = None;
            }
            JobStatus::Completed | JobStatus::Cancelled => {}
        }
        Ok(())
    }

    async fn list_dlq(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let inner = self.lock()?;
        Ok(inner.dlq.iter().rev().take(limit).cloned().collect())
    }

    async fn requeue_dlq(&self, dlq_id: JobId) -> Result<JobId> {
        let entry = {
            let mut inner = self.lock()?;
            let position = inner
                .dlq
                .iter()
                .position(|entry| entry.id == dlq_id)
                .ok_or(JobError::NotFound(dlq_id))?;
            inner.dlq.remove(position)
        };
        self.enqueue(
            NewJob::new(&entry.job_type, entry.payload).priority(entry.priority),
        )
        .await
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let inner = self.lock()?;
        let mut counts = QueueCounts {
            dead_lettered: inner.dlq.len() as u64,
            ..QueueCounts::default()
        };
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl GuardStore for MemoryStore {
    async fn breaker_is_open(&self, key: &str, config: &BreakerConfig) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let record = inner
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| BreakerRecord::new(key));
        Ok(breaker::check_open(record, config, now))
    }

    async fn breaker_record_success(
        &self,
        key: &str,
        _config: &BreakerConfig,
    ) -> Result<CircuitState> {
        let mut inner = self.lock()?;
        let record = inner
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| BreakerRecord::new(key));
        Ok(breaker::on_success(record))
    }

    async fn breaker_record_failure(
        &self,
        key: &str,
        config: &BreakerConfig,
    ) -> Result<CircuitState> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let record = inner
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| BreakerRecord::new(key));
        Ok(breaker::on_failure(record, config, now))
    }

    async fn limiter_try_acquire(&self, key: &str, config: &RateLimiterConfig) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let bucket = inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketRecord::new(key, config, now));
        Ok(limiter::try_acquire(bucket, config, now))
    }
}
