//! Claim-execute-finalize loop.
//!
//! Per job: `Claimed -> Executing -> {Completed | RetryScheduled |
//! DeadLettered | Deferred | Abandoned}`. Handler failures are absorbed
//! into the job lifecycle and never escape the loop; storage failures are
//! logged and the loop continues. While a handler runs, a heartbeat
//! ticker keeps the claims on the whole batch alive, not just the job
//! currently executing, so members waiting behind a slow job are never
//! reclaimed from a live worker. A lost claim aborts the handler future
//! and suppresses any further state mutation for that job.

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::error::{JobError, Result};
use crate::job::{HandlerRegistry, JobContext, JobHandler};
use crate::limiter::{RateLimiter, RateLimiterConfig};
use crate::notify::{Notifier, TracingNotifier};
use crate::retry::{Decision, RetryPolicy};
use crate::store::{GuardStore, Job, JobStore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Jobs claimed per batch.
    pub claim_limit: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Per-job execution budget; exceeding it is a handler failure.
    pub job_timeout: Duration,
    /// Deferral delay when the rate limiter denies a token.
    pub limiter_defer: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            claim_limit: 10,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            job_timeout: Duration::from_secs(300),
            limiter_defer: Duration::from_secs(1),
        }
    }
}

enum Outcome {
    Success,
    Failed(String),
    Deferred(Duration),
    ClaimLost,
}

pub struct Worker {
    store: Arc<dyn JobStore>,
    guard: Arc<dyn GuardStore>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    notifier: Arc<dyn Notifier>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        guard: Arc<dyn GuardStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::new(guard.clone(), BreakerConfig::default()),
            limiter: RateLimiter::new(guard.clone(), RateLimiterConfig::default()),
            guard,
            registry,
            retry_policy: RetryPolicy::default(),
            notifier: Arc::new(TracingNotifier),
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new(self.guard.clone(), config);
        self
    }

    pub fn with_limiter_config(mut self, config: RateLimiterConfig) -> Self {
        self.limiter = RateLimiter::new(self.guard.clone(), config);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim and process one batch. Returns how many jobs were claimed.
    pub async fn run_once(&self) -> Result<usize> {
        let mut jobs: VecDeque<Job> = self
            .store
            .claim_batch(&self.config.worker_id, self.config.claim_limit)
            .await?
            .into();
        let count = jobs.len();
        while let Some(job) = jobs.pop_front() {
            self.process(job, &mut jobs).await;
        }
        Ok(count)
    }

    /// Run the claim loop until `shutdown` flips to true. In-flight jobs
    /// finish before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.config.worker_id,
            claim_limit = self.config.claim_limit,
            job_types = ?self.registry.job_types(),
            "worker started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "claim batch failed; backing off");
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        // A dropped sender counts as shutdown.
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    async fn process(&self, job: Job, queued: &mut VecDeque<Job>) {
        // Batch members wait behind earlier jobs; re-verify (and refresh)
        // the claim before acting so a reclaimed or cancelled job is
        // abandoned instead of executed.
        match self.store.heartbeat(job.id, &self.config.worker_id).await {
            Ok(()) => {}
            Err(JobError::ClaimLost(_)) | Err(JobError::NotFound(_)) => {
                warn!(job_id = job.id, "claim lost while queued; abandoning");
                return;
            }
            Err(e) => {
                error!(job_id = job.id, error = %e, "claim check failed; abandoning");
                return;
            }
        }

        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!(job_id = job.id, job_type = %job.job_type, "no handler registered");
            let message = JobError::UnknownJobType(job.job_type.clone()).to_string();
            self.finalize_dead_letter(&job, &message).await;
            return;
        };

        // Breaker and limiter gate calls to the handler's dependency.
        // A skip defers the job without charging the attempt.
        if let Some(key) = handler.dependency() {
            match self.breaker.is_open(key).await {
                Ok(true) => {
                    debug!(job_id = job.id, key, "circuit open; deferring job");
                    self.finalize_defer(&job, self.breaker.config().cool_down).await;
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = job.id, key, error = %e, "breaker check failed");
                    self.finalize_defer(&job, self.config.limiter_defer).await;
                    return;
                }
            }
            match self.limiter.try_acquire(key).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = job.id, key, "rate limited; deferring job");
                    self.finalize_defer(&job, self.config.limiter_defer).await;
                    return;
                }
                Err(e) => {
                    error!(job_id = job.id, key, error = %e, "limiter check failed");
                    self.finalize_defer(&job, self.config.limiter_defer).await;
                    return;
                }
            }
        }

        let outcome = self.execute(handler.as_ref(), &job, queued).await;
        match outcome {
            Outcome::Success => {
                if let Some(key) = handler.dependency() {
                    if let Err(e) = self.breaker.record_success(key).await {
                        warn!(key, error = %e, "failed to record breaker success");
                    }
                }
                match self.store.complete(job.id, &self.config.worker_id).await {
                    Ok(()) => info!(
                        job_id = job.id,
                        job_type = %job.job_type,
                        attempt = job.attempts,
                        "job completed"
                    ),
                    Err(JobError::ClaimLost(_)) => {
                        warn!(job_id = job.id, "claim lost before completion; abandoning")
                    }
                    Err(e) => error!(job_id = job.id, error = %e, "failed to record completion"),
                }
            }
            Outcome::Deferred(delay) => self.finalize_defer(&job, delay).await,
            Outcome::ClaimLost => {
                warn!(job_id = job.id, "claim lost mid-execution; handler aborted")
            }
            Outcome::Failed(message) => {
                if let Some(key) = handler.dependency() {
                    match self.breaker.record_failure(key).await {
                        Ok(CircuitState::Open) => self.notifier.breaker_opened(key).await,
                        Ok(_) => {}
                        Err(e) => warn!(key, error = %e, "failed to record breaker failure"),
                    }
                }
                match self.retry_policy.decide(job.attempts, job.max_attempts) {
                    Decision::Retry { delay } => {
                        warn!(
                            job_id = job.id,
                            attempt = job.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "job failed; retry scheduled"
                        );
                        match self
                            .store
                            .retry(job.id, &self.config.worker_id, delay, &message)
                            .await
                        {
                            Ok(()) => {}
                            Err(JobError::ClaimLost(_)) => {
                                warn!(job_id = job.id, "claim lost before retry; abandoning")
                            }
                            Err(e) => {
                                error!(job_id = job.id, error = %e, "failed to schedule retry")
                            }
                        }
                    }
                    Decision::DeadLetter => self.finalize_dead_letter(&job, &message).await,
                }
            }
        }
    }

    /// Drive the handler under its timeout while heartbeating both the
    /// executing job and the rest of the claimed batch. A lost claim on
    /// the executing job breaks out, dropping (and thereby cancelling)
    /// the handler future.
    async fn execute(
        &self,
        handler: &dyn JobHandler,
        job: &Job,
        queued: &mut VecDeque<Job>,
    ) -> Outcome {
        let ctx = JobContext {
            job_id: job.id,
            attempt: job.attempts,
            created_at: job.created_at,
        };
        let fut = tokio::time::timeout(
            self.config.job_timeout,
            handler.handle(ctx, job.payload.clone()),
        );
        tokio::pin!(fut);
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );

        loop {
            tokio::select! {
                result = &mut fut => {
                    break match result {
                        Ok(Ok(())) => Outcome::Success,
                        Ok(Err(JobError::DependencyUnavailable { key, retry_after })) => {
                            debug!(job_id = job.id, key = %key, "handler reported dependency unavailable");
                            Outcome::Deferred(retry_after)
                        }
                        Ok(Err(e)) => Outcome::Failed(e.to_string()),
                        Err(_) => Outcome::Failed(
                            JobError::Timeout(self.config.job_timeout.as_secs()).to_string(),
                        ),
                    };
                }
                _ = heartbeat.tick() => {
                    match self.store.heartbeat(job.id, &self.config.worker_id).await {
                        Ok(()) => {}
                        Err(JobError::ClaimLost(_)) | Err(JobError::NotFound(_)) => {
                            break Outcome::ClaimLost;
                        }
                        // Transient storage trouble: keep executing, the
                        // next tick will try again.
                        Err(e) => warn!(job_id = job.id, error = %e, "heartbeat failed"),
                    }
                    self.heartbeat_queued(queued).await;
                }
            }
        }
    }

    /// Refresh the claims on batch members still waiting their turn. A
    /// member whose claim is gone is dropped from the queue; transient
    /// storage errors keep it, the next tick tries again.
    async fn heartbeat_queued(&self, queued: &mut VecDeque<Job>) {
        let mut kept = VecDeque::with_capacity(queued.len());
        while let Some(job) = queued.pop_front() {
            match self.store.heartbeat(job.id, &self.config.worker_id).await {
                Ok(()) => kept.push_back(job),
                Err(JobError::ClaimLost(_)) | Err(JobError::NotFound(_)) => {
                    warn!(job_id = job.id, "claim lost while queued; dropping from batch");
                }
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "queued heartbeat failed");
                    kept.push_back(job);
                }
            }
        }
        *queued = kept;
    }

    async fn finalize_defer(&self, job: &Job, delay: Duration) {
        match self.store.defer(job.id, &self.config.worker_id, delay).await {
            Ok(()) => debug!(
                job_id = job.id,
                delay_ms = delay.as_millis() as u64,
                "job deferred"
            ),
            Err(JobError::ClaimLost(_)) => {
                warn!(job_id = job.id, "claim lost before deferral; abandoning")
            }
            Err(e) => error!(job_id = job.id, error = %e, "failed to defer job"),
        }
    }

    async fn finalize_dead_letter(&self, job: &Job, message: &str) {
        match self
            .store
            .dead_letter(job.id, &self.config.worker_id, message)
            .await
        {
            Ok(entry) => self.notifier.job_dead_lettered(&entry).await,
            Err(JobError::ClaimLost(_)) => {
                warn!(job_id = job.id, "claim lost before dead-letter; abandoning")
            }
            Err(e) => error!(job_id = job.id, error = %e, "failed to dead-letter job"),
        }
    }
}
