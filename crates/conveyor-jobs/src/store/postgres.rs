//! Postgres-backed store. Claiming relies on `FOR UPDATE SKIP LOCKED` so
//! concurrent workers never block on or receive each other's rows, and
//! DLQ moves run in a single transaction so a job is never present in
//! both tables. Timestamps come from the database clock, which is the
//! shared source of truth across worker hosts.

use super::{DeadLetter, Job, JobId, JobStatus, JobStore, NewJob, QueueCounts};
use crate::breaker::{self, BreakerConfig, BreakerRecord, CircuitState};
use crate::error::{JobError, Result};
use crate::limiter::{self, BucketRecord, RateLimiterConfig};
use crate::store::GuardStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = Pool::<Postgres>::connect(url).await.map_err(storage_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id BIGSERIAL PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INT NOT NULL DEFAULT 0,
                attempts INT NOT NULL DEFAULT 0,
                max_attempts INT NOT NULL DEFAULT 3,
                worker_id TEXT,
                heartbeat_at TIMESTAMPTZ,
                next_attempt_at TIMESTAMPTZ,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_claim
                ON jobs (status, priority DESC, created_at ASC)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_heartbeat
                ON jobs (heartbeat_at) WHERE status = 'processing'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS jobs_dlq (
                id BIGINT PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                priority INT NOT NULL,
                attempts INT NOT NULL,
                error_message TEXT NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS circuit_breaker_state (
                key TEXT PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'closed',
                consecutive_failures INT NOT NULL DEFAULT 0,
                opened_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rate_limiter_state (
                key TEXT PRIMARY KEY,
                tokens DOUBLE PRECISION NOT NULL,
                last_refill_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }
}

fn storage_err(e: sqlx::Error) -> JobError {
    JobError::Storage(e.to_string())
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status: String = row.get("status");
    let status = JobStatus::parse(&status)
        .ok_or_else(|| JobError::Storage(format!("unknown job status '{status}'")))?;
    Ok(Job {
        id: row.get("id"),
        job_type: row.get("job_type"),
        payload: row.get("payload"),
        status,
        priority: row.get("priority"),
        attempts: row.get::<i32, _>("attempts") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        worker_id: row.get("worker_id"),
        heartbeat_at: row.get("heartbeat_at"),
        next_attempt_at: row.get("next_attempt_at"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

fn dead_letter_from_row(row: &PgRow) -> DeadLetter {
    DeadLetter {
        id: row.get("id"),
        job_type: row.get("job_type"),
        payload: row.get("payload"),
        priority: row.get("priority"),
        attempts: row.get::<i32, _>("attempts") as u32,
        error_message: row.get("error_message"),
        failed_at: row.get("failed_at"),
        created_at: row.get("created_at"),
    }
}

const JOB_COLUMNS: &str = "id, job_type, payload, status, priority, attempts, max_attempts, \
     worker_id, heartbeat_at, next_attempt_at, error_message, created_at, completed_at";

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (job_type, payload, priority, max_attempts)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.max_attempts as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.get("id"))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            WITH picked AS (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND attempts < max_attempts
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                ORDER BY priority DESC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            UPDATE jobs j
            SET status = 'processing',
                worker_id = $1,
                heartbeat_at = NOW(),
                next_attempt_at = NULL,
                attempts = j.attempts + 1
            FROM picked
            WHERE j.id = picked.id
            RETURNING j.id, j.job_type, j.payload, j.status, j.priority, j.attempts,
                      j.max_attempts, j.worker_id, j.heartbeat_at, j.next_attempt_at,
                      j.error_message, j.created_at, j.completed_at
            "#,
        )
        .bind(worker_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>>>()?;
        // UPDATE ... FROM does not preserve the subquery's order.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    async fn heartbeat(&self, job_id: JobId, worker_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET heartbeat_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(JobError::ClaimLost(job_id));
        }
        Ok(())
    }

    async fn complete(&self, job_id: JobId, worker_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = NOW(),
                worker_id = NULL, heartbeat_at = NULL
            WHERE id = $1 AND worker_id = $2 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(JobError::ClaimLost(job_id));
        }
        Ok(())
    }

    async fn retry(
        &self,
        job_id: JobId,
        worker_id: &str,
        delay: Duration,
        error: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                next_attempt_at = NOW() + make_interval(secs => $3),
                error_message = $4,
                worker_id = NULL, heartbeat_at = NULL
            WHERE id = $1 AND worker_id = $2 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(JobError::ClaimLost(job_id));
        }
        Ok(())
    }

    async fn defer(&self, job_id: JobId, worker_id: &str, delay: Duration) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                next_attempt_at = NOW() + make_interval(secs => $3),
                attempts = GREATEST(attempts - 1, 0),
                worker_id = NULL, heartbeat_at = NULL
            WHERE id = $1 AND worker_id = $2 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(JobError::ClaimLost(job_id));
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<DeadLetter> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE id = $1 AND worker_id = $2 AND status = 'processing'
            FOR UPDATE
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .ok_or(JobError::ClaimLost(job_id))?;
        let job = job_from_row(&row)?;

        let dlq_row = sqlx::query(
            r#"
            INSERT INTO jobs_dlq
                (id, job_type, payload, priority, attempts, error_message, failed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), $7)
            RETURNING id, job_type, payload, priority, attempts, error_message, failed_at, created_at
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.attempts as i32)
        .bind(error)
        .bind(job.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(dead_letter_from_row(&dlq_row))
    }

    async fn reclaim_stale(&self, stale_threshold: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL, heartbeat_at = NULL, next_attempt_at = NULL,
                attempts = GREATEST(attempts - 1, 0)
            WHERE status = 'processing'
              AND (heartbeat_at IS NULL
                   OR heartbeat_at < NOW() - make_interval(secs => $1))
            "#,
        )
        .bind(stale_threshold.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                worker_id = NULL, heartbeat_at = NULL, next_attempt_at = NULL
            WHERE id = $1 AND status IN ('pending', 'processing', 'failed')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 && self.get(job_id).await?.is_none() {
            return Err(JobError::NotFound(job_id));
        }
        Ok(())
    }

    async fn list_dlq(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_type, payload, priority, attempts, error_message, failed_at, created_at
            FROM jobs_dlq
            ORDER BY failed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.iter().map(dead_letter_from_row).collect())
    }

    async fn requeue_dlq(&self, dlq_id: JobId) -> Result<JobId> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query(
            r#"
            SELECT id, job_type, payload, priority, attempts, error_message, failed_at, created_at
            FROM jobs_dlq WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(dlq_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .ok_or(JobError::NotFound(dlq_id))?;
        let entry = dead_letter_from_row(&row);

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (job_type, payload, priority, max_attempts)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&entry.job_type)
        .bind(&entry.payload)
        .bind(entry.priority)
        .bind(crate::retry::DEFAULT_MAX_ATTEMPTS as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query("DELETE FROM jobs_dlq WHERE id = $1")
            .bind(dlq_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(inserted.get("id"))
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut counts = QueueCounts::default();
        for row in &rows {
            let status: String = row.get("status");
            let total = row.get::<i64, _>("total") as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => counts.pending = total,
                Some(JobStatus::Processing) => counts.processing = total,
                Some(JobStatus::Completed) => counts.completed = total,
                Some(JobStatus::Failed) => counts.failed = total,
                Some(JobStatus::Cancelled) => counts.cancelled = total,
                None => {}
            }
        }

        let dlq = sqlx::query("SELECT COUNT(*) AS total FROM jobs_dlq")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        counts.dead_lettered = dlq.get::<i64, _>("total") as u64;
        Ok(counts)
    }
}

fn breaker_from_row(row: &PgRow) -> Result<BreakerRecord> {
    let state: String = row.get("state");
    let state = CircuitState::parse(&state)
        .ok_or_else(|| JobError::Storage(format!("unknown breaker state '{state}'")))?;
    Ok(BreakerRecord {
        key: row.get("key"),
        state,
        consecutive_failures: row.get::<i32, _>("consecutive_failures") as u32,
        opened_at: row.get("opened_at"),
    })
}

impl PostgresStore {
    /// Row-locked read-modify-write on a breaker record. `apply` runs the
    /// pure transition; the surrounding transaction makes it atomic
    /// across processes.
    async fn with_breaker<T, F>(&self, key: &str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut BreakerRecord, DateTime<Utc>) -> T + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO circuit_breaker_state (key) VALUES ($1) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        let row = sqlx::query(
            r#"
            SELECT key, state, consecutive_failures, opened_at, NOW() AS db_now
            FROM circuit_breaker_state WHERE key = $1
            FOR UPDATE
            "#,
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;
        let now: DateTime<Utc> = row.get("db_now");
        let mut record = breaker_from_row(&row)?;

        let outcome = apply(&mut record, now);

        sqlx::query(
            r#"
            UPDATE circuit_breaker_state
            SET state = $2, consecutive_failures = $3, opened_at = $4
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(record.state.as_str())
        .bind(record.consecutive_failures as i32)
        .bind(record.opened_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(outcome)
    }
}

#[async_trait]
impl GuardStore for PostgresStore {
    async fn breaker_is_open(&self, key: &str, config: &BreakerConfig) -> Result<bool> {
        let config = *config;
        self.with_breaker(key, move |record, now| {
            breaker::check_open(record, &config, now)
        })
        .await
    }

    async fn breaker_record_success(
        &self,
        key: &str,
        _config: &BreakerConfig,
    ) -> Result<CircuitState> {
        self.with_breaker(key, |record, _now| breaker::on_success(record))
            .await
    }

    async fn breaker_record_failure(
        &self,
        key: &str,
        config: &BreakerConfig,
    ) -> Result<CircuitState> {
        let config = *config;
        self.with_breaker(key, move |record, now| {
            breaker::on_failure(record, &config, now)
        })
        .await
    }

    async fn limiter_try_acquire(&self, key: &str, config: &RateLimiterConfig) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            r#"
            INSERT INTO rate_limiter_state (key, tokens, last_refill_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(config.capacity)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        let row = sqlx::query(
            r#"
            SELECT key, tokens, last_refill_at, NOW() AS db_now
            FROM rate_limiter_state WHERE key = $1
            FOR UPDATE
            "#,
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;
        let now: DateTime<Utc> = row.get("db_now");
        let mut bucket = BucketRecord {
            key: row.get("key"),
            tokens: row.get("tokens"),
            last_refill_at: row.get("last_refill_at"),
        };

        let granted = limiter::try_acquire(&mut bucket, config, now);

        sqlx::query(
            "UPDATE rate_limiter_state SET tokens = $2, last_refill_at = $3 WHERE key = $1",
        )
        .bind(key)
        .bind(bucket.tokens)
        .bind(bucket.last_refill_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(granted)
    }
}
