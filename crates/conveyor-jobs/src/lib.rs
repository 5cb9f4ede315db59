//! Durable job queue with worker coordination.
//!
//! Jobs are persisted rows claimed by competing worker processes under
//! skip-locked semantics. Failed attempts retry with exponential backoff
//! until exhausted, then land in a dead-letter queue. Handlers that call
//! external services are gated by a durable circuit breaker and token
//! bucket rate limiter, and a heartbeat reaper reclaims jobs from
//! workers that died mid-execution.

pub mod breaker;
pub mod clock;
pub mod error;
pub mod job;
pub mod limiter;
pub mod notify;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod worker;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, Result};
pub use job::{HandlerRegistry, Job, JobContext, JobHandler};
pub use limiter::{RateLimiter, RateLimiterConfig};
pub use notify::{Notifier, TracingNotifier};
pub use reaper::{HeartbeatReaper, ReaperConfig};
pub use retry::{Decision, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use store::memory::MemoryStore;
pub use store::{
    DeadLetter, GuardStore, JobId, JobStatus, JobStore, NewJob, QueueCounts,
};

pub use worker::{Worker, WorkerConfig};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;
