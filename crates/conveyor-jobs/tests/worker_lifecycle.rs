//! End-to-end lifecycle scenarios over the in-memory store: retries with
//! backoff, dead-lettering, breaker and limiter gating, timeouts, and
//! claim loss mid-execution.

use async_trait::async_trait;
use conveyor_jobs::{
    BreakerConfig, DeadLetter, HandlerRegistry, Job, JobContext, JobError, JobStatus, JobStore,
    ManualClock, MemoryStore, NewJob, Notifier, RateLimiterConfig, Result, RetryPolicy, Worker,
    WorkerConfig,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Fails its first `fail_first` calls, then succeeds.
struct Flaky {
    calls: Arc<AtomicU32>,
    fail_first: u32,
}

#[async_trait]
impl Job for Flaky {
    const NAME: &'static str = "flaky";
    type Data = serde_json::Value;

    async fn execute(&self, _ctx: JobContext, _data: Self::Data) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            Err(JobError::Handler(format!("transient failure on call {call}")))
        } else {
            Ok(())
        }
    }
}

/// Like [`Flaky`] but gated on an external dependency key.
struct GatedFlaky {
    calls: Arc<AtomicU32>,
    fail_first: u32,
}

#[async_trait]
impl Job for GatedFlaky {
    const NAME: &'static str = "gated";
    const DEPENDENCY: Option<&'static str> = Some("carrier-api");
    type Data = serde_json::Value;

    async fn execute(&self, _ctx: JobContext, _data: Self::Data) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            Err(JobError::Handler(format!("carrier error on call {call}")))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    dead_lettered: Mutex<Vec<DeadLetter>>,
    opened_keys: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn job_dead_lettered(&self, entry: &DeadLetter) {
        self.dead_lettered.lock().unwrap().push(entry.clone());
    }

    async fn breaker_opened(&self, key: &str) {
        self.opened_keys.lock().unwrap().push(key.to_string());
    }
}

fn harness() -> (Arc<ManualClock>, Arc<MemoryStore>) {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    (clock, store)
}

fn worker_with(
    store: Arc<MemoryStore>,
    registry: HandlerRegistry,
    config: WorkerConfig,
) -> Worker {
    Worker::new(store.clone(), store, Arc::new(registry)).with_config(config)
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(60))
}

#[tokio::test]
async fn job_succeeds_on_third_attempt_after_backoff() {
    let (clock, store) = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(Flaky {
        calls: calls.clone(),
        fail_first: 2,
    });
    let worker = worker_with(store.clone(), registry, WorkerConfig::default())
        .with_retry_policy(fast_retries());

    let id = store
        .enqueue(NewJob::new("flaky", json!({"order": 42})))
        .await
        .unwrap();

    // Attempt 1 fails; retry scheduled 100ms out (base * 2^0).
    assert_eq!(worker.run_once().await.unwrap(), 1);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.error_message.as_deref().unwrap().contains("call 1"));

    // Not yet eligible.
    clock.advance_millis(50);
    assert_eq!(worker.run_once().await.unwrap(), 0);

    // Attempt 2 fails; delay doubles to 200ms.
    clock.advance_millis(60);
    assert_eq!(worker.run_once().await.unwrap(), 1);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);

    clock.advance_millis(210);
    assert_eq!(worker.run_once().await.unwrap(), 1);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_job_lands_in_dlq_with_last_error() {
    let (clock, store) = harness();
    let notifier = Arc::new(RecordingNotifier::default());
    let mut registry = HandlerRegistry::new();
    registry.register(Flaky {
        calls: Arc::new(AtomicU32::new(0)),
        fail_first: u32::MAX,
    });
    let worker = worker_with(store.clone(), registry, WorkerConfig::default())
        .with_retry_policy(fast_retries())
        .with_notifier(notifier.clone());

    let id = store
        .enqueue(NewJob::new("flaky", json!({})).max_attempts(2).priority(7))
        .await
        .unwrap();

    worker.run_once().await.unwrap();
    clock.advance_millis(150);
    worker.run_once().await.unwrap();

    assert!(store.get(id).await.unwrap().is_none());
    let dlq = store.list_dlq(10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].id, id);
    assert_eq!(dlq[0].attempts, 2);
    assert_eq!(dlq[0].priority, 7);
    assert!(dlq[0].error_message.contains("call 2"));
    assert_eq!(notifier.dead_lettered.lock().unwrap().len(), 1);

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.dead_lettered, 1);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn open_breaker_defers_without_charging_attempts() {
    let (clock, store) = harness();
    let notifier = Arc::new(RecordingNotifier::default());
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(GatedFlaky {
        calls: calls.clone(),
        fail_first: 2,
    });
    let worker = worker_with(store.clone(), registry, WorkerConfig::default())
        .with_retry_policy(fast_retries())
        .with_breaker_config(BreakerConfig {
            failure_threshold: 2,
            cool_down: Duration::from_secs(60),
        })
        .with_notifier(notifier.clone());

    let id = store
        .enqueue(NewJob::new("gated", json!({})).max_attempts(10))
        .await
        .unwrap();

    // Two handler failures trip the breaker.
    worker.run_once().await.unwrap();
    clock.advance_millis(150);
    worker.run_once().await.unwrap();
    assert_eq!(
        notifier.opened_keys.lock().unwrap().as_slice(),
        ["carrier-api"]
    );

    // Claimed while open: deferred for the cool-down, attempt rolled back.
    clock.advance_millis(250);
    assert_eq!(worker.run_once().await.unwrap(), 1);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // After the cool-down the half-open trial runs and succeeds, closing
    // the breaker and completing the job on its third execution.
    clock.advance_millis(61_000);
    assert_eq!(worker.run_once().await.unwrap(), 1);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limited_job_is_deferred_then_served_after_refill() {
    let (clock, store) = harness();
    let mut registry = HandlerRegistry::new();
    registry.register(GatedFlaky {
        calls: Arc::new(AtomicU32::new(0)),
        fail_first: 0,
    });
    let worker = worker_with(store.clone(), registry, WorkerConfig::default())
        .with_limiter_config(RateLimiterConfig {
            capacity: 1.0,
            refill_per_sec: 1.0,
        });

    let first = store.enqueue(NewJob::new("gated", json!({}))).await.unwrap();
    let second = store.enqueue(NewJob::new("gated", json!({}))).await.unwrap();

    // One token: the first job runs, the second is deferred uncharged.
    assert_eq!(worker.run_once().await.unwrap(), 2);
    assert_eq!(
        store.get(first).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
    let deferred = store.get(second).await.unwrap().unwrap();
    assert_eq!(deferred.status, JobStatus::Pending);
    assert_eq!(deferred.attempts, 0);
    assert!(deferred.next_attempt_at.is_some());

    clock.advance_millis(1_100);
    assert_eq!(worker.run_once().await.unwrap(), 1);
    assert_eq!(
        store.get(second).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

/// Parks forever; used to exercise the execution budget.
struct Stuck;

#[async_trait]
impl Job for Stuck {
    const NAME: &'static str = "stuck";
    type Data = serde_json::Value;

    async fn execute(&self, _ctx: JobContext, _data: Self::Data) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_job_is_charged_and_dead_lettered() {
    let (_clock, store) = harness();
    let mut registry = HandlerRegistry::new();
    registry.register(Stuck);
    let worker = worker_with(
        store.clone(),
        registry,
        WorkerConfig {
            job_timeout: Duration::from_secs(30),
            ..WorkerConfig::default()
        },
    );

    let id = store
        .enqueue(NewJob::new("stuck", json!({})).max_attempts(1))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    assert!(store.get(id).await.unwrap().is_none());
    let dlq = store.list_dlq(10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert!(dlq[0].error_message.contains("30s"));
}

/// Cancels its own job, then parks; the heartbeat must notice the lost
/// claim and abandon execution.
struct SelfCancelling {
    store: Arc<MemoryStore>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Job for SelfCancelling {
    const NAME: &'static str = "self-cancel";
    type Data = serde_json::Value;

    async fn execute(&self, ctx: JobContext, _data: Self::Data) -> Result<()> {
        self.store.cancel(ctx.job_id).await?;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn lost_claim_aborts_handler_without_state_mutation() {
    let (_clock, store) = harness();
    let finished = Arc::new(AtomicBool::new(false));
    let mut registry = HandlerRegistry::new();
    registry.register(SelfCancelling {
        store: store.clone(),
        finished: finished.clone(),
    });
    let worker = worker_with(store.clone(), registry, WorkerConfig::default());

    let id = store
        .enqueue(NewJob::new("self-cancel", json!({})))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!finished.load(Ordering::SeqCst));
}

/// Reports its dependency down without counting as a handler failure.
struct Degraded;

#[async_trait]
impl Job for Degraded {
    const NAME: &'static str = "degraded";
    type Data = serde_json::Value;

    async fn execute(&self, _ctx: JobContext, _data: Self::Data) -> Result<()> {
        Err(JobError::DependencyUnavailable {
            key: "erp".to_string(),
            retry_after: Duration::from_secs(30),
        })
    }
}

#[tokio::test]
async fn dependency_unavailable_defers_uncharged() {
    let (_clock, store) = harness();
    let mut registry = HandlerRegistry::new();
    registry.register(Degraded);
    let worker = worker_with(store.clone(), registry, WorkerConfig::default());

    let id = store
        .enqueue(NewJob::new("degraded", json!({})))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.next_attempt_at.is_some());
}

/// Holds the worker long enough for the heartbeat ticker to fire, then
/// sweeps for stale claims from inside the handler.
struct SlowSweeper {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    runs: Arc<AtomicU32>,
    swept: Arc<AtomicU32>,
}

#[async_trait]
impl Job for SlowSweeper {
    const NAME: &'static str = "slow-sweeper";
    type Data = serde_json::Value;

    async fn execute(&self, _ctx: JobContext, data: Self::Data) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if data["slow"].as_bool().unwrap_or(false) {
            self.clock.advance_millis(301_000);
            tokio::time::sleep(Duration::from_secs(16)).await;
            let swept = self.store.reclaim_stale(Duration::from_secs(300)).await?;
            self.swept.fetch_add(swept as u32, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn batch_members_stay_claimed_while_an_earlier_job_runs_long() {
    let (clock, store) = harness();
    let runs = Arc::new(AtomicU32::new(0));
    let swept = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(SlowSweeper {
        clock: clock.clone(),
        store: store.clone(),
        runs: runs.clone(),
        swept: swept.clone(),
    });
    let worker = worker_with(store.clone(), registry, WorkerConfig::default());

    let slow = store
        .enqueue(NewJob::new("slow-sweeper", json!({"slow": true})))
        .await
        .unwrap();
    let waiting = store
        .enqueue(NewJob::new("slow-sweeper", json!({"slow": false})))
        .await
        .unwrap();

    assert_eq!(worker.run_once().await.unwrap(), 2);

    // The sweep inside the slow job found nothing stale: the waiting
    // member was heartbeated while it queued, so no second worker could
    // steal and re-run it.
    assert_eq!(swept.load(Ordering::SeqCst), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    for id in [slow, waiting] {
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }
}

/// Cancels a sibling job that waits in the same claimed batch.
struct CancelSibling {
    store: Arc<MemoryStore>,
    target: Arc<AtomicI64>,
}

#[async_trait]
impl Job for CancelSibling {
    const NAME: &'static str = "cancel-sibling";
    type Data = serde_json::Value;

    async fn execute(&self, _ctx: JobContext, _data: Self::Data) -> Result<()> {
        self.store.cancel(self.target.load(Ordering::SeqCst)).await
    }
}

struct Counting {
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl Job for Counting {
    const NAME: &'static str = "counting";
    type Data = serde_json::Value;

    async fn execute(&self, _ctx: JobContext, _data: Self::Data) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn cancelled_batch_member_is_abandoned_before_execution() {
    let (_clock, store) = harness();
    let target = Arc::new(AtomicI64::new(0));
    let runs = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(CancelSibling {
        store: store.clone(),
        target: target.clone(),
    });
    registry.register(Counting { runs: runs.clone() });
    let worker = worker_with(store.clone(), registry, WorkerConfig::default());

    store
        .enqueue(NewJob::new("cancel-sibling", json!({})))
        .await
        .unwrap();
    let victim = store.enqueue(NewJob::new("counting", json!({}))).await.unwrap();
    target.store(victim, Ordering::SeqCst);

    assert_eq!(worker.run_once().await.unwrap(), 2);

    // The victim was never executed and keeps its cancelled state.
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.get(victim).await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn run_loop_drains_jobs_and_stops_on_shutdown() {
    let (_clock, store) = harness();
    let runs = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(Counting { runs: runs.clone() });
    let worker = Arc::new(worker_with(
        store.clone(),
        registry,
        WorkerConfig::default(),
    ));

    let id = store.enqueue(NewJob::new("counting", json!({}))).await.unwrap();
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    // A few poll intervals are plenty to claim and finish the job.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    tx.send(true).unwrap();
    handle.await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn run_loop_exits_when_shutdown_sender_is_dropped() {
    let (_clock, store) = harness();
    let mut registry = HandlerRegistry::new();
    registry.register(Counting {
        runs: Arc::new(AtomicU32::new(0)),
    });
    let worker = worker_with(store, registry, WorkerConfig::default());

    let (tx, rx) = watch::channel(false);
    drop(tx);
    tokio::spawn(async move { worker.run(rx).await })
        .await
        .unwrap();
}

#[tokio::test]
async fn requeued_dlq_job_runs_again_fresh() {
    let (clock, store) = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(Flaky {
        calls: calls.clone(),
        fail_first: 1,
    });
    let worker = worker_with(store.clone(), registry, WorkerConfig::default())
        .with_retry_policy(fast_retries());

    let id = store
        .enqueue(NewJob::new("flaky", json!({})).max_attempts(1))
        .await
        .unwrap();
    worker.run_once().await.unwrap();
    assert_eq!(store.list_dlq(10).await.unwrap().len(), 1);

    let new_id = store.requeue_dlq(id).await.unwrap();
    assert_ne!(new_id, id);
    assert!(store.list_dlq(10).await.unwrap().is_empty());

    clock.advance_millis(10);
    worker.run_once().await.unwrap();
    let job = store.get(new_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
