use crate::commands::shutdown_on_ctrl_c;
use anyhow::{ensure, Result};
use clap::Args;
use futures_util::future::try_join_all;
use conveyor_jobs::{HandlerRegistry, PostgresStore, Worker, WorkerConfig};
use std::sync::Arc;
use std::time::Duration;

/// Arguments for the `worker run` command
#[derive(Args, Debug)]
pub struct WorkerRunArgs {
    /// Worker loops to run in this process
    #[arg(short, long, default_value_t = 1)]
    pub concurrency: usize,

    /// Jobs claimed per batch
    #[arg(long, default_value_t = 10)]
    pub claim_batch: usize,

    /// Milliseconds between polls when the queue is empty
    #[arg(long, default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Seconds between heartbeats while a job executes
    #[arg(long, default_value_t = 15)]
    pub heartbeat_interval_secs: u64,

    /// Per-job execution budget in seconds
    #[arg(long, default_value_t = 300)]
    pub job_timeout_secs: u64,
}

pub async fn run_workers(
    store: Arc<PostgresStore>,
    registry: HandlerRegistry,
    args: WorkerRunArgs,
) -> Result<()> {
    ensure!(args.concurrency > 0, "concurrency must be at least 1");
    ensure!(
        !registry.is_empty(),
        "no job handlers registered; this process would dead-letter every job it claims"
    );

    let registry = Arc::new(registry);
    let shutdown = shutdown_on_ctrl_c();
    let mut handles = Vec::with_capacity(args.concurrency);
    for _ in 0..args.concurrency {
        // Each loop gets its own worker identity for claim attribution.
        let config = WorkerConfig {
            claim_limit: args.claim_batch,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
            job_timeout: Duration::from_secs(args.job_timeout_secs),
            ..WorkerConfig::default()
        };
        let worker = Worker::new(store.clone(), store.clone(), registry.clone())
            .with_config(config);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    try_join_all(handles).await?;
    Ok(())
}
