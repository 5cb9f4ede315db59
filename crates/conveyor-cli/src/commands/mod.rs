//! CLI commands

mod dlq;
mod enqueue;
mod reaper;
mod status;
mod worker;

pub use dlq::{dlq, DlqCommands};
pub use enqueue::{enqueue, EnqueueArgs};
pub use reaper::{run_reaper, ReaperRunArgs};
pub use status::status;
pub use worker::{run_workers, WorkerRunArgs};

use anyhow::Context;
use conveyor_jobs::PostgresStore;
use std::sync::Arc;
use tokio::sync::watch;

pub(crate) async fn connect(url: &str) -> anyhow::Result<Arc<PostgresStore>> {
    let store = PostgresStore::connect(url)
        .await
        .context("failed to connect to the job store")?;
    store
        .ensure_schema()
        .await
        .context("failed to ensure queue tables")?;
    Ok(Arc::new(store))
}

/// Watch channel that flips to true on Ctrl-C.
pub(crate) fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received; finishing in-flight work");
            let _ = tx.send(true);
        }
    });
    rx
}
