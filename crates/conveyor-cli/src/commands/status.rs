use anyhow::Result;
use conveyor_jobs::{JobStore, PostgresStore};
use std::sync::Arc;

pub async fn status(store: Arc<PostgresStore>) -> Result<()> {
    let counts = store.counts().await?;
    println!("pending       {:>8}", counts.pending);
    println!("processing    {:>8}", counts.processing);
    println!("completed     {:>8}", counts.completed);
    println!("failed        {:>8}", counts.failed);
    println!("cancelled     {:>8}", counts.cancelled);
    println!("dead-lettered {:>8}", counts.dead_lettered);
    Ok(())
}
