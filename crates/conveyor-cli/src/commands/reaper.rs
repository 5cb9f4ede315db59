use crate::commands::shutdown_on_ctrl_c;
use anyhow::Result;
use clap::Args;
use conveyor_jobs::{HeartbeatReaper, PostgresStore, ReaperConfig};
use std::sync::Arc;
use std::time::Duration;

/// Arguments for the `reaper run` command
#[derive(Args, Debug)]
pub struct ReaperRunArgs {
    /// Seconds between sweeps
    #[arg(long, default_value_t = 60)]
    pub interval_secs: u64,

    /// Heartbeat age in seconds before a processing job is reclaimed
    #[arg(long, default_value_t = 300)]
    pub stale_threshold_secs: u64,
}

pub async fn run_reaper(store: Arc<PostgresStore>, args: ReaperRunArgs) -> Result<()> {
    let reaper = HeartbeatReaper::new(store).with_config(ReaperConfig {
        interval: Duration::from_secs(args.interval_secs),
        stale_threshold: Duration::from_secs(args.stale_threshold_secs),
    });
    reaper.run(shutdown_on_ctrl_c()).await;
    Ok(())
}
