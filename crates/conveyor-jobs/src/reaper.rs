//! Background reclaim of jobs whose worker died mid-execution.
//!
//! A processing job whose heartbeat has gone stale is returned to
//! pending with its claim cleared and the charged attempt rolled back,
//! so a crash never burns one of the job's retries.

use crate::error::Result;
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to sweep.
    pub interval: Duration,
    /// A processing job is stale once its heartbeat is older than this.
    /// Must comfortably exceed the workers' heartbeat interval.
    pub stale_threshold: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(300),
        }
    }
}

pub struct HeartbeatReaper {
    store: Arc<dyn JobStore>,
    config: ReaperConfig,
}

impl HeartbeatReaper {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            config: ReaperConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReaperConfig) -> Self {
        self.config = config;
        self
    }

    /// One sweep; returns how many jobs were reclaimed.
    pub async fn tick(&self) -> Result<u64> {
        let reclaimed = self.store.reclaim_stale(self.config.stale_threshold).await?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed stale jobs from dead workers");
        } else {
            debug!("no stale jobs found");
        }
        Ok(reclaimed)
    }

    /// Sweep on an interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "heartbeat reaper started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "reaper sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("heartbeat reaper stopped");
    }
}
