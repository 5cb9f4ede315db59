use anyhow::Result;
use clap::Subcommand;
use conveyor_jobs::{JobId, JobStore, PostgresStore};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum DlqCommands {
    /// List dead-lettered jobs
    List {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Re-submit a dead-lettered job as a fresh pending job
    Requeue {
        /// Original job id shown by `dlq list`
        id: JobId,
    },
}

pub async fn dlq(store: Arc<PostgresStore>, cmd: DlqCommands) -> Result<()> {
    match cmd {
        DlqCommands::List { limit } => {
            let entries = store.list_dlq(limit).await?;
            if entries.is_empty() {
                println!("dead-letter queue is empty");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{:>8}  {:<24} attempts={} failed_at={} error={}",
                    entry.id,
                    entry.job_type,
                    entry.attempts,
                    entry.failed_at.to_rfc3339(),
                    entry.error_message,
                );
            }
        }
        DlqCommands::Requeue { id } => {
            let new_id = store.requeue_dlq(id).await?;
            println!("requeued dead-letter {id} as job {new_id}");
        }
    }
    Ok(())
}
