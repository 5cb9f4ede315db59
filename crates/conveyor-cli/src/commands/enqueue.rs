use anyhow::{Context, Result};
use clap::Args;
use conveyor_jobs::{JobStore, NewJob, PostgresStore};
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the `enqueue` command
#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Job type discriminator the workers dispatch on
    pub job_type: String,

    /// Path to a JSON payload file, or `-` for stdin
    pub payload_file: PathBuf,

    /// Higher priority is served first
    #[arg(short, long, default_value_t = 0)]
    pub priority: i32,

    /// Executions before the job is dead-lettered
    #[arg(long, default_value_t = conveyor_jobs::DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
}

pub async fn enqueue(store: Arc<PostgresStore>, args: EnqueueArgs) -> Result<()> {
    let raw = if args.payload_file.as_os_str() == "-" {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("failed to read payload from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(&args.payload_file)
            .await
            .with_context(|| format!("failed to read {}", args.payload_file.display()))?
    };
    let payload: serde_json::Value =
        serde_json::from_str(&raw).context("payload is not valid JSON")?;

    let id = store
        .enqueue(
            NewJob::new(&args.job_type, payload)
                .priority(args.priority)
                .max_attempts(args.max_attempts),
        )
        .await?;
    println!("enqueued job {id}");
    Ok(())
}
