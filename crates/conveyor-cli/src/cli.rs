//! CLI argument parsing

use crate::commands::{self, DlqCommands, EnqueueArgs, ReaperRunArgs, WorkerRunArgs};
use anyhow::Context;
use clap::{Parser, Subcommand};
use conveyor_jobs::HandlerRegistry;

/// Durable job queue operations
#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue a job from a JSON payload file
    Enqueue(EnqueueArgs),

    /// Worker daemon
    #[command(subcommand)]
    Worker(WorkerCommands),

    /// Heartbeat reaper daemon
    #[command(subcommand)]
    Reaper(ReaperCommands),

    /// Dead-letter queue triage
    #[command(subcommand)]
    Dlq(DlqCommands),

    /// Show per-status queue totals
    Status,
}

#[derive(Subcommand, Debug)]
enum WorkerCommands {
    /// Claim and execute jobs until interrupted
    Run(WorkerRunArgs),
}

#[derive(Subcommand, Debug)]
enum ReaperCommands {
    /// Reclaim jobs from dead workers until interrupted
    Run(ReaperRunArgs),
}

impl Cli {
    /// Execute the parsed command against the configured store. `registry`
    /// carries the deployment's job handlers; only `worker run` uses it.
    pub async fn execute(self, registry: HandlerRegistry) -> anyhow::Result<()> {
        let url = self
            .database_url
            .context("no database configured: pass --database-url or set DATABASE_URL")?;
        let store = commands::connect(&url).await?;

        match self.command {
            Commands::Enqueue(args) => commands::enqueue(store, args).await,
            Commands::Worker(WorkerCommands::Run(args)) => {
                commands::run_workers(store, registry, args).await
            }
            Commands::Reaper(ReaperCommands::Run(args)) => commands::run_reaper(store, args).await,
            Commands::Dlq(cmd) => commands::dlq(store, cmd).await,
            Commands::Status => commands::status(store).await,
        }
    }
}
