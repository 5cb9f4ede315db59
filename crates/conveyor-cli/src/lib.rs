//! Operational surface for the conveyor job queue: enqueueing, worker and
//! reaper daemons, dead-letter triage, and status counts, all against the
//! Postgres store.

pub mod cli;
mod commands;

pub use cli::Cli;

/// Initialize structured logging; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
