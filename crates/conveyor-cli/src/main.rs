use clap::Parser;
use conveyor_cli::Cli;
use conveyor_jobs::HandlerRegistry;

#[tokio::main]
async fn main() {
    conveyor_cli::init_tracing();

    // Deployments that embed business handlers build their own binary
    // around `Cli::execute` with a populated registry; the stock binary
    // serves the operational commands only.
    let registry = HandlerRegistry::new();
    if let Err(e) = Cli::parse().execute(registry).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
