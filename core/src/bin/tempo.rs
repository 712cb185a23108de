//! Tempo command-line interface
//!
//! Administrative commands against a PostgreSQL-backed runtime: migrate,
//! invoke the sample workflows, inspect executions and run a worker.

use tempo_core::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
