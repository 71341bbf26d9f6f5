// Allow clippy warnings for CLI application
#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::gate;

/// Enfold CLI - operational tooling for the retrieval service
///
/// **CI Gates**:
///   gate - assert recorded p95 latencies against the stage budgets
#[derive(Parser)]
#[command(name = "enfold")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Enfold CLI - CI latency gates", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check recorded p95 latencies against the CI budgets
    Gate(gate::GateArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Gate(args) => gate::run(&args)?,
    };
    std::process::exit(exit_code);
}
