//! Ephemeral E2E - Main Entry Point
//!
//! Runs the registered end-to-end suites, each as its own module run with a
//! private build, server and browser pool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ephemeral_harness::config::{HarnessConfig, DEFAULT_CONFIG_FILE};

mod commands;
mod output;
mod suites;

use commands::{list, run};

/// Ephemeral end-to-end test driver
#[derive(Parser)]
#[command(name = "ephemeral-e2e")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Harness configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE, global = true, env = "EPHEMERAL_E2E_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test suites
    Run(run::RunArgs),

    /// List registered suites and their tests
    List(list::ListArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the test report.
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let config = HarnessConfig::load(&cli.config)?;
            let code = run::execute(args, config).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::List(args) => list::execute(args),
    }

    Ok(())
}
