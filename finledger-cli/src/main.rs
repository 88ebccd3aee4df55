//! Finledger CLI - schema migrations for the ledger database

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::migrate;

/// Finledger - keep the ledger schema current
#[derive(Parser)]
#[command(name = "fl", version, about, long_about = None)]
struct Cli {
    /// Ledger directory (holds the database, settings.json and logs.sqlite)
    #[arg(long, global = true, env = "FINLEDGER_DIR")]
    dir: Option<PathBuf>,

    /// Load migration units from this directory instead of the built-in history
    #[arg(long, global = true)]
    migrations: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan, apply and revert schema migrations
    Migrate {
        #[command(subcommand)]
        command: migrate::MigrateCommands,
    },
}

/// Diagnostics go to stderr, filtered by FINLEDGER_LOG (default: warn)
fn init_tracing() {
    let filter = EnvFilter::try_from_env("FINLEDGER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = run(cli);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let location = commands::Location {
        dir: cli.dir,
        migrations: cli.migrations,
    };

    match cli.command {
        Commands::Migrate { command } => migrate::run(&location, command),
    }
}
