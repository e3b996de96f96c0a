//! Shoal CLI - Command-line interface
//!
//! Downloads a torrent from a list of peers, inspects metadata documents, and
//! runs local simulated swarms.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use shoal_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "A BitTorrent peer-wire download client")]
#[command(version)]
struct Cli {
    /// Console log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level, cli.logs_dir.as_deref())
        .context("Failed to initialize logging")?;

    commands::handle_command(cli.command).await
}
