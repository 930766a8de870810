//! fairgridd — the fairgrid daemon.
//!
//! Single binary that assembles the scheduling core:
//! - Accounting store (redb)
//! - Association/fairshare cache, restored from its checkpoint
//! - Backfill planner over the configured partitions
//! - Periodic storage refresh, usage decay and checkpointing
//!
//! # Usage
//!
//! ```text
//! fairgridd --config /etc/fairgrid/fairgrid.toml --state-dir /var/lib/fairgrid
//! ```

mod maintenance;
mod standalone;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fairgrid_core::FairgridConfig;

#[derive(Parser)]
#[command(name = "fairgridd", about = "fairgrid scheduling daemon")]
struct Cli {
    /// Path to fairgrid.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `accounting.state_dir`.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,fairgridd=debug,fairgrid=debug"))?;
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match &cli.config {
        Some(path) => FairgridConfig::from_file(path)?,
        None => FairgridConfig::default(),
    };
    if let Some(dir) = cli.state_dir {
        config.accounting.state_dir = dir;
    }

    if cli.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    standalone::run(config).await
}
