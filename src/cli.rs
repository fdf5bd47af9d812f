use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mochi_sync_core::lock::Lock;
use mochi_sync_core::ratelimit::RateLimited;
use mochi_sync_core::synchronise::{synchronise, SyncError};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::MochiClient;
use crate::load_config::load_config;

/// CLI for mochi-sync: mirror a tree of markdown notes into Mochi decks.
#[derive(Parser)]
#[clap(
    name = "mochi-sync",
    version,
    about = "Synchronise a directory of markdown notes with Mochi decks and cards"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronise the notes directory named in the given config file
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

/// Flip the cancellation flag on Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[SYNC] Interrupted, finishing in-flight requests");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync { config } => {
            let loaded = load_config(config)?;
            let lock = Lock::load(&loaded.lock_file)
                .with_context(|| format!("Failed to load lock file {}", loaded.lock_file.display()))?;
            let client = RateLimited::new(MochiClient::new(loaded.mochi), loaded.sync.rate_limit);
            let cancel = cancel_on_ctrl_c();

            println!("Synchronise starting...");
            match synchronise(&loaded.sync, Arc::new(client), Arc::new(lock), Some(cancel)).await {
                Ok(report) => {
                    println!("Synchronise complete.");
                    println!("  files: {}, decks: {}", report.files, report.decks);
                    println!("  {}", report.tally);
                    for skipped in &report.skipped_files {
                        println!("  skipped (no deck): {skipped}");
                    }
                    if report.lock_written {
                        println!("  lock file updated: {}", loaded.lock_file.display());
                    }
                    info!(total = report.tally.total(), "[SYNC] Done");
                    Ok(())
                }
                Err(SyncError::Execute(e)) => {
                    eprintln!("[ERROR] Synchronisation finished with failures.");
                    eprintln!("  {}", e.tally);
                    eprintln!("{e}");
                    Err(anyhow::Error::new(e).context("Synchronisation failed"))
                }
                Err(e) => {
                    eprintln!("[ERROR] Synchronisation failed: {e}");
                    Err(anyhow::Error::new(e))
                }
            }
        }
    }
}
