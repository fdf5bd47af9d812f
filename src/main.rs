use anyhow::Result;
use clap::Parser;
use mochi_sync::cli::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "Exiting with failure");
        std::process::exit(1);
    }
    Ok(())
}
