//! Pivot reversal bot entry point.

use anyhow::Result;
use clap::Parser;
use pivot_bot::{AppConfig, Application};
use tracing::info;

/// Webhook-driven pivot reversal bot
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via PIVOT_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any TLS connection is opened.
    pivot_ws::init_crypto();

    let args = Args::parse();
    let config_path = AppConfig::resolve_path(args.config);
    let config = AppConfig::load(&config_path)?;

    pivot_telemetry::init_logging(config.telemetry.log_level.as_deref())?;
    info!(config_path = %config_path, "Starting pivot-bot v{}", env!("CARGO_PKG_VERSION"));

    Application::new(config)?.run().await?;
    Ok(())
}
