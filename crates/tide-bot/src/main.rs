//! Tide alert dispatch service - entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Alert dispatch service.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via TIDE_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // CLI arg > TIDE_CONFIG > default
    let config_path = args
        .config
        .or_else(|| std::env::var("TIDE_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = tide_bot::AppConfig::load(&config_path)?;
    tide_telemetry::init_logging(&config.telemetry)?;

    info!("Starting tide-bot v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = %config_path,
        destinations = config.routing.destinations.len(),
        api_enabled = config.api.enabled,
        "Configuration loaded"
    );

    let app = tide_bot::Application::new(config)?;
    app.run().await?;

    Ok(())
}
