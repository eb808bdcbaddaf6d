//! Passive network traffic sensor entry point.

mod config;
mod decode;
mod persister;
mod pipeline;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::Config;
use pipeline::Sensor;

/// Passive network traffic sensor: capture, reassemble, analyze, and
/// either log locally or forward to a manager.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(short = 'c', long = "cfg", default_value = "config.yml")]
    cfg: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into())))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!(cfg = %cli.cfg, "sentry-sensor v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.cfg)?;
    let sensor = Arc::new(Sensor::build(config)?);

    sensor.run().await?;
    tracing::info!("shutdown complete");
    Ok(())
}
