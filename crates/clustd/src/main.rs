//! # clustd
//!
//! Cluster membership daemon binary.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use clustd::DaemonHandle;
use clustd::config::AppConfig;
use clustd_common::constants::DEFAULT_CONFIG_PATH;

/// clustd - cluster membership and master election
#[derive(Parser, Debug)]
#[command(name = "clustd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "CLUSTD_CONFIG")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🔥 Starting clustd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config)?;
    info!("📋 Configuration loaded from {}", args.config);
    info!(
        id = %config.cluster.id,
        remote_address = %config.server.remote_address,
        seeds = config.cluster.machines.len(),
        "Node identity"
    );

    let daemon = DaemonHandle::start(config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("🛑 Shutdown signal received");

    daemon.shutdown().await;
    info!("👋 clustd shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
