//! Dnsgate DNS forwarder - entry point.
//!
//! This binary loads the configuration, builds the filtering forwarder and
//! serves DNS over UDP and TCP until interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use dnsgate::config::Config;
use dnsgate::forwarder::Forwarder;
use dnsgate::server::{init_metrics, run_server};

async fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    info!("Starting dnsgate DNS forwarder...");
    info!("Listening on: {}", config.bind);
    info!("Upstreams: {}", config.upstreams.len());
    info!("Filter lists: {}", config.filters.len());

    init_metrics(&config.metrics).context("Failed to initialize metrics")?;

    let (forwarder, warning) = Forwarder::init(config, None).context("Failed to initialize")?;
    if let Some(warning) = warning {
        warn!("initialized with a warning: {warning}");
    }
    let forwarder = Arc::new(forwarder);

    let running = Arc::new(AtomicBool::new(true));
    let server_running = Arc::clone(&running);
    let server_handle =
        tokio::spawn(async move { run_server(forwarder, server_running).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down...");
            running.store(false, Ordering::SeqCst);
        }
        result = server_handle => {
            if let Err(e) = result {
                tracing::error!("Server task failed: {}", e);
            }
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run().await
}
