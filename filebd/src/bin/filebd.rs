//! filebd daemon - serves a file as an NBD block device over TCP.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use filebd::{Config, Daemon};

#[derive(Parser)]
#[command(name = "filebd", about = "NBD block device server backed by a file")]
struct Cli {
    /// Path to config file. If omitted, uses defaults (64 MiB in-memory device).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backing file to export. Overrides config file if specified.
    #[arg(long)]
    backing_file: Option<PathBuf>,

    /// Listen address. Overrides config file if specified.
    #[arg(long)]
    address: Option<String>,

    /// In-memory device size in MiB when no backing file is given.
    #[arg(long)]
    size_mb: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(backing_file) = cli.backing_file {
        config.storage.path = Some(backing_file);
    }
    if let Some(address) = cli.address {
        config.nbd.address = address;
    }
    if let Some(size_mb) = cli.size_mb {
        config.device.size_mb = size_mb;
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let daemon = Daemon::from_config(config).context("Failed to create daemon")?;

    let listener = TcpListener::bind(daemon.nbd_address())
        .await
        .with_context(|| format!("Failed to bind: {}", daemon.nbd_address()))?;

    info!(
        address = %daemon.nbd_address(),
        size_bytes = daemon.size_bytes(),
        storage = %daemon
            .config()
            .storage
            .path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string()),
        "filebd started"
    );

    tokio::select! {
        result = daemon.listen(listener) => {
            result.context("NBD server error")?;
        }
        _ = shutdown_signal() => {
            info!(
                live_connections = daemon.registry().len().await,
                "shutting down"
            );
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("Failed to wait for Ctrl+C");
        info!("Received SIGINT");
    }
}
