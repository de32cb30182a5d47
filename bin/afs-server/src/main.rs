//! AFS Server - transactional storage daemon
//!
//! Opens the storage layout and the write-ahead log, recovers, then serves
//! sessions and runs background maintenance until interrupted.

use afs_common::AfsConfig;
use afs_server::{ApiServer, ServerContext, run_maintenance};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "afs-server")]
#[command(about = "AFS Transactional Storage Server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/afs/afs.toml")]
    config: String,

    /// Storage root (overrides the config file)
    #[arg(long, env = "AFS_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Write-ahead log directory (overrides the config file)
    #[arg(long, env = "AFS_WAL_ROOT")]
    wal_root: Option<PathBuf>,

    /// Metadata service registration endpoint
    #[arg(long)]
    meta_endpoint: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Recover and exit without serving
    #[arg(long)]
    recover_only: bool,
}

fn load_config(args: &Args) -> Result<AfsConfig> {
    let mut config: AfsConfig = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        toml::from_str(&config_str).with_context(|| format!("parsing {}", args.config))?
    } else {
        AfsConfig::default()
    };

    // CLI takes precedence over the config file
    if let Some(root) = &args.storage_root {
        config.storage.root.clone_from(root);
    }
    if let Some(root) = &args.wal_root {
        config.wal.root.clone_from(root);
    }
    if let Some(endpoint) = &args.meta_endpoint {
        config.metadata.endpoint = Some(endpoint.clone());
    }
    if args.log_level != "info" {
        config.logging.level.clone_from(&args.log_level);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting AFS server");
    info!("Config file: {}", args.config);
    info!("Storage root: {}", config.storage.root.display());
    info!("WAL root: {}", config.wal.root.display());

    let (ctx, report) = match ServerContext::open(config) {
        Ok(opened) => opened,
        Err(e) => {
            error!("Failed to open storage: {e}");
            std::process::exit(1);
        }
    };

    info!(
        "Recovery: committed={}, reapplied={}, aborted={}, in_doubt={}, stalled={}",
        report.committed.len(),
        report.reapplied.len(),
        report.aborted.len(),
        report.in_doubt.len(),
        report.stalled.len()
    );
    for txn in &report.in_doubt {
        warn!("{txn} is prepared and awaits its coordinator");
    }
    for txn in &report.stalled {
        warn!("{txn} is committed but not yet applied; maintenance will retry");
    }

    if args.recover_only {
        info!("Recovery complete, exiting");
        return Ok(());
    }

    let api = ApiServer::new(ctx.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = tokio::spawn(run_maintenance(ctx, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down AFS server");

    let _ = shutdown_tx.send(true);
    if let Err(e) = maintenance.await {
        error!("Maintenance task failed: {e}");
    }
    info!(
        "Stopped with {} live sessions",
        api.session_count()
    );

    Ok(())
}
