//! Archive storage manager service
//!
//! Selects write volumes for a storage group and deletes the least recently
//! accessed studies when retention windows expire or free space runs low.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use common::config::Configuration;
use storage_manager::StorageManagerBuilder;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pacs-archive.toml")]
    config: String,

    /// Run one deletion pass and one orphan sweep, then exit
    #[arg(long)]
    once: bool,

    /// Print the active deletion criteria and exit
    #[arg(long)]
    show_criteria: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config_path = Path::new(&args.config);
    if !config_path.exists() {
        tracing::info!(path = %args.config, "Configuration file not found, using defaults");
    }
    let config =
        Configuration::load_from_path(config_path).context("Failed to load configuration")?;

    let manager = StorageManagerBuilder::new(config)
        .build()
        .await
        .context("Failed to initialize storage manager")?;

    if args.show_criteria {
        println!("{}", manager.show_criteria());
        return Ok(());
    }

    if args.once {
        let report = manager.run_once().await?;
        tracing::info!(
            pass = ?report.pass,
            orders_processed = report.orders_processed,
            sweep = ?report.sweep,
            "Single cycle finished"
        );
        return Ok(());
    }

    manager.start().await;

    tracing::info!("Storage manager running, waiting for shutdown signal");
    wait_for_shutdown_signal().await?;

    tracing::info!("Received shutdown signal, stopping storage manager");
    manager.stop().await;

    Ok(())
}
