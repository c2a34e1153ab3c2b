mod supervisor;

use anyhow::Result;
use clap::Parser;
use compressd_core::config::load_config;
use compressd_core::startup::run_startup_checks;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "compressd-worker")]
#[command(about = "Video compression job worker", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stable identifier for this worker, used as the Redis consumer name
    #[arg(long, default_value = "worker-1")]
    worker_id: String,
}

/// Waits for either SIGINT or SIGTERM. Unix-only signal handling; Ctrl-C
/// alone isn't enough since orchestrators (systemd, Docker, Kubernetes) send
/// SIGTERM on a normal stop.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_ansi(true)
        .init();

    info!("compressd-worker v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    info!("Loading configuration...");
    let config = match load_config(args.config.as_deref()) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!("Redis: {}:{}", config.redis_host, config.redis_port);
    info!("Media content dir: {:?}", config.media_content_dir);
    info!("Parallel limit: {}", config.parallel_limit);

    info!("Running startup validation...");
    if let Err(e) = run_startup_checks(
        &config.redis_url(),
        &config.media_uploads_dir,
        &config.media_content_dir,
    )
    .await
    {
        error!("Startup validation failed: {}", e);
        std::process::exit(1);
    }
    info!("Startup validation complete");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining in-flight jobs");
        let _ = shutdown_tx.send(true);
    });

    info!("Starting worker supervisor loop...");
    if let Err(e) = supervisor::run_supervised(args.worker_id, config, shutdown_rx).await {
        error!("Worker supervisor exited with error: {}", e);
        return Err(e);
    }

    Ok(())
}
