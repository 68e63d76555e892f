use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use corral_core::{QueueEngine, Store};
use corral_daemon::{housekeeping, server, socket};

/// Durable job-queue daemon for cattle fleets.
#[derive(Debug, Parser)]
#[command(name = "corral-daemon", version, about)]
struct Args {
    /// Path of the Unix socket to listen on.
    #[arg(long, default_value_os_t = socket::default_socket_path())]
    socket: PathBuf,

    /// Path of the SQLite database file.
    #[arg(long, default_value = "corral.db")]
    db: PathBuf,

    /// Log filter (e.g. `info`, `corral_daemon=debug`).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between housekeeping sweeps.
    #[arg(long, default_value_t = 3600)]
    prune_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Store::open(&args.db)
        .with_context(|| format!("failed to open store at {}", args.db.display()))?;
    let queue = Arc::new(QueueEngine::new(store));

    let (listener, guard) = socket::bind(&args.socket)
        .with_context(|| format!("failed to bind socket at {}", args.socket.display()))?;

    let housekeeper = tokio::spawn(housekeeping::run(
        Arc::clone(&queue),
        Duration::from_secs(args.prune_interval_secs.max(1)),
    ));

    let app = server::router(queue);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    housekeeper.abort();
    drop(guard);
    info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            return std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutdown signal received");
}
