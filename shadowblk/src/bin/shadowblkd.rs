//! shadowblkd - NBD export daemon with write-queue shadowing.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shadowblk::{Config, Daemon, QueueConfig, QueueWorker};

/// Delay between a shutdown signal and process exit, so in-flight responses
/// can flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "shadowblkd",
    about = "NBD export daemon that shadows writes into an external queue"
)]
struct Cli {
    /// Path to config file. CLI flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Export name clients must request.
    #[arg(long)]
    export_name: Option<String>,

    /// Backing file or block device to export.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Declared export size in bytes (0 = derive from the backing file).
    #[arg(long)]
    size_bytes: Option<u64>,

    /// Bind address for the NBD listener.
    #[arg(long)]
    bind: Option<String>,

    /// Serve the legacy fixed-size handshake instead of fixed newstyle.
    #[arg(long)]
    oldstyle: bool,

    /// Write-queue server address. Omit to run file-only.
    #[arg(long)]
    queue: Option<String>,

    /// Write-queue database index.
    #[arg(long, default_value_t = 0)]
    queue_db: u32,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(name) = cli.export_name {
        config.export.name = name;
    }
    if let Some(file) = cli.file {
        config.export.path = file;
    }
    if let Some(size_bytes) = cli.size_bytes {
        config.export.size_bytes = size_bytes;
    }
    if let Some(bind) = cli.bind {
        config.nbd.address = bind;
    }
    if cli.oldstyle {
        config.nbd.oldstyle = true;
    }
    if let Some(address) = cli.queue {
        config.queue = Some(QueueConfig {
            address,
            db: cli.queue_db,
        });
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (daemon, worker) = Daemon::from_config(&config).context("failed to start")?;

    let listener = TcpListener::bind(&config.nbd.address)
        .await
        .with_context(|| format!("failed to bind: {}", config.nbd.address))?;

    info!(
        address = %config.nbd.address,
        export = %config.export.name,
        backing = %config.export.path.display(),
        size_bytes = daemon.export().size(),
        queue = config.queue.as_ref().map(|q| q.address.as_str()).unwrap_or("disabled"),
        "shadowblkd started"
    );

    let queue_task = tokio::spawn(run_worker(worker));

    tokio::select! {
        res = daemon.listen(listener) => {
            res.context("NBD server error")?;
        }
        res = queue_task => {
            if let Err(err) = res.context("queue worker panicked")? {
                error!(error = %err, "fatal write queue failure");
                return Err(err.into());
            }
        }
        _ = shutdown_signal() => {
            info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "caught interrupt, exiting shortly");
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    }

    Ok(())
}

/// The queue worker runs for the process lifetime; with no queue configured
/// this pends forever so the select below never fires on it.
async fn run_worker(worker: Option<QueueWorker>) -> Result<(), shadowblk::QueueError> {
    match worker {
        Some(worker) => worker.run().await,
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received SIGINT");
    }
}
