//! Daemon bootstrap (§5/§6): single-instance lock, socket setup, accept
//! loop, and signal-driven graceful shutdown.

mod handler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::adapter::RealConnector;
use crate::config::Config;
use crate::lock::{self, InstanceLock, LockError};
use crate::pool::Pool;

pub use handler::handle_connection;

/// Runs the daemon until a termination signal drains it. Returns `Ok(())`
/// both on a clean shutdown and when another instance already holds the
/// lock — that case is a silent exit, not a failure.
#[instrument(skip_all)]
pub async fn run(config_dir: PathBuf) -> anyhow::Result<()> {
    if !config_dir.is_dir() {
        anyhow::bail!("config directory {} does not exist", config_dir.display());
    }

    let config_path = config_dir.join("config.toml");
    let config = if config_path.is_file() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    let _lock = match InstanceLock::acquire(&config_dir) {
        Ok(lock) => lock,
        Err(LockError::AlreadyRunning) => {
            info!("another daemon already holds the lock, exiting");
            return Ok(());
        }
        Err(err) => return Err(err).context("acquiring instance lock"),
    };

    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let socket_path = config_dir.join("sock");
    lock::remove_stale_socket(&socket_path).context("removing stale socket")?;
    let listener = UnixListener::bind(&socket_path).context("binding to socket")?;

    let pool = Pool::new(
        Arc::new(RealConnector::new(Duration::from_secs(config.connect_timeout_secs))),
        Duration::from_secs(config.reusable_ttl_secs),
        Duration::from_secs(config.share_ttl_secs),
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(watch_signals(shutdown_tx));

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let pool = pool.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        connections.spawn(async move {
                            handler::handle_connection(stream, pool, shutdown_rx).await;
                        });
                    }
                    Err(err) => warn!("accept failed: {err}"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    break;
                }
            }
            Some(result) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = result {
                    warn!("connection task panicked: {err}");
                }
            }
        }
    }

    info!("shutdown signal received, draining {} connection(s)", connections.len());
    while let Some(result) = connections.join_next().await {
        if let Err(err) = result {
            warn!("connection task panicked during drain: {err}");
        }
    }

    pool.clear().await;
    let _ = std::fs::remove_file(&socket_path);
    info!("daemon exiting cleanly");
    Ok(())
}

/// Listens for `SIGHUP`/`SIGINT`/`SIGTERM` and flips the shutdown watch once.
/// A second signal while draining is not handled specially — this is one
/// graceful pass, not a forced-exit escalation.
async fn watch_signals(shutdown_tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = signal(SignalKind::hangup()).expect("installing SIGHUP handler");
        let mut interrupt = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
        let mut terminate = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = hangup.recv() => info!("received SIGHUP"),
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    }
}
