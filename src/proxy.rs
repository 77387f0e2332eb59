use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::backend::{ConnectionPool, IoTimeouts, ServerAddr};
use crate::config::Config;
use crate::router::Router;
use crate::session::{self, SessionConfig};

/// The assembled proxy: one pool per backend, a router over them, and the
/// per-session configuration handed to every accepted client.
pub struct Proxy {
    router: Arc<Router>,
    session_config: SessionConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    sessions: TaskTracker,
}

impl Proxy {
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_valid()?;

        let timeouts = IoTimeouts {
            connect: config.connect_timeout(),
            read: config.read_timeout(),
            write: config.write_timeout(),
        };
        let pools = config
            .servers
            .iter()
            .map(|server| {
                Arc::new(ConnectionPool::new(
                    ServerAddr::parse(server),
                    config.pool_size,
                    config.checkout_timeout(),
                    timeouts,
                ))
            })
            .collect::<Vec<_>>();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            router: Arc::new(Router::new(pools)),
            session_config: SessionConfig {
                multiplexing: config.multiplexing,
                batch_cap: config.effective_batch_cap(),
                transaction_timeout: config.transaction_timeout(),
            },
            shutdown_tx,
            shutdown_rx,
            sessions: TaskTracker::new(),
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Probe every backend once and log the result. Failures are not
    /// fatal: pools reconnect lazily.
    pub async fn probe_backends(&self) {
        for pool in self.router.pools() {
            if pool.verify().await {
                info!(backend = %pool.addr(), "backend reachable");
            } else {
                warn!(backend = %pool.addr(), "backend unreachable at startup");
            }
        }
    }

    /// Serve one already-accepted client connection.
    pub async fn handle_connection(&self, socket: TcpStream) {
        session::run(
            socket,
            self.router.clone(),
            self.session_config.clone(),
            self.shutdown_rx.clone(),
        )
        .await;
    }

    /// Accept loop. Returns once a shutdown signal arrives and every
    /// session has drained.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .context("listener has no local address")?;
        info!(%addr, "proxy listening");

        let mut signal = std::pin::pin!(tokio::signal::ctrl_c());
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("shutdown signal received");
                    break;
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "accepted client connection");
                    let router = self.router.clone();
                    let session_config = self.session_config.clone();
                    let shutdown = self.shutdown_rx.clone();
                    self.sessions.spawn(async move {
                        session::run(socket, router, session_config, shutdown).await;
                    });
                }
            }
        }

        // Sessions drain their current batch and close.
        let _ = self.shutdown_tx.send(true);
        self.sessions.close();
        self.sessions.wait().await;
        info!("all sessions drained");
        Ok(())
    }
}
