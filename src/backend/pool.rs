use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::com::{Error, Result};
use crate::metrics;

use super::conn::{BackendConn, IoTimeouts, ServerAddr};

/// Bounded set of upstream connections for one backend endpoint.
///
/// Idle connections sit in a mailbox; a leased connection is owned by
/// exactly one caller until it is checked back in. Connection objects are
/// created lazily up to `capacity` and survive disconnects — the socket
/// itself is re-dialed on the next checkout.
pub struct ConnectionPool {
    addr: ServerAddr,
    capacity: usize,
    checkout_timeout: Duration,
    timeouts: IoTimeouts,
    idle_tx: mpsc::Sender<BackendConn>,
    idle_rx: Mutex<mpsc::Receiver<BackendConn>>,
    live: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(
        addr: ServerAddr,
        capacity: usize,
        checkout_timeout: Duration,
        timeouts: IoTimeouts,
    ) -> Self {
        let capacity = capacity.max(1);
        let (idle_tx, idle_rx) = mpsc::channel(capacity);
        Self {
            addr,
            capacity,
            checkout_timeout,
            timeouts,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            live: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// Connections currently sitting idle in the mailbox.
    pub fn idle_len(&self) -> usize {
        self.capacity - self.idle_tx.capacity()
    }

    /// Connection objects currently alive, idle or leased.
    pub fn live_len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Lease a connected upstream connection.
    ///
    /// Prefers an idle connection, creates one lazily while under
    /// capacity, and otherwise waits up to the checkout timeout for a
    /// checkin. A connection that cannot be (re)dialed is discarded and
    /// the checkout fails with `BackendUnavailable`.
    pub async fn checkout(&self) -> Result<BackendConn> {
        let mut conn = match self.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                metrics::pool_checkout(false);
                return Err(err);
            }
        };

        if let Err(err) = conn.ensure_connected().await {
            warn!(backend = %self.addr, error = %err, "dropping unconnectable pool slot");
            self.live.fetch_sub(1, Ordering::SeqCst);
            metrics::pool_checkout(false);
            return Err(Error::BackendUnavailable);
        }
        metrics::pool_checkout(true);
        Ok(conn)
    }

    /// Return a leased connection to the idle mailbox. Disconnected
    /// connections are accepted; they re-dial on their next checkout.
    pub fn checkin(&self, conn: BackendConn) {
        if self.idle_tx.try_send(conn).is_err() {
            // Can only happen if a caller checked in a connection this
            // pool never leased; drop it rather than poison accounting.
            warn!(backend = %self.addr, "discarding checkin beyond pool capacity");
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Checkout, ping, checkin. Used as a startup reachability probe.
    pub async fn verify(&self) -> bool {
        match self.checkout().await {
            Ok(mut conn) => {
                let healthy = conn.ping().await;
                self.checkin(conn);
                healthy
            }
            Err(_) => false,
        }
    }

    async fn acquire(&self) -> Result<BackendConn> {
        let mut idle = self.idle_rx.lock().await;
        if let Ok(conn) = idle.try_recv() {
            return Ok(conn);
        }

        let created = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        if created {
            debug!(backend = %self.addr, "creating pool connection");
            return Ok(BackendConn::new(self.addr.clone(), self.timeouts));
        }

        match timeout(self.checkout_timeout, idle.recv()).await {
            Ok(Some(conn)) => Ok(conn),
            Ok(None) => Err(Error::BackendUnavailable),
            Err(_) => {
                warn!(backend = %self.addr, "pool checkout timed out");
                Err(Error::BackendUnavailable)
            }
        }
    }
}
