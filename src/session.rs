use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::backend::{BackendConn, ConnectionPool};
use crate::com::{Error, Result};
use crate::metrics;
use crate::protocol::{classify, resp, CommandCodec, CommandFrame, Disposition};
use crate::router::Router;

/// Capacity of the reader-to-worker channel.
const READ_CHANNEL_CAPACITY: usize = 10_000;

/// One parsed command or the terminal error that ends the read loop.
type ReadItem = Result<CommandFrame>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub multiplexing: bool,
    pub batch_cap: usize,
    pub transaction_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionMode {
    None,
    Pre,
    Multi,
}

/// Serve one client connection to completion.
///
/// Spawns the reader task, runs the worker loop on the caller's task, and
/// tears the session down when either side goes away.
pub async fn run(
    socket: TcpStream,
    router: Arc<Router>,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(err) = socket.set_nodelay(true) {
        debug!(error = %err, "failed to set TCP_NODELAY on client socket");
    }
    let _guard = metrics::FrontConnectionGuard::new();

    let (read_half, write_half) = socket.into_split();
    let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_loop(read_half, tx, shutdown));

    let mut session = Session::new(write_half, router, config);
    session.serve(rx).await;
    session.teardown().await;
    reader.abort();
}

/// Reader task: scan client bytes into command frames and hand them to
/// the worker. Exits on EOF, parse failure, or shutdown, always leaving a
/// terminal item on the channel.
async fn read_loop(
    read_half: OwnedReadHalf,
    tx: mpsc::Sender<ReadItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut frames = FramedRead::new(read_half, CommandCodec);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = tx.send(Err(Error::ClientGone)).await;
                break;
            }
            item = frames.next() => match item {
                Some(Ok(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    // Client-side socket failures close silently; only
                    // real framing violations earn a protocol error.
                    let err = match err {
                        Error::Io(_) => Error::ClientGone,
                        other => other,
                    };
                    let _ = tx.send(Err(err)).await;
                    break;
                }
                None => {
                    let _ = tx.send(Err(Error::ClientGone)).await;
                    break;
                }
            }
        }
    }
}

struct TransactionPin {
    lease: Arc<PinnedLease>,
    pool: Arc<ConnectionPool>,
    done: oneshot::Sender<()>,
}

struct Session {
    writer: BufWriter<OwnedWriteHalf>,
    router: Arc<Router>,
    multiplexing: bool,
    batch_cap: usize,
    transaction_timeout: Duration,
    database_id: usize,
    active: bool,
    queued: Vec<CommandFrame>,
    transaction_mode: TransactionMode,
    pin: Option<TransactionPin>,
}

impl Session {
    fn new(write_half: OwnedWriteHalf, router: Arc<Router>, config: SessionConfig) -> Self {
        Self {
            writer: BufWriter::new(write_half),
            router,
            multiplexing: config.multiplexing,
            batch_cap: config.batch_cap.max(1),
            transaction_timeout: config.transaction_timeout,
            database_id: 0,
            active: true,
            queued: Vec::with_capacity(4),
            transaction_mode: TransactionMode::None,
            pin: None,
        }
    }

    /// Worker loop: drain the read channel, intercept or queue commands,
    /// and flush batches at the cap or when the client pauses.
    async fn serve(&mut self, mut rx: mpsc::Receiver<ReadItem>) {
        let mut pending: Option<ReadItem> = None;

        while self.active {
            let item = match pending.take() {
                Some(item) => item,
                None => match rx.recv().await {
                    Some(item) => item,
                    None => break,
                },
            };

            match item {
                Ok(frame) => {
                    if let Err(err) = self.handle_command(frame).await {
                        if self.report(err).await.is_err() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    // Terminal reader item: drain what is queued, then
                    // surface the error and stop.
                    if !self.queued.is_empty() {
                        let _ = self.flush_and_respond().await;
                    }
                    let _ = self.report(err).await;
                    break;
                }
            }

            if !self.active {
                break;
            }

            if self.queued.len() >= self.batch_cap {
                if let Err(err) = self.flush_and_respond().await {
                    if self.report(err).await.is_err() {
                        break;
                    }
                }
                continue;
            }

            match rx.try_recv() {
                Ok(item) => pending = Some(item),
                Err(TryRecvError::Empty) => {
                    if let Err(err) = self.flush_and_respond().await {
                        if self.report(err).await.is_err() {
                            break;
                        }
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    let _ = self.flush_and_respond().await;
                    break;
                }
            }
        }
    }

    async fn handle_command(&mut self, frame: CommandFrame) -> Result<()> {
        match classify(&frame, self.multiplexing) {
            Disposition::Unsupported => {
                self.flush_queued_if_any().await?;
                Err(Error::Unsupported)
            }
            Disposition::Pong => {
                self.flush_queued_if_any().await?;
                self.write_reply(resp::PONG_REPLY).await
            }
            Disposition::Quit => {
                self.flush_queued_if_any().await?;
                Err(Error::Quit)
            }
            Disposition::Select => {
                self.flush_queued_if_any().await?;
                match frame.first_arg().and_then(resp::parse_int) {
                    Some(database_id) => {
                        self.database_id = database_id;
                        self.write_reply(resp::OK_REPLY).await
                    }
                    None => Err(Error::BadArguments),
                }
            }
            Disposition::Transaction | Disposition::Forward => {
                self.queued.push(frame);
                Ok(())
            }
        }
    }

    /// Write the client-visible line for an error and decide whether the
    /// session survives it. Errors out only when the client is gone.
    async fn report(&mut self, err: Error) -> Result<()> {
        match &err {
            Error::Quit | Error::ClientGone => {}
            other => {
                metrics::global_error_incr();
                debug!(error = %other, "reporting error to client");
            }
        }
        if err.is_fatal() {
            self.active = false;
        }
        if let Some(line) = err.reply_line() {
            self.writer
                .write_all(line)
                .await
                .map_err(|_| Error::ClientGone)?;
            self.writer.flush().await.map_err(|_| Error::ClientGone)?;
        }
        Ok(())
    }

    async fn write_reply(&mut self, line: &[u8]) -> Result<()> {
        self.writer
            .write_all(line)
            .await
            .map_err(|_| Error::ClientGone)
    }

    async fn flush_queued_if_any(&mut self) -> Result<()> {
        if self.queued.is_empty() {
            Ok(())
        } else {
            self.flush_queued().await
        }
    }

    /// Flush boundary: forward the queued batch, then push any buffered
    /// replies out to the client.
    async fn flush_and_respond(&mut self) -> Result<()> {
        if !self.queued.is_empty() {
            self.flush_queued().await?;
        }
        self.writer.flush().await.map_err(|_| Error::ClientGone)
    }

    /// The flush routine: route, lease a connection, align the database
    /// cursor, forward the batch, stream the replies back, and release
    /// the connection according to transaction state.
    async fn flush_queued(&mut self) -> Result<()> {
        let routed = if self.multiplexing {
            debug_assert_eq!(self.queued.len(), 1);
            self.router.route(&self.queued[0]).cloned()
        } else {
            Ok(self.router.default_pool().clone())
        };
        let pool = match routed {
            Ok(pool) => pool,
            Err(err) => {
                self.queued.clear();
                return Err(err);
            }
        };

        let leased = match &self.pin {
            Some(pin) => pin.lease.take(),
            None => pool.checkout().await,
        };
        let mut conn = match leased {
            Ok(conn) => conn,
            Err(err) => {
                // The batch is dropped whether the failure is a missing
                // backend or a reclaimed transaction lease.
                self.queued.clear();
                return Err(err);
            }
        };

        let outcome = self.run_batch(&mut conn).await;
        self.release(conn, pool, outcome)
    }

    async fn run_batch(&mut self, conn: &mut BackendConn) -> Result<()> {
        if conn.database_id() != self.database_id {
            conn.select_database(self.database_id).await?;
        }

        let batch = mem::take(&mut self.queued);
        let count = batch.len();
        let start = Instant::now();
        for frame in &batch {
            self.advance_transaction(frame.name());
            conn.write_frame(frame.buffer())?;
        }
        conn.flush().await?;
        metrics::redis_write_timing(start.elapsed());

        for _ in 0..count {
            conn.copy_reply_to(&mut self.writer).await?;
        }
        self.writer.flush().await.map_err(|_| Error::ClientGone)
    }

    /// Release policy, step 7 of the flush routine.
    fn release(
        &mut self,
        mut conn: BackendConn,
        pool: Arc<ConnectionPool>,
        outcome: Result<()>,
    ) -> Result<()> {
        match outcome {
            Err(err) => {
                conn.disconnect();
                if let Some(pin) = self.pin.take() {
                    pin.lease.close();
                    let _ = pin.done.send(());
                    pin.pool.checkin(conn);
                } else {
                    pool.checkin(conn);
                }
                Err(err)
            }
            Ok(()) => {
                if self.transaction_mode == TransactionMode::None {
                    if let Some(pin) = self.pin.take() {
                        // Transaction ended on this batch.
                        let _ = pin.done.send(());
                        pin.lease.close();
                        pin.pool.checkin(conn);
                    } else {
                        pool.checkin(conn);
                    }
                } else if self.pin.is_none() {
                    self.install_pin(conn, pool);
                } else {
                    let pin = self.pin.as_ref().expect("pin checked above");
                    match pin.lease.release(conn) {
                        ReleaseOutcome::Kept => {}
                        ReleaseOutcome::TimedOut(mut conn) => {
                            // The watcher fired mid-batch; reclaim now.
                            conn.disconnect();
                            pin.pool.checkin(conn);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Pin the connection for the transaction and arm the timeout
    /// watcher.
    fn install_pin(&mut self, conn: BackendConn, pool: Arc<ConnectionPool>) {
        let lease = Arc::new(PinnedLease::with_conn(conn));
        let (done_tx, done_rx) = oneshot::channel();

        let watcher_lease = lease.clone();
        let watcher_pool = pool.clone();
        let deadline = self.transaction_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = done_rx => {}
                _ = sleep(deadline) => {
                    if let Some(mut conn) = watcher_lease.reclaim_if_idle() {
                        warn!("transaction timed out; reclaiming pinned connection");
                        conn.disconnect();
                        watcher_pool.checkin(conn);
                    }
                    // A batch in flight defers the reclaim to its release.
                }
            }
        });

        self.pin = Some(TransactionPin {
            lease,
            pool,
            done: done_tx,
        });
    }

    fn advance_transaction(&mut self, name: &[u8]) {
        self.transaction_mode = advance_transaction(self.transaction_mode, name);
    }

    async fn teardown(&mut self) {
        if let Some(pin) = self.pin.take() {
            if let Some(mut conn) = pin.lease.close() {
                conn.disconnect();
                pin.pool.checkin(conn);
            }
            let _ = pin.done.send(());
        }
        let _ = self.writer.shutdown().await;
    }
}

/// Transaction state machine, advanced as each queued command is written.
fn advance_transaction(mode: TransactionMode, name: &[u8]) -> TransactionMode {
    match mode {
        TransactionMode::None => match name {
            b"watch" => TransactionMode::Pre,
            b"multi" => TransactionMode::Multi,
            _ => TransactionMode::None,
        },
        TransactionMode::Pre => match name {
            b"unwatch" => TransactionMode::None,
            b"multi" => TransactionMode::Multi,
            _ => TransactionMode::Pre,
        },
        TransactionMode::Multi => match name {
            b"exec" | b"discard" => TransactionMode::None,
            _ => TransactionMode::Multi,
        },
    }
}

/// One-slot handoff carrying the pinned connection between batches.
///
/// The worker moves `Idle -> InFlight -> Idle` around each batch; the
/// timeout watcher moves `Idle -> Reclaimed`, or marks `InFlight ->
/// TimedOut` so the worker reclaims at release. `Reclaimed` is terminal
/// and surfaces as `TransactionTimeout` on the next take.
struct PinnedLease {
    state: Mutex<LeaseState>,
}

enum LeaseState {
    Idle(BackendConn),
    InFlight,
    TimedOut,
    Reclaimed,
}

enum ReleaseOutcome {
    Kept,
    TimedOut(BackendConn),
}

impl PinnedLease {
    fn with_conn(conn: BackendConn) -> Self {
        Self {
            state: Mutex::new(LeaseState::Idle(conn)),
        }
    }

    /// Worker side: claim the connection for a batch.
    fn take(&self) -> Result<BackendConn> {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, LeaseState::InFlight) {
            LeaseState::Idle(conn) => Ok(conn),
            _ => {
                *state = LeaseState::Reclaimed;
                Err(Error::TransactionTimeout)
            }
        }
    }

    /// Worker side: hand the connection back for the next batch.
    fn release(&self, conn: BackendConn) -> ReleaseOutcome {
        let mut state = self.state.lock();
        match &*state {
            LeaseState::InFlight => {
                *state = LeaseState::Idle(conn);
                ReleaseOutcome::Kept
            }
            _ => {
                *state = LeaseState::Reclaimed;
                ReleaseOutcome::TimedOut(conn)
            }
        }
    }

    /// Watcher side: reclaim an idle connection, or mark an in-flight
    /// lease so the worker reclaims it on release.
    fn reclaim_if_idle(&self) -> Option<BackendConn> {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, LeaseState::Reclaimed) {
            LeaseState::Idle(conn) => Some(conn),
            LeaseState::InFlight => {
                *state = LeaseState::TimedOut;
                None
            }
            other => {
                *state = other;
                None
            }
        }
    }

    /// Close the mailbox, returning any idle connection still inside.
    fn close(&self) -> Option<BackendConn> {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, LeaseState::Reclaimed) {
            LeaseState::Idle(conn) => Some(conn),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::{IoTimeouts, ServerAddr};

    fn test_conn() -> BackendConn {
        BackendConn::new(
            ServerAddr::Tcp("127.0.0.1:0".into()),
            IoTimeouts {
                connect: Duration::from_millis(100),
                read: Duration::from_millis(100),
                write: Duration::from_millis(100),
            },
        )
    }

    #[test]
    fn transaction_state_machine_follows_table() {
        let mut mode = TransactionMode::None;
        let mut advance = |name: &[u8]| {
            mode = advance_transaction(mode, name);
            mode
        };

        assert_eq!(advance(b"get"), TransactionMode::None);
        assert_eq!(advance(b"watch"), TransactionMode::Pre);
        assert_eq!(advance(b"get"), TransactionMode::Pre);
        assert_eq!(advance(b"unwatch"), TransactionMode::None);

        assert_eq!(advance(b"watch"), TransactionMode::Pre);
        assert_eq!(advance(b"multi"), TransactionMode::Multi);
        assert_eq!(advance(b"watch"), TransactionMode::Multi);
        assert_eq!(advance(b"exec"), TransactionMode::None);

        assert_eq!(advance(b"multi"), TransactionMode::Multi);
        assert_eq!(advance(b"discard"), TransactionMode::None);
    }

    #[test]
    fn lease_hands_off_between_batches() {
        let lease = PinnedLease::with_conn(test_conn());
        let conn = lease.take().unwrap();
        assert!(matches!(lease.release(conn), ReleaseOutcome::Kept));
        let conn = lease.take().unwrap();
        assert!(matches!(lease.release(conn), ReleaseOutcome::Kept));
    }

    #[test]
    fn reclaimed_lease_times_out_the_next_take() {
        let lease = PinnedLease::with_conn(test_conn());
        let reclaimed = lease.reclaim_if_idle();
        assert!(reclaimed.is_some());
        assert!(matches!(lease.take(), Err(Error::TransactionTimeout)));
        // And it stays dead.
        assert!(matches!(lease.take(), Err(Error::TransactionTimeout)));
    }

    #[test]
    fn in_flight_reclaim_defers_to_release() {
        let lease = PinnedLease::with_conn(test_conn());
        let conn = lease.take().unwrap();

        // Timer fires while the batch is in flight.
        assert!(lease.reclaim_if_idle().is_none());

        // The worker observes the deferral at release time.
        let outcome = lease.release(conn);
        assert!(matches!(outcome, ReleaseOutcome::TimedOut(_)));
        assert!(matches!(lease.take(), Err(Error::TransactionTimeout)));
    }

    #[test]
    fn close_returns_only_idle_connections() {
        let lease = PinnedLease::with_conn(test_conn());
        assert!(lease.close().is_some());

        let lease = PinnedLease::with_conn(test_conn());
        let _conn = lease.take().unwrap();
        assert!(lease.close().is_none());

        // Racing close and reclaim never yields the connection twice.
        let lease = PinnedLease::with_conn(test_conn());
        assert!(lease.reclaim_if_idle().is_some());
        assert!(lease.close().is_none());
    }
}
