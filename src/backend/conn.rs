use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::com::{Error, Result};
use crate::metrics;
use crate::protocol::resp::{self, copy_reply, read_reply_line};

/// Backend endpoint: a TCP address or a `unix:`-prefixed socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl ServerAddr {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix("unix:") {
            Some(path) => ServerAddr::Unix(PathBuf::from(path)),
            None => ServerAddr::Tcp(raw.to_string()),
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Tcp(addr) => write!(f, "{addr}"),
            ServerAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Per-call I/O deadlines for one upstream connection.
#[derive(Debug, Clone, Copy)]
pub struct IoTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

enum BackendStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            BackendStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            BackendStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            BackendStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            BackendStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

struct ConnIo {
    reader: BufReader<ReadHalf<BackendStream>>,
    writer: WriteHalf<BackendStream>,
    staged: BytesMut,
}

/// One upstream connection with a lazily dialed socket and a current
/// database cursor.
pub struct BackendConn {
    addr: ServerAddr,
    timeouts: IoTimeouts,
    database_id: usize,
    io: Option<ConnIo>,
}

impl BackendConn {
    pub fn new(addr: ServerAddr, timeouts: IoTimeouts) -> Self {
        Self {
            addr,
            timeouts,
            database_id: 0,
            io: None,
        }
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    pub fn database_id(&self) -> usize {
        self.database_id
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    /// Dial the endpoint if the socket is down. A fresh connect always
    /// starts on database 0.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.io.is_some() {
            return Ok(());
        }

        let stream = match &self.addr {
            ServerAddr::Tcp(addr) => {
                let stream = self.timed_connect(TcpStream::connect(addr)).await?;
                stream.set_nodelay(true).map_err(Error::Io)?;
                BackendStream::Tcp(stream)
            }
            ServerAddr::Unix(path) => {
                let stream = self.timed_connect(UnixStream::connect(path)).await?;
                BackendStream::Unix(stream)
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        self.io = Some(ConnIo {
            reader: BufReader::new(read_half),
            writer: write_half,
            staged: BytesMut::new(),
        });
        self.database_id = 0;
        debug!(backend = %self.addr, "connected to backend");
        Ok(())
    }

    /// Drop the socket and reset the database cursor. Reconnection is
    /// lazy, on the next `ensure_connected`.
    pub fn disconnect(&mut self) {
        if self.io.take().is_some() {
            metrics::disconnect_incr();
            debug!(backend = %self.addr, "disconnected backend connection");
        }
        self.database_id = 0;
    }

    /// Stage one RESP frame for the next flush.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let io = self.io.as_mut().ok_or(Error::BackendUnavailable)?;
        io.staged.extend_from_slice(frame);
        Ok(())
    }

    /// Write everything staged to the socket, applying the write deadline.
    pub async fn flush(&mut self) -> Result<()> {
        let write_deadline = self.timeouts.write;
        let io = self.io.as_mut().ok_or(Error::BackendUnavailable)?;
        if io.staged.is_empty() {
            return Ok(());
        }
        let staged = io.staged.split();
        let outcome = timeout(write_deadline, io.writer.write_all(&staged)).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.disconnect();
                Err(Error::Io(err))
            }
            Err(_) => {
                self.disconnect();
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream write timed out",
                )))
            }
        }
    }

    /// Issue `SELECT` on the wire and require `+OK`, updating the cursor.
    pub async fn select_database(&mut self, database_id: usize) -> Result<()> {
        let line = format!("select {database_id}\r\n");
        self.write_frame(line.as_bytes())?;
        self.flush().await?;

        let reply = self.read_line().await?;
        if reply != resp::OK_LINE {
            warn!(
                backend = %self.addr,
                reply = %String::from_utf8_lossy(&reply),
                "select rejected by backend"
            );
            self.disconnect();
            return Err(Error::BackendUnavailable);
        }
        self.database_id = database_id;
        Ok(())
    }

    /// Health check: send `PING`, require `+PONG`.
    pub async fn ping(&mut self) -> bool {
        if self.write_frame(resp::PING_INLINE).is_err() {
            return false;
        }
        if self.flush().await.is_err() {
            return false;
        }
        let reply = self.read_line().await;
        match reply {
            Ok(line) if line == resp::PONG_LINE => true,
            _ => {
                self.disconnect();
                false
            }
        }
    }

    /// Copy exactly one reply frame to `dst`, applying the read deadline
    /// per I/O. The caller owns the disconnect decision on failure.
    pub async fn copy_reply_to<W>(&mut self, dst: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let read_deadline = self.timeouts.read;
        let io = self.io.as_mut().ok_or(Error::BackendUnavailable)?;
        copy_reply(&mut io.reader, dst, read_deadline).await
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let read_deadline = self.timeouts.read;
        let io = self.io.as_mut().ok_or(Error::BackendUnavailable)?;
        let outcome = read_reply_line(&mut io.reader, read_deadline).await;
        match outcome {
            Ok(line) => Ok(line),
            Err(err) => {
                self.disconnect();
                Err(err)
            }
        }
    }

    async fn timed_connect<S, F>(&self, fut: F) -> Result<S>
    where
        F: std::future::Future<Output = io::Result<S>>,
    {
        match timeout(self.timeouts.connect, fut).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => {
                warn!(backend = %self.addr, error = %err, "backend dial failed");
                Err(Error::Io(err))
            }
            Err(_) => {
                warn!(backend = %self.addr, "backend dial timed out");
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "backend connect timed out",
                )))
            }
        }
    }
}

impl fmt::Debug for BackendConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConn")
            .field("addr", &self.addr)
            .field("database_id", &self.database_id)
            .field("connected", &self.io.is_some())
            .finish()
    }
}
