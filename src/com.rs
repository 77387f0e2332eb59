use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised along the client request pipeline.
///
/// Every kind knows its client-visible RESP line and whether the session
/// can keep running after it has been reported.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol error")]
    Protocol,

    #[error("unsupported command")]
    Unsupported,

    #[error("bad arguments")]
    BadArguments,

    #[error("connection down")]
    BackendUnavailable,

    #[error("transaction timeout")]
    TransactionTimeout,

    #[error("client gone")]
    ClientGone,

    #[error("client asked to quit")]
    Quit,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The RESP line written back to the client, if any.
    pub fn reply_line(&self) -> Option<&'static [u8]> {
        match self {
            Error::Protocol => Some(b"-ERR protocol error\r\n"),
            Error::Unsupported => Some(b"-ERR unsupported command\r\n"),
            Error::BadArguments => Some(b"-ERR bad arguments\r\n"),
            Error::BackendUnavailable => Some(b"-ERR connection down\r\n"),
            Error::TransactionTimeout => Some(b"-ERR transaction timeout\r\n"),
            Error::Quit => Some(b"+OK\r\n"),
            // Upstream I/O failures drop the batch; the client sees the
            // same vocabulary as a failed checkout.
            Error::Io(_) => Some(b"-ERR connection down\r\n"),
            Error::ClientGone => None,
        }
    }

    /// Whether the session must terminate after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Unsupported | Error::BadArguments | Error::BackendUnavailable => false,
            Error::Protocol
            | Error::TransactionTimeout
            | Error::ClientGone
            | Error::Quit
            | Error::Io(_) => true,
        }
    }
}
