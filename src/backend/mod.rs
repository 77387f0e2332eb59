pub mod conn;
pub mod pool;

pub use conn::{BackendConn, IoTimeouts, ServerAddr};
pub use pool::ConnectionPool;
