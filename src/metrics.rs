use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};

static DISCONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "redmux_disconnect_total",
        "count of upstream connection disconnects"
    ))
    .expect("disconnect counter registration must succeed")
});

static REDIS_WRITE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(histogram_opts!(
        "redmux_redis_write_duration",
        "upstream batch write and flush duration in microseconds",
        vec![100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0]
    ))
    .expect("redis write histogram registration must succeed")
});

static FRONT_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "redmux_front_connection",
        "currently open client connections"
    ))
    .expect("front connections gauge registration must succeed")
});

static FRONT_CONNECTION_INCR: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "redmux_front_connection_incr",
        "count of client connections since start"
    ))
    .expect("front connections counter registration must succeed")
});

static GLOBAL_ERROR: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "redmux_global_error",
        "count of command and protocol failures"
    ))
    .expect("global error counter registration must succeed")
});

static POOL_CHECKOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "redmux_pool_checkout_total",
            "pool checkout outcomes grouped by result"
        ),
        &["result"]
    )
    .expect("pool checkout counter registration must succeed")
});

/// Record an upstream disconnect.
pub fn disconnect_incr() {
    DISCONNECTS.inc();
}

/// Record the duration of one upstream batch write and flush.
pub fn redis_write_timing(elapsed: Duration) {
    REDIS_WRITE_DURATION.observe(elapsed.as_secs_f64() * 1_000_000.0);
}

/// Record a new client connection.
pub fn front_conn_open() {
    FRONT_CONNECTION_INCR.inc();
    FRONT_CONNECTIONS.inc();
}

/// Record a client connection closure.
pub fn front_conn_close() {
    FRONT_CONNECTIONS.dec();
}

/// Increment the global error counter.
pub fn global_error_incr() {
    GLOBAL_ERROR.inc();
}

/// Record a pool checkout outcome.
pub fn pool_checkout(ok: bool) {
    let result = if ok { "ok" } else { "fail" };
    POOL_CHECKOUTS.with_label_values(&[result]).inc();
}

/// Total upstream disconnects since start.
pub fn disconnect_count() -> u64 {
    DISCONNECTS.get()
}

/// Currently open client connections.
pub fn front_connections_current() -> i64 {
    FRONT_CONNECTIONS.get()
}

/// Guard that keeps the client connection gauge balanced.
pub struct FrontConnectionGuard;

impl FrontConnectionGuard {
    pub fn new() -> Self {
        front_conn_open();
        Self
    }
}

impl Default for FrontConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrontConnectionGuard {
    fn drop(&mut self) {
        front_conn_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn front_connection_guard_balances_gauge() {
        let before = front_connections_current();
        {
            let _guard = FrontConnectionGuard::new();
            assert_eq!(front_connections_current(), before + 1);
        }
        assert_eq!(front_connections_current(), before);
    }

    #[test]
    fn disconnect_counter_moves() {
        let before = disconnect_count();
        disconnect_incr();
        assert!(disconnect_count() >= before + 1);
    }

    #[test]
    fn write_timing_accepts_samples() {
        redis_write_timing(Duration::from_micros(250));
        assert!(REDIS_WRITE_DURATION.get_sample_count() >= 1);
    }
}
