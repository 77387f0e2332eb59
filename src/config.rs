use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;

/// Default number of upstream connections per backend pool.
const DEFAULT_POOL_SIZE: usize = 8;
/// Default cap on commands per batch when multiplexing is disabled.
const DEFAULT_BATCH_CAP: usize = 100;
/// Default per-session transaction timeout in milliseconds.
const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 500;
/// Default upstream I/O and checkout timeouts in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub multiplexing: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_batch_cap")]
    pub batch_cap: usize,
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub checkout_timeout_ms: u64,
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    /// Ensure configuration correctness.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            bail!("listen_addr cannot be empty");
        }
        if self.servers.is_empty() {
            bail!("at least one backend server must be configured");
        }
        if self.pool_size == 0 {
            bail!("pool_size must be positive");
        }
        if self.batch_cap == 0 {
            bail!("batch_cap must be positive");
        }
        Ok(())
    }

    /// Commands allowed per batch; forced to one when multiplexing so a
    /// batch never straddles backends.
    pub fn effective_batch_cap(&self) -> usize {
        if self.multiplexing {
            1
        } else {
            self.batch_cap
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_batch_cap() -> usize {
    DEFAULT_BATCH_CAP
}

fn default_transaction_timeout_ms() -> u64 {
    DEFAULT_TRANSACTION_TIMEOUT_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}
