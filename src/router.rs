use std::sync::Arc;

use crate::backend::ConnectionPool;
use crate::com::{Error, Result};
use crate::protocol::CommandFrame;

/// Virtual nodes per backend on the hash ring.
const VIRTUAL_NODE_FACTOR: usize = 40;

/// Chooses the pool a command is forwarded to.
///
/// With a single backend every command uses the default pool. With
/// several, the first key argument is hashed onto a ketama-style ring so
/// the assignment is stable under a static backend set.
pub struct Router {
    pools: Vec<Arc<ConnectionPool>>,
    ring: Vec<(u64, usize)>,
}

impl Router {
    pub fn new(pools: Vec<Arc<ConnectionPool>>) -> Self {
        assert!(!pools.is_empty(), "router requires at least one pool");
        let ring = if pools.len() > 1 {
            build_ring(&pools)
        } else {
            Vec::new()
        };
        Self { pools, ring }
    }

    pub fn default_pool(&self) -> &Arc<ConnectionPool> {
        &self.pools[0]
    }

    pub fn pools(&self) -> &[Arc<ConnectionPool>] {
        &self.pools
    }

    /// Pool for one command. Keyless commands never get here when
    /// multiplexing: the classifier intercepts or denies them first.
    pub fn route(&self, frame: &CommandFrame) -> Result<&Arc<ConnectionPool>> {
        if self.pools.len() == 1 {
            return Ok(&self.pools[0]);
        }
        let key = frame.first_arg().ok_or(Error::Unsupported)?;
        let hash = hash_key(key);
        let idx = match self.ring.binary_search_by_key(&hash, |(value, _pool)| *value) {
            Ok(idx) => idx,
            Err(idx) if idx >= self.ring.len() => 0,
            Err(idx) => idx,
        };
        Ok(&self.pools[self.ring[idx].1])
    }
}

fn build_ring(pools: &[Arc<ConnectionPool>]) -> Vec<(u64, usize)> {
    let mut ring = Vec::with_capacity(pools.len() * VIRTUAL_NODE_FACTOR);
    for (pool_idx, pool) in pools.iter().enumerate() {
        for replica in 0..VIRTUAL_NODE_FACTOR {
            let label = format!("{}-{}", pool.addr(), replica);
            ring.push((hash_key(label.as_bytes()), pool_idx));
        }
    }
    ring.sort_by_key(|(hash, _)| *hash);
    ring
}

fn hash_key(data: &[u8]) -> u64 {
    let digest = md5::compute(data);
    let bytes = digest.0;
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
