//! Fixed pool policy applied to every engine

use std::time::Duration;

/// Connections kept open per engine
pub const POOL_SIZE: usize = 10;

/// Extra connections allowed above `POOL_SIZE` under burst load
pub const MAX_OVERFLOW: usize = 5;

/// Seconds to wait for a pooled connection before failing
pub const ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Seconds after which a connection is discarded and rebuilt
pub const RECYCLE_SECS: u64 = 1500;

/// Limits governing one engine's connection pool
///
/// Engines built through the cache always use `PoolPolicy::default()`;
/// other values exist for tests and benchmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Maximum idle connections retained
    pub pool_size: usize,
    /// Connections allowed beyond `pool_size`; closed on return
    pub max_overflow: usize,
    /// Bound on waiting for a connection (including opening a new one)
    pub acquire_timeout: Duration,
    /// Age after which a connection is closed instead of reused
    pub recycle: Duration,
    /// Probe idle connections before handing them out
    pub pre_ping: bool,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            pool_size: POOL_SIZE,
            max_overflow: MAX_OVERFLOW,
            acquire_timeout: Duration::from_secs(ACQUIRE_TIMEOUT_SECS),
            recycle: Duration::from_secs(RECYCLE_SECS),
            pre_ping: true,
        }
    }
}

impl PoolPolicy {
    /// Hard cap on simultaneously open connections
    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.pool_size + self.max_overflow
    }
}
