//! Connection Pool
//!
//! Bounded pool of driver connections behind one `Engine`.
//!
//! # Checkout
//! 1. Take a permit (at most `pool_size + max_overflow` connections exist)
//! 2. Reuse the most recently returned idle connection, discarding any past
//!    the recycle age or failing pre-ping
//! 3. Otherwise open a new connection through the factory
//!
//! The whole checkout is bounded by the acquire timeout and fails with
//! `PoolTimeout` rather than blocking indefinitely.
//!
//! # Return
//! Connections return to the idle set when the `PooledConnection` guard is
//! dropped. Broken connections, and any beyond `pool_size`, are dropped
//! instead, which releases their driver resources.

mod policy;

pub use policy::{PoolPolicy, ACQUIRE_TIMEOUT_SECS, MAX_OVERFLOW, POOL_SIZE, RECYCLE_SECS};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::engine::{ConnectionFactory, ExecutionLimits, QueryResult, SqlConnection};
use crate::error::{QueryGateError, Result};

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Open connections (idle + active)
    pub size: usize,
    /// Connections waiting in the idle set
    pub idle: usize,
    /// Connections checked out
    pub active: usize,
    /// Callers waiting for a permit
    pub waiting: usize,
}

struct Slot {
    conn: Box<dyn SqlConnection>,
    created_at: Instant,
    broken: bool,
}

impl Slot {
    fn new(conn: Box<dyn SqlConnection>) -> Self {
        Self { conn, created_at: Instant::now(), broken: false }
    }

    fn reusable(&self) -> bool {
        !self.broken && !self.conn.is_broken()
    }
}

/// Decrements the waiting counter even when the acquire future is cancelled
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pool of connections produced by one factory
pub struct ConnectionPool {
    policy: PoolPolicy,
    factory: Box<dyn ConnectionFactory>,
    idle: Mutex<VecDeque<Slot>>,
    semaphore: Arc<Semaphore>,
    active_count: AtomicUsize,
    waiting_count: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(factory: Box<dyn ConnectionFactory>, policy: PoolPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(policy.max_connections())),
            policy,
            factory,
            idle: Mutex::new(VecDeque::new()),
            active_count: AtomicUsize::new(0),
            waiting_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Open one connection and park it in the idle set
    pub async fn warm_up(&self) -> Result<()> {
        let conn = self.get().await?;
        drop(conn);
        Ok(())
    }

    /// Check out a connection, bounded by the acquire timeout
    pub async fn get(&self) -> Result<PooledConnection<'_>> {
        if self.is_closed() {
            return Err(QueryGateError::connection_lost("engine has been disposed"));
        }

        let acquire = async {
            let permit = {
                let _waiting = WaitGuard::enter(&self.waiting_count);
                self.semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| QueryGateError::connection_lost("engine has been disposed"))?
            };

            let slot = match self.checkout_idle().await {
                Some(slot) => slot,
                None => Slot::new(self.factory.connect().await?),
            };

            self.active_count.fetch_add(1, Ordering::SeqCst);
            Ok(PooledConnection { slot: Some(slot), pool: self, _permit: permit })
        };

        match tokio::time::timeout(self.policy.acquire_timeout, acquire).await {
            Ok(result) => result,
            Err(_) => Err(QueryGateError::pool_timeout(format!(
                "no connection available within {:?} ({} in use)",
                self.policy.acquire_timeout,
                self.active_count.load(Ordering::SeqCst)
            ))),
        }
    }

    /// Pop idle connections until one passes the recycle and pre-ping checks
    async fn checkout_idle(&self) -> Option<Slot> {
        loop {
            let mut slot = self.idle.lock().pop_back()?;

            if slot.created_at.elapsed() >= self.policy.recycle {
                tracing::debug!(dialect = %self.factory.dialect(), "recycling aged connection");
                slot.conn.close().await;
                continue;
            }

            if self.policy.pre_ping {
                if let Err(e) = slot.conn.ping().await {
                    tracing::debug!(
                        dialect = %self.factory.dialect(),
                        error = %e,
                        "pre-ping failed, replacing connection"
                    );
                    slot.conn.close().await;
                    continue;
                }
            }

            return Some(slot);
        }
    }

    fn return_slot(&self, slot: Slot) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);

        if !slot.reusable() || self.is_closed() {
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.policy.pool_size {
            idle.push_back(slot);
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let active = self.active_count.load(Ordering::SeqCst);
        let waiting = self.waiting_count.load(Ordering::SeqCst);
        PoolStats { size: idle + active, idle, active, waiting }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse further checkouts and close every idle connection
    ///
    /// Checked-out connections are dropped when their guards are released.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();

        let slots: Vec<Slot> = self.idle.lock().drain(..).collect();
        for slot in slots {
            slot.conn.close().await;
        }
    }
}

/// A connection borrowed from the pool
///
/// When dropped, the connection is returned to the pool.
pub struct PooledConnection<'a> {
    slot: Option<Slot>,
    pool: &'a ConnectionPool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection<'_> {
    /// Execute a statement, marking the connection broken on transport faults
    pub async fn query(&mut self, sql: &str, limits: &ExecutionLimits) -> Result<QueryResult> {
        let slot = self
            .slot
            .as_mut()
            .ok_or_else(|| QueryGateError::connection_lost("connection already released"))?;

        let result = slot.conn.query(sql, limits).await;
        if matches!(
            result,
            Err(QueryGateError::ConnectionLost(_) | QueryGateError::StatementTimeout(_))
        ) {
            slot.broken = true;
        }
        result
    }

    pub async fn ping(&mut self) -> Result<()> {
        let slot = self
            .slot
            .as_mut()
            .ok_or_else(|| QueryGateError::connection_lost("connection already released"))?;

        let result = slot.conn.ping().await;
        if result.is_err() {
            slot.broken = true;
        }
        result
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.return_slot(slot);
        }
    }
}
