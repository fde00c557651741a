//! Database Engines
//!
//! This module defines the execution layer behind every cached engine handle.
//! Each dialect (`PostgreSQL`, `MySQL`, `SQLite`, CSV) provides a
//! `ConnectionFactory` that opens native driver connections implementing
//! `SqlConnection`; an `Engine` wraps one factory in a `ConnectionPool`.
//!
//! # Engine Isolation
//! Each driver module is completely independent.
//! No shared SQL helpers or cross-engine abstractions beyond the two traits.
//!
//! # Statement Timeouts
//! Timeouts are enforced inside each driver, because cancellation is
//! driver-specific (cancel token, discarded connection, or interrupt handle).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dialect::Dialect;
use crate::error::{QueryGateError, Result};
use crate::pool::{ConnectionPool, PoolPolicy, PoolStats};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "csv")]
pub mod csv;

#[cfg(test)]
pub(crate) mod mock;

/// Per-statement execution limits
///
/// All limits default to unlimited; the pipeline fills them from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Maximum number of rows to fetch (rows beyond are never read)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,

    /// Statement timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecutionLimits {
    #[must_use]
    pub const fn new(max_rows: Option<usize>, timeout_ms: Option<u64>) -> Self {
        Self { max_rows, timeout_ms }
    }

    /// Statement timeout as a `Duration`
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Whether `fetched` rows already satisfy the row limit
    #[must_use]
    pub fn row_limit_reached(&self, fetched: usize) -> bool {
        self.max_rows.is_some_and(|max| fetched >= max)
    }
}

/// Result of a statement execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in result order
    pub columns: Vec<String>,

    /// Result rows (each row is positional, matching `columns`)
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Number of rows affected (statements without a result set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// Wall-clock execution time in milliseconds, measured around the driver call
    pub execution_ms: u64,
}

impl QueryResult {
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A single live connection to a target database
#[async_trait]
pub trait SqlConnection: Send {
    /// Execute one statement, honoring row and time limits
    ///
    /// Statements rejected by the server fail with `Execution`; transport
    /// failures with `ConnectionLost`; an expired timeout with `StatementTimeout`.
    async fn query(&mut self, sql: &str, limits: &ExecutionLimits) -> Result<QueryResult>;

    /// Cheap liveness probe used by pre-ping
    async fn ping(&mut self) -> Result<()>;

    /// Close the connection, releasing network resources
    async fn close(self: Box<Self>);

    /// Whether the connection must not be reused
    fn is_broken(&self) -> bool {
        false
    }
}

/// Opens new connections for one target database
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn connect(&self) -> Result<Box<dyn SqlConnection>>;
}

/// Build the connection factory for a dialect from a normalized URI
///
/// The URI is parsed here and not retained in plaintext beyond what the
/// driver's own connection options require.
pub fn connection_factory(dialect: Dialect, uri: &str) -> Result<Box<dyn ConnectionFactory>> {
    match dialect {
        #[cfg(feature = "postgres")]
        Dialect::Postgresql => Ok(Box::new(postgres::PostgresFactory::from_uri(uri)?)),

        #[cfg(feature = "mysql")]
        Dialect::Mysql => Ok(Box::new(mysql::MysqlFactory::from_uri(uri)?)),

        #[cfg(feature = "sqlite")]
        Dialect::Sqlite => Ok(Box::new(sqlite::SqliteFactory::from_uri(uri)?)),

        #[cfg(feature = "csv")]
        Dialect::Csv => Ok(Box::new(csv::CsvFactory::from_uri(uri)?)),

        #[allow(unreachable_patterns)]
        other => Err(QueryGateError::invalid_input(format!(
            "{other} engine is not enabled in this build"
        ))),
    }
}

/// Pooled engine for one stored connection
pub struct Engine {
    dialect: Dialect,
    pool: ConnectionPool,
}

/// Shared handle to a cached engine
pub type EngineHandle = Arc<Engine>;

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dialect", &self.dialect)
            .field("stats", &self.pool.stats())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build a pooled engine for a normalized URI under the fixed pool policy
    ///
    /// The first connection is opened eagerly, so unreachable hosts and bad
    /// credentials fail here rather than on first use.
    pub async fn connect(dialect: Dialect, uri: &str) -> Result<Self> {
        let factory = connection_factory(dialect, uri)?;
        Self::with_factory(factory, PoolPolicy::default()).await
    }

    /// Build a pooled engine from an explicit factory and policy
    pub async fn with_factory(factory: Box<dyn ConnectionFactory>, policy: PoolPolicy) -> Result<Self> {
        let dialect = factory.dialect();
        let pool = ConnectionPool::new(factory, policy);
        pool.warm_up().await?;
        Ok(Self { dialect, pool })
    }

    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn policy(&self) -> &PoolPolicy {
        self.pool.policy()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Execute a statement on a pooled connection
    pub async fn execute(&self, sql: &str, limits: &ExecutionLimits) -> Result<QueryResult> {
        let mut conn = self.pool.get().await?;

        let start = Instant::now();
        let mut result = conn.query(sql, limits).await?;
        result.execution_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok(result)
    }

    /// Check out a connection and probe it
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.ping().await
    }

    /// Close all idle connections and refuse further checkouts
    pub async fn dispose(&self) {
        self.pool.close().await;
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.pool.is_closed()
    }
}
