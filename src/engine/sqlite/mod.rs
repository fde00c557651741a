//! `SQLite` Engine
//!
//! # Features
//! - File-based connections (`sqlite:///relative.db`, `sqlite:////abs/path.db`)
//! - In-memory connections (`sqlite:///:memory:`); each pooled connection is
//!   its own private database
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver); every call runs on `spawn_blocking`
//! - Statement timeouts interrupt the running statement through the
//!   connection's interrupt handle
//! - BLOB data is Base64-encoded for JSON safety
//! - Row limits enforced while stepping the statement

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;

use crate::dialect::Dialect;
use crate::engine::{ConnectionFactory, ExecutionLimits, QueryResult, SqlConnection};
use crate::error::{QueryGateError, Result};
use crate::uri;

const MEMORY: &str = ":memory:";

const INTERRUPT_ATTEMPTS: usize = 50;
const INTERRUPT_WAIT: Duration = Duration::from_millis(20);

/// Opens `SQLite` connections to one database file
pub struct SqliteFactory {
    path: String,
}

impl SqliteFactory {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let params = uri::extract(uri)?;
        let path = params
            .database
            .or(params.host)
            .ok_or_else(|| QueryGateError::malformed_uri("SQLite URI requires a database path"))?;
        Ok(Self { path })
    }

    /// Path of the database file (or `:memory:`)
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl ConnectionFactory for SqliteFactory {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        let path = self.path.clone();
        let conn = joined(tokio::task::spawn_blocking(move || open_connection(&path)).await)?;

        Ok(Box::new(SqliteConnection::new(conn)))
    }
}

/// Open `SQLite` connection with read-write flags
fn open_connection(path: &str) -> Result<Connection> {
    if path == MEMORY {
        return Connection::open_in_memory().map_err(|e| {
            QueryGateError::connection_lost(format!("Failed to open SQLite database: {e}"))
        });
    }

    Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE)
        .map_err(|e| QueryGateError::connection_lost(format!("Failed to open SQLite database: {e}")))
}

/// A `rusqlite` connection driven from async code
pub(crate) struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    interrupt: InterruptHandle,
}

impl SqliteConnection {
    pub(crate) fn new(conn: Connection) -> Self {
        let interrupt = conn.get_interrupt_handle();
        Self { conn: Arc::new(Mutex::new(conn)), interrupt }
    }

    async fn run<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        joined(tokio::task::spawn_blocking(move || work(&conn.lock())).await)
    }
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    result.map_err(|e| QueryGateError::connection_lost(format!("SQLite worker failed: {e}")))?
}

#[async_trait]
impl SqlConnection for SqliteConnection {
    async fn query(&mut self, sql: &str, limits: &ExecutionLimits) -> Result<QueryResult> {
        let conn = Arc::clone(&self.conn);
        let statement = sql.to_string();
        let task_limits = limits.clone();
        let mut task =
            tokio::task::spawn_blocking(move || execute_query(&conn.lock(), &statement, &task_limits));

        let Some(timeout) = limits.timeout() else {
            return joined(task.await);
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(result) => joined(result),
            Err(_) => {
                // A statement not yet running ignores an interrupt, so repeat
                // until the worker returns
                for _ in 0..INTERRUPT_ATTEMPTS {
                    self.interrupt.interrupt();
                    if tokio::time::timeout(INTERRUPT_WAIT, &mut task).await.is_ok() {
                        break;
                    }
                }
                Err(QueryGateError::statement_timeout(format!(
                    "statement interrupted after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(classify_error)
        })
        .await
    }

    async fn close(self: Box<Self>) {
        // The connection closes when the last Arc (possibly held by an
        // interrupted worker) is dropped
        drop(self);
    }
}

fn execute_query(conn: &Connection, sql: &str, limits: &ExecutionLimits) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql).map_err(classify_error)?;

    let columns: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    if columns.is_empty() {
        let rows_affected = stmt.execute([]).map_err(classify_error)?;
        return Ok(QueryResult {
            rows_affected: Some(rows_affected as u64),
            ..QueryResult::default()
        });
    }

    let mut rows_data = Vec::new();
    let mut rows = stmt.query([]).map_err(classify_error)?;
    while !limits.row_limit_reached(rows_data.len()) {
        let Some(row) = rows.next().map_err(classify_error)? else {
            break;
        };
        rows_data.push(row_to_json(columns.len(), row).map_err(classify_error)?);
    }

    Ok(QueryResult { columns, rows: rows_data, rows_affected: None, execution_ms: 0 })
}

fn classify_error(e: rusqlite::Error) -> QueryGateError {
    match e.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => {
            QueryGateError::statement_timeout("SQLite statement interrupted")
        }
        Some(ErrorCode::SystemIoFailure | ErrorCode::CannotOpen | ErrorCode::NotADatabase) => {
            QueryGateError::connection_lost(format!("SQLite database unavailable: {e}"))
        }
        _ => QueryGateError::execution(e.to_string()),
    }
}

/// Convert a `SQLite` row to positional JSON values
fn row_to_json(width: usize, row: &Row) -> rusqlite::Result<Vec<serde_json::Value>> {
    (0..width).map(|idx| sqlite_value_to_json(row, idx)).collect()
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(row: &Row, idx: usize) -> rusqlite::Result<serde_json::Value> {
    use base64::Engine;
    use rusqlite::types::ValueRef;

    Ok(match row.get_ref(idx)? {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // Handle NaN/Infinity as null
        ValueRef::Text(s) => serde_json::Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}
