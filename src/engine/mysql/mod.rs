//! `MySQL` Engine
//!
//! Native `mysql_async` connections behind the pool. `MariaDB` URIs use the
//! same driver.
//!
//! # Implementation Notes
//! - The `+driver` segment of a normalized URI is ignored; the dialect alone
//!   selects this module
//! - Missing port defaults to 3306 here, never at URI parse time
//! - Rows are read one at a time and the rest of the result set is discarded
//!   at the row limit
//! - A statement timeout drops the in-flight future and marks the connection
//!   broken so the pool never reuses it
//! - Binary column data is Base64-encoded for JSON safety

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Row, Value};

use crate::dialect::Dialect;
use crate::engine::{ConnectionFactory, ExecutionLimits, QueryResult, SqlConnection};
use crate::error::{QueryGateError, Result};
use crate::uri;

/// Opens `MySQL` connections from parsed URI parameters
pub struct MysqlFactory {
    opts: OptsBuilder,
}

impl MysqlFactory {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let params = uri::extract(uri)?;

        let host = params
            .host
            .ok_or_else(|| QueryGateError::invalid_input("MySQL URI requires a host"))?;
        let port = params.port.or(Dialect::Mysql.default_port()).unwrap_or(3306);

        let opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(params.user)
            .pass(params.password)
            .db_name(params.database);

        Ok(Self { opts })
    }
}

#[async_trait]
impl ConnectionFactory for MysqlFactory {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        let conn = Conn::new(self.opts.clone()).await.map_err(|e| {
            QueryGateError::connection_lost(format!("Failed to connect to MySQL: {e}"))
        })?;

        Ok(Box::new(MysqlConnection { conn, broken: false }))
    }
}

struct MysqlConnection {
    conn: Conn,
    broken: bool,
}

#[async_trait]
impl SqlConnection for MysqlConnection {
    async fn query(&mut self, sql: &str, limits: &ExecutionLimits) -> Result<QueryResult> {
        let outcome = match limits.timeout() {
            Some(timeout) => {
                match tokio::time::timeout(timeout, execute_query(&mut self.conn, sql, limits)).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.broken = true;
                        return Err(QueryGateError::statement_timeout(format!(
                            "statement abandoned after {}ms",
                            timeout.as_millis()
                        )));
                    }
                }
            }
            None => execute_query(&mut self.conn, sql, limits).await,
        };

        if matches!(outcome, Err(QueryGateError::ConnectionLost(_))) {
            self.broken = true;
        }
        outcome
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await.map_err(classify_error)
    }

    async fn close(self: Box<Self>) {
        let _ = self.conn.disconnect().await;
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

async fn execute_query(conn: &mut Conn, sql: &str, limits: &ExecutionLimits) -> Result<QueryResult> {
    let mut result = conn.query_iter(sql).await.map_err(classify_error)?;

    let columns: Vec<String> = result
        .columns()
        .map(|cols| cols.iter().map(|c| c.name_str().to_string()).collect())
        .unwrap_or_default();

    if columns.is_empty() {
        let rows_affected = result.affected_rows();
        result.drop_result().await.map_err(classify_error)?;
        return Ok(QueryResult { rows_affected: Some(rows_affected), ..QueryResult::default() });
    }

    let mut rows = Vec::new();
    while !limits.row_limit_reached(rows.len()) {
        let Some(row) = result.next().await.map_err(classify_error)? else {
            break;
        };
        rows.push(row_to_json(&row));
    }
    result.drop_result().await.map_err(classify_error)?;

    Ok(QueryResult { columns, rows, rows_affected: None, execution_ms: 0 })
}

fn classify_error(e: mysql_async::Error) -> QueryGateError {
    match e {
        mysql_async::Error::Server(err) => {
            QueryGateError::execution(format!("{} ({}): {}", err.code, err.state, err.message))
        }
        mysql_async::Error::Io(err) => QueryGateError::connection_lost(format!("MySQL I/O error: {err}")),
        mysql_async::Error::Driver(err) => {
            QueryGateError::connection_lost(format!("MySQL driver error: {err}"))
        }
        other => QueryGateError::execution(other.to_string()),
    }
}

fn row_to_json(row: &Row) -> Vec<serde_json::Value> {
    (0..row.len()).map(|idx| row.as_ref(idx).map_or(serde_json::Value::Null, mysql_value_to_json)).collect()
}

fn mysql_value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,

        // Text protocol delivers most types as bytes; only non-UTF-8 data is Base64
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => serde_json::Value::String(s.to_string()),
            Err(_) => serde_json::Value::String(STANDARD.encode(bytes)),
        },

        Value::Int(i) => serde_json::Value::from(*i),
        Value::UInt(u) => serde_json::Value::from(*u),

        Value::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Double(d) => {
            serde_json::Number::from_f64(*d).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }

        Value::Date(year, month, day, hour, minute, second, micro) => serde_json::Value::String(format!(
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
        )),

        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            serde_json::Value::String(format!("{sign}{total_hours}:{minutes:02}:{seconds:02}.{micros:06}"))
        }
    }
}
