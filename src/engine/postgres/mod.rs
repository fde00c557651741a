//! `PostgreSQL` Engine
//!
//! Native `tokio-postgres` connections behind the pool.
//!
//! # Implementation Notes
//! - Each connection spawns the driver's connection task, which ends when the
//!   `Client` is dropped
//! - Rows are streamed and the stream is dropped at the row limit
//! - On statement timeout a cancel request is sent with the client's cancel
//!   token, then the connection is retired by the pool
//! - JSON/JSONB preserved as nested JSON, BYTEA Base64-encoded, NUMERIC as
//!   an exact decimal string
//! - Server-side rejections (`DbError`) are `Execution`; a closed client is
//!   `ConnectionLost`

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::{pin_mut, TryStreamExt};
use serde_json::Value;
use std::fmt::Write as _;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};

use crate::dialect::Dialect;
use crate::engine::{ConnectionFactory, ExecutionLimits, QueryResult, SqlConnection};
use crate::error::{QueryGateError, Result};
use crate::uri;

/// Opens `PostgreSQL` connections from parsed URI parameters
pub struct PostgresFactory {
    config: Config,
}

impl PostgresFactory {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let params = uri::extract(uri)?;

        let host = params
            .host
            .as_deref()
            .ok_or_else(|| QueryGateError::invalid_input("PostgreSQL URI requires a host"))?;
        let port = params.port.or(Dialect::Postgresql.default_port()).unwrap_or(5432);

        let mut config = Config::new();
        config.host(host).port(port).application_name("querygate");
        if let Some(user) = params.user.as_deref() {
            config.user(user);
        }
        if let Some(password) = params.password.as_deref() {
            config.password(password);
        }
        if let Some(database) = params.database.as_deref() {
            config.dbname(database);
        }

        Ok(Self { config })
    }
}

#[async_trait]
impl ConnectionFactory for PostgresFactory {
    fn dialect(&self) -> Dialect {
        Dialect::Postgresql
    }

    async fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        let (client, connection) = self.config.connect(NoTls).await.map_err(|e| {
            QueryGateError::connection_lost(format!("Failed to connect to PostgreSQL: {e}"))
        })?;

        // Connection errors are not logged to prevent credential leakage
        tokio::spawn(async move {
            let _ = connection.await;
        });

        Ok(Box::new(PostgresConnection { client }))
    }
}

struct PostgresConnection {
    client: Client,
}

#[async_trait]
impl SqlConnection for PostgresConnection {
    async fn query(&mut self, sql: &str, limits: &ExecutionLimits) -> Result<QueryResult> {
        let Some(timeout) = limits.timeout() else {
            return execute_query(&self.client, sql, limits).await;
        };

        match tokio::time::timeout(timeout, execute_query(&self.client, sql, limits)).await {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = self.client.cancel_token().cancel_query(NoTls).await {
                    tracing::warn!(error = %e, "failed to cancel PostgreSQL statement");
                }
                Err(QueryGateError::statement_timeout(format!(
                    "statement cancelled after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.client.simple_query("SELECT 1").await.map(|_| ()).map_err(classify_error)
    }

    async fn close(self: Box<Self>) {
        drop(self.client);
    }

    fn is_broken(&self) -> bool {
        self.client.is_closed()
    }
}

async fn execute_query(client: &Client, sql: &str, limits: &ExecutionLimits) -> Result<QueryResult> {
    let stmt = client.prepare(sql).await.map_err(classify_error)?;

    if stmt.columns().is_empty() {
        let rows_affected = client.execute(&stmt, &[]).await.map_err(classify_error)?;
        return Ok(QueryResult { rows_affected: Some(rows_affected), ..QueryResult::default() });
    }

    let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

    let stream = client
        .query_raw(&stmt, std::iter::empty::<&dyn ToSql>())
        .await
        .map_err(classify_error)?;
    pin_mut!(stream);

    let mut rows = Vec::new();
    while !limits.row_limit_reached(rows.len()) {
        let Some(row) = stream.try_next().await.map_err(classify_error)? else {
            break;
        };
        rows.push(row_to_json(&row)?);
    }

    Ok(QueryResult { columns, rows, rows_affected: None, execution_ms: 0 })
}

fn classify_error(e: tokio_postgres::Error) -> QueryGateError {
    if let Some(db_error) = e.as_db_error() {
        return QueryGateError::execution(format!("{}: {}", db_error.code().code(), db_error.message()));
    }
    if e.is_closed() {
        return QueryGateError::connection_lost(format!("PostgreSQL connection closed: {e}"));
    }
    QueryGateError::execution(e.to_string())
}

fn row_to_json(row: &Row) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| column_value(row, idx)).collect()
}

fn fetch<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        QueryGateError::execution(format!("Failed to decode column {idx}: {e}"))
    })
}

fn float(v: f64) -> Value {
    // NaN/Infinity have no JSON form
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn column_value(row: &Row, idx: usize) -> Result<Value> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    let ty = row.columns()[idx].type_();

    let value = match *ty {
        Type::BOOL => fetch::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => fetch::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => fetch::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => fetch::<i64>(row, idx)?.map(Value::from),
        Type::OID => fetch::<u32>(row, idx)?.map(Value::from),
        Type::FLOAT4 => fetch::<f32>(row, idx)?.map(|v| float(f64::from(v))),
        Type::FLOAT8 => fetch::<f64>(row, idx)?.map(float),
        Type::NUMERIC => fetch::<Numeric>(row, idx)?.map(|n| Value::String(n.0)),
        Type::JSON | Type::JSONB => fetch::<Value>(row, idx)?,
        Type::BYTEA => fetch::<Vec<u8>>(row, idx)?.map(|b| Value::String(STANDARD.encode(b))),
        Type::TIMESTAMP => fetch::<NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => fetch::<DateTime<Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => fetch::<NaiveDate>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::TIME => fetch::<NaiveTime>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::UUID => fetch::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => {
            fetch::<String>(row, idx)?.map(Value::String)
        }
        // Enums arrive as their label; anything else binary is Base64
        _ => fetch::<Opaque>(row, idx)?.map(|raw| match String::from_utf8(raw.0) {
            Ok(text) => Value::String(text),
            Err(e) => Value::String(STANDARD.encode(e.into_bytes())),
        }),
    };

    Ok(value.unwrap_or(Value::Null))
}

type DecodeError = Box<dyn std::error::Error + Sync + Send>;

/// NUMERIC rendered from its binary wire form without loss
struct Numeric(String);

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, DecodeError> {
        decode_numeric(raw).map(Numeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Raw wire bytes of a type without a dedicated mapping
struct Opaque(Vec<u8>);

impl<'a> FromSql<'a> for Opaque {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, DecodeError> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// Decode `ndigits, weight, sign, dscale, digits[base 10000]` into decimal text
fn decode_numeric(raw: &[u8]) -> std::result::Result<String, DecodeError> {
    let read = |offset: usize| -> std::result::Result<u16, DecodeError> {
        raw.get(offset..offset + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = usize::from(read(0)?);
    let weight = i32::from(read(2)? as i16);
    let sign = read(4)?;
    let dscale = usize::from(read(6)?);

    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }

    let digits = (0..ndigits).map(|i| read(8 + 2 * i)).collect::<std::result::Result<Vec<_>, _>>()?;
    let digit = |idx: i32| -> u16 {
        usize::try_from(idx).ok().and_then(|i| digits.get(i).copied()).unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for idx in 0..=weight {
            if idx == 0 {
                let _ = write!(out, "{}", digit(idx));
            } else {
                let _ = write!(out, "{:04}", digit(idx));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let groups = dscale.div_ceil(4);
        for group in 0..groups {
            let idx = weight + 1 + i32::try_from(group).unwrap_or(i32::MAX);
            let _ = write!(fraction, "{:04}", digit(idx));
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}
