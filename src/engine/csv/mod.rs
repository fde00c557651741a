//! CSV Engine
//!
//! Queries CSV files through an in-memory `SQLite` database.
//!
//! `csv://<path>` is opaque: everything after `://` is a file path or a
//! directory. A directory contributes every `*.csv` file in it (sorted by
//! name). Each file becomes one table named after its file stem; the header
//! row supplies column names.
//!
//! Values are stored with `SQLite` type affinity inferred per cell: integers
//! and reals are stored as numbers, empty cells as NULL, everything else as
//! text. Each pooled connection loads its own snapshot of the files.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

use super::sqlite::SqliteConnection;
use crate::dialect::{split_scheme, Dialect};
use crate::engine::{ConnectionFactory, SqlConnection};
use crate::error::{QueryGateError, Result};

/// Loads CSV sources into fresh in-memory databases
pub struct CsvFactory {
    source: PathBuf,
}

impl CsvFactory {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (_, path) = split_scheme(uri)?;
        if path.is_empty() {
            return Err(QueryGateError::malformed_uri("CSV URI requires a file or directory path"));
        }
        Ok(Self { source: PathBuf::from(path) })
    }

    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[async_trait]
impl ConnectionFactory for CsvFactory {
    fn dialect(&self) -> Dialect {
        Dialect::Csv
    }

    async fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        let source = self.source.clone();
        let conn = tokio::task::spawn_blocking(move || load_sources(&source))
            .await
            .map_err(|e| QueryGateError::connection_lost(format!("CSV loader failed: {e}")))??;

        Ok(Box::new(SqliteConnection::new(conn)))
    }
}

/// Resolve the CSV files named by a source path
fn csv_files(source: &Path) -> Result<Vec<PathBuf>> {
    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }

    if !source.is_dir() {
        return Err(QueryGateError::connection_lost(format!(
            "CSV source '{}' does not exist",
            source.display()
        )));
    }

    let entries = std::fs::read_dir(source).map_err(|e| {
        QueryGateError::connection_lost(format!("Failed to read CSV directory: {e}"))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")) && path.is_file()
        })
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(QueryGateError::connection_lost(format!(
            "CSV directory '{}' contains no .csv files",
            source.display()
        )));
    }

    Ok(files)
}

fn load_sources(source: &Path) -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .map_err(|e| QueryGateError::connection_lost(format!("Failed to open in-memory database: {e}")))?;

    for file in csv_files(source)? {
        load_file(&conn, &file)?;
    }

    Ok(conn)
}

fn load_file(conn: &Connection, file: &Path) -> Result<()> {
    let table = file
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| QueryGateError::invalid_input("CSV file name is not valid UTF-8"))?;

    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(::csv::Trim::All)
        .from_path(file)
        .map_err(|e| {
            QueryGateError::connection_lost(format!("Failed to read '{}': {e}", file.display()))
        })?;

    let parse_err = |e: ::csv::Error| {
        QueryGateError::invalid_input(format!("Failed to parse '{}': {e}", file.display()))
    };

    let columns: Vec<String> = reader.headers().map_err(parse_err)?.iter().map(str::to_string).collect();
    if columns.iter().all(String::is_empty) {
        return Err(QueryGateError::invalid_input(format!(
            "CSV file '{}' has no header row",
            file.display()
        )));
    }

    let column_list = columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");

    let map_err = |e: rusqlite::Error| {
        QueryGateError::invalid_input(format!("Failed to load '{}': {e}", file.display()))
    };

    conn.execute(&format!("CREATE TABLE {} ({column_list})", quote_identifier(table)), [])
        .map_err(map_err)?;

    let mut insert = conn
        .prepare(&format!("INSERT INTO {} VALUES ({placeholders})", quote_identifier(table)))
        .map_err(map_err)?;

    for record in reader.records() {
        let record = record.map_err(parse_err)?;
        let mut values: Vec<SqlValue> = record.iter().take(columns.len()).map(infer_value).collect();
        values.resize(columns.len(), SqlValue::Null);
        insert.execute(rusqlite::params_from_iter(values)).map_err(map_err)?;
    }

    tracing::debug!(table, "loaded CSV table");
    Ok(())
}

fn infer_value(raw: &str) -> SqlValue {
    if raw.is_empty() {
        SqlValue::Null
    } else if let Ok(i) = raw.parse::<i64>() {
        SqlValue::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        SqlValue::Real(f)
    } else {
        SqlValue::Text(raw.to_string())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
