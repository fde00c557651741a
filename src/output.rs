//! JSON Output Envelope Types
//!
//! Every CLI command prints exactly one envelope on stdout.
//!
//! # Output Contract
//! - Success: `{"ok": true, "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "command": "...", "error": {"code": "...", "message": "..."}}`
//!
//! Connection records are printed through [`ConnectionSummary`], which has no
//! URI field at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::{DatabaseConnection, Metadata};
use crate::dialect::Dialect;
use crate::error::QueryGateError;

/// Success envelope for command results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Command that was executed (e.g. `connection add`, `generate`)
    pub command: String,

    pub data: T,

    pub meta: Meta,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(command: impl Into<String>, data: T, meta: Meta) -> Self {
        Self { ok: true, command: command.into(), data, meta }
    }
}

/// Error envelope for command failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, command: command.into(), error }
    }

    pub fn from_error(command: impl Into<String>, err: &QueryGateError) -> Self {
        Self::new(command, ErrorInfo::new(err.error_code(), err.message()))
    }
}

/// Error information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g. `NOT_FOUND`, `CONNECTION_BUILD_ERROR`)
    pub code: String,

    /// Human-readable message (no credentials)
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub execution_ms: u64,

    /// Number of items in list results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl Meta {
    #[must_use]
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, count: None }
    }

    #[must_use]
    pub const fn with_count(execution_ms: u64, count: usize) -> Self {
        Self { execution_ms, count: Some(count) }
    }
}

/// Printable view of a stored connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub alias: String,
    pub dialect: Dialect,
    pub schemas: Vec<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl From<&DatabaseConnection> for ConnectionSummary {
    fn from(connection: &DatabaseConnection) -> Self {
        Self {
            id: connection.id.clone(),
            alias: connection.alias.clone(),
            dialect: connection.dialect,
            schemas: connection.schemas.clone(),
            metadata: connection.metadata.clone(),
            created_at: connection.created_at,
        }
    }
}
