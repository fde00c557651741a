//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout Querygate.
//! All errors are structured and map to specific error codes for JSON output.
//!
//! # Error Categories
//! - `Decryption` / `Encryption`: credential vault failures
//! - `UnsupportedDialect` / `MalformedUri`: bad connection input, never retried
//! - `ConnectionBuild`: reaching the target database failed while resolving an engine
//! - `Execution`: the target database rejected a statement (expected, frequent)
//! - `Agent`: the SQL-generating call itself failed
//! - `Rejected`: candidate SQL refused before execution
//! - `PoolTimeout` / `StatementTimeout` / `ConnectionLost`: infrastructure faults at run time
//! - `NotFound` / `Storage`: repository lookups and persistence
//! - `DataIntegrity`, `InvalidInput`, `Config`: everything else
//!
//! Messages never contain a decrypted connection URI or password.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stage of engine resolution at which a `ConnectionBuild` error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStage {
    /// Decrypting the stored connection URI
    Decrypt,
    /// Deriving or verifying the dialect
    Dialect,
    /// Rewriting the driver segment of the URI
    Normalize,
    /// Opening the pooled engine against the target database
    Connect,
}

impl BuildStage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Decrypt => "decrypt",
            Self::Dialect => "dialect",
            Self::Normalize => "normalize",
            Self::Connect => "connect",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for Querygate operations
#[derive(Error, Debug)]
pub enum QueryGateError {
    /// Ciphertext is malformed or was sealed under a different key
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Sealing a plaintext value failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// The URI scheme does not name a supported dialect
    #[error("Unsupported dialect: '{scheme}'")]
    UnsupportedDialect { scheme: String },

    /// The URI is missing its scheme or authority section
    #[error("Malformed connection URI: {0}")]
    MalformedUri(String),

    /// Resolving an engine for a stored connection failed
    #[error("Connection build failed for '{connection_id}' ({dialect}) at {stage}: {detail}")]
    ConnectionBuild { connection_id: String, dialect: String, stage: BuildStage, detail: String },

    /// The target database rejected or errored on a statement
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The SQL-generating agent failed to answer
    #[error("Agent failed: {0}")]
    Agent(String),

    /// Candidate SQL was refused before execution (empty, multi-statement or unsafe)
    #[error("Candidate rejected: {0}")]
    Rejected(String),

    /// No pooled connection became available within the acquire timeout
    #[error("Pool timeout: {0}")]
    PoolTimeout(String),

    /// A statement exceeded the execution timeout and was cancelled
    #[error("Statement timeout: {0}")]
    StatementTimeout(String),

    /// The network connection to the target database broke mid-operation
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A record could not be found in the repository
    #[error("{collection} '{id}' not found")]
    NotFound { collection: String, id: String },

    /// Stored data contradicts itself (e.g. dialect tag vs decrypted URI)
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (file not found, invalid JSON, missing key, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Repository read/write failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl QueryGateError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Decryption(_) => "DECRYPTION_ERROR",
            Self::Encryption(_) => "ENCRYPTION_ERROR",
            Self::UnsupportedDialect { .. } => "UNSUPPORTED_DIALECT",
            Self::MalformedUri(_) => "MALFORMED_URI",
            Self::ConnectionBuild { .. } => "CONNECTION_BUILD_ERROR",
            Self::Execution(_) => "EXECUTION_ERROR",
            Self::Agent(_) => "AGENT_ERROR",
            Self::Rejected(_) => "CANDIDATE_REJECTED",
            Self::PoolTimeout(_) => "POOL_TIMEOUT",
            Self::StatementTimeout(_) => "STATEMENT_TIMEOUT",
            Self::ConnectionLost(_) => "CONNECTION_LOST",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::DataIntegrity(_) => "DATA_INTEGRITY_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Get human-readable error message (no credentials)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Whether this error is a bad-input rejection that retrying cannot fix
    #[must_use]
    pub const fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedDialect { .. } | Self::MalformedUri(_) | Self::InvalidInput(_)
        )
    }

    pub fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption(message.into())
    }

    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption(message.into())
    }

    pub fn unsupported_dialect(scheme: impl Into<String>) -> Self {
        Self::UnsupportedDialect { scheme: scheme.into() }
    }

    pub fn malformed_uri(message: impl Into<String>) -> Self {
        Self::MalformedUri(message.into())
    }

    /// Create a connection build error with connection-identifying context
    pub fn connection_build(
        connection_id: impl Into<String>,
        dialect: impl Into<String>,
        stage: BuildStage,
        detail: impl Into<String>,
    ) -> Self {
        Self::ConnectionBuild {
            connection_id: connection_id.into(),
            dialect: dialect.into(),
            stage,
            detail: detail.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn pool_timeout(message: impl Into<String>) -> Self {
        Self::PoolTimeout(message.into())
    }

    pub fn statement_timeout(message: impl Into<String>) -> Self {
        Self::StatementTimeout(message.into())
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost(message.into())
    }

    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound { collection: collection.into(), id: id.into() }
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

/// Result type alias for Querygate operations
pub type Result<T> = std::result::Result<T, QueryGateError>;
