//! Querygate - Validated SQL Generation over Pooled Connections
//!
//! Querygate registers connections to heterogeneous SQL databases, keeps one
//! pooled engine per connection, and runs candidate SQL from an external
//! generating agent through a generate → guard → execute → classify pipeline
//! that records every attempt as `VALID`, `INVALID` or `ERROR`.
//!
//! # Core Principles
//! - Credentials are encrypted at rest; plaintext URIs are never logged or persisted
//! - At most one pooled engine per connection id, even under concurrent access
//! - Agent output is untrusted: only single read-only statements are executed
//! - Validation by execution: a candidate is `VALID` only after it ran
//! - Infrastructure failures (`ERROR`) are kept apart from wrong answers (`INVALID`)
//!
//! # Module Organization
//! - [`error`] - Error types and codes
//! - [`vault`] - AES-256-GCM credential vault
//! - [`dialect`] - Dialect table, detection and driver normalization
//! - [`uri`] - Connection URI parameter extraction
//! - [`engine`] - Native driver connections and the pooled `Engine`
//! - [`pool`] - Connection pool and fixed pool policy
//! - [`cache`] - Engine pool cache keyed by connection id
//! - [`guard`] - Candidate SQL checks
//! - [`repository`] - Record persistence
//! - [`connection`] - Connection records and resolution
//! - [`generation`] - Prompts, generation records and the pipeline
//! - [`config`] - Configuration resolution
//! - [`output`] - JSON output envelopes

pub mod cache;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod generation;
pub mod guard;
pub mod output;
pub mod pool;
pub mod repository;
pub mod uri;
pub mod vault;

pub use cache::EnginePoolCache;
pub use config::{AppConfig, ConfigLayer};
pub use connection::{ConnectionService, ConnectionUpdate, DatabaseConnection, Metadata};
pub use dialect::{dialect_of, normalize_driver, Dialect};
pub use engine::{Engine, EngineHandle, ExecutionLimits, QueryResult};
pub use error::{BuildStage, QueryGateError, Result};
pub use generation::{
    create_prompt, list_generations, AgentResponse, ConnectionContext, FixedSqlAgent,
    GenerationStatus, LlmConfig, Prompt, SqlAgent, SqlGeneration, SqlGenerationPipeline,
    SqlGenerationRequest,
};
pub use guard::check_candidate;
pub use output::{ConnectionSummary, ErrorEnvelope, ErrorInfo, Meta, SuccessEnvelope};
pub use pool::{PoolPolicy, PoolStats};
pub use repository::{JsonFileRepository, MemoryRepository, Repository, RepositoryExt};
pub use uri::{extract, UriParameters};
pub use vault::CredentialVault;
