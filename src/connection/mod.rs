//! Connection Service
//!
//! Stored connection records and the path from a record to a ready-to-query
//! engine.
//!
//! # Resolution
//! `resolve` runs four stages, each failure wrapped as `ConnectionBuild`
//! with the connection id, the stored dialect and the failing stage:
//! 1. `decrypt`: open the stored ciphertext with the vault
//! 2. `dialect`: derive the dialect from the plaintext and check it against
//!    the stored tag (`DataIntegrity` on mismatch)
//! 3. `normalize`: rewrite the driver segment
//! 4. `connect`: get or build the pooled engine through the cache
//!
//! The plaintext URI lives only for the duration of one `resolve` call and is
//! never logged or persisted. Records hold ciphertext only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::EnginePoolCache;
use crate::dialect::{dialect_of, normalize_driver, split_scheme, Dialect};
use crate::engine::{Engine, EngineHandle, ExecutionLimits, QueryResult};
use crate::error::{BuildStage, QueryGateError, Result};
use crate::repository::{Document, Repository, RepositoryExt, CONNECTIONS};
use crate::uri;
use crate::vault::CredentialVault;

/// Free-form metadata attached to records
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A registered database connection (URI encrypted at rest)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConnection {
    pub id: String,
    pub alias: String,
    pub dialect: Dialect,
    /// Vault ciphertext of the connection URI
    pub connection_uri: String,
    /// Accessible schema names, in order
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Document for DatabaseConnection {
    const COLLECTION: &'static str = CONNECTIONS;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Partial update of a connection; absent fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub alias: Option<String>,
    /// New plaintext URI
    pub connection_uri: Option<String>,
    pub schemas: Option<Vec<String>>,
    pub metadata: Option<Metadata>,
}

impl ConnectionUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alias.is_none()
            && self.connection_uri.is_none()
            && self.schemas.is_none()
            && self.metadata.is_none()
    }
}

/// Check that a plaintext URI can be turned into an engine, without connecting
///
/// File-backed CSV URIs are opaque paths; every other dialect must parse.
pub fn validate_uri(plaintext: &str) -> Result<Dialect> {
    let dialect = dialect_of(plaintext)?;

    if dialect == Dialect::Csv {
        let (_, path) = split_scheme(plaintext)?;
        if path.is_empty() {
            return Err(QueryGateError::malformed_uri("CSV URI requires a file or directory path"));
        }
    } else {
        uri::extract(plaintext)?;
    }

    Ok(dialect)
}

/// Registers connections and resolves them to cached engines
pub struct ConnectionService {
    repository: Arc<dyn Repository>,
    vault: Arc<CredentialVault>,
    cache: Arc<EnginePoolCache>,
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService").field("cache", &self.cache).finish_non_exhaustive()
    }
}

impl ConnectionService {
    pub fn new(
        repository: Arc<dyn Repository>,
        vault: Arc<CredentialVault>,
        cache: Arc<EnginePoolCache>,
    ) -> Self {
        Self { repository, vault, cache }
    }

    #[must_use]
    pub fn cache(&self) -> &EnginePoolCache {
        &self.cache
    }

    /// Validate, encrypt and store a new connection
    ///
    /// The dialect is computed from the plaintext before encryption. No
    /// network connection is attempted.
    #[tracing::instrument(skip(self, plaintext_uri, metadata))]
    pub async fn register(
        &self,
        alias: &str,
        plaintext_uri: &str,
        schemas: Vec<String>,
        metadata: Metadata,
    ) -> Result<DatabaseConnection> {
        if alias.trim().is_empty() {
            return Err(QueryGateError::invalid_input("Connection alias must not be empty"));
        }

        let dialect = validate_uri(plaintext_uri)?;

        let connection = DatabaseConnection {
            id: uuid::Uuid::new_v4().to_string(),
            alias: alias.to_string(),
            dialect,
            connection_uri: self.vault.encrypt(plaintext_uri)?,
            schemas,
            metadata,
            created_at: Utc::now(),
        };

        self.repository.put(&connection).await?;
        tracing::info!(connection_id = %connection.id, %dialect, "connection registered");

        Ok(connection)
    }

    pub async fn get(&self, id: &str) -> Result<DatabaseConnection> {
        self.repository.get(id).await
    }

    /// All connections, oldest first
    pub async fn list(&self) -> Result<Vec<DatabaseConnection>> {
        let mut connections: Vec<DatabaseConnection> = self.repository.list().await?;
        connections.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(connections)
    }

    /// Apply an update; a new URI re-derives the dialect and evicts the cached engine
    #[tracing::instrument(skip(self, update), fields(uri_changed = update.connection_uri.is_some()))]
    pub async fn update(&self, id: &str, update: ConnectionUpdate) -> Result<DatabaseConnection> {
        if update.is_empty() {
            return Err(QueryGateError::invalid_input("Nothing to update"));
        }

        let mut connection = self.get(id).await?;

        if let Some(alias) = update.alias {
            if alias.trim().is_empty() {
                return Err(QueryGateError::invalid_input("Connection alias must not be empty"));
            }
            connection.alias = alias;
        }
        if let Some(schemas) = update.schemas {
            connection.schemas = schemas;
        }
        if let Some(metadata) = update.metadata {
            connection.metadata = metadata;
        }

        let uri_changed = match update.connection_uri {
            Some(plaintext) => {
                connection.dialect = validate_uri(&plaintext)?;
                connection.connection_uri = self.vault.encrypt(&plaintext)?;
                true
            }
            None => false,
        };

        self.repository.replace(&connection).await?;

        if uri_changed {
            self.cache.invalidate(id).await;
        }

        Ok(connection)
    }

    /// Evict the cached engine and delete the record
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.repository.delete(CONNECTIONS, id).await? {
            return Err(QueryGateError::not_found(CONNECTIONS, id));
        }
        self.cache.invalidate(id).await;
        Ok(())
    }

    /// Produce a live engine for a stored connection
    #[tracing::instrument(
        skip(self, connection),
        fields(connection_id = %connection.id, dialect = %connection.dialect)
    )]
    pub async fn resolve(&self, connection: &DatabaseConnection) -> Result<EngineHandle> {
        if let Some(engine) = self.cache.get(&connection.id) {
            return Ok(engine);
        }

        let wrap = |stage: BuildStage, e: QueryGateError| {
            tracing::warn!(%stage, code = e.error_code(), "connection resolve failed");
            QueryGateError::connection_build(
                connection.id.as_str(),
                connection.dialect.as_str(),
                stage,
                e.message(),
            )
        };

        let plaintext = self
            .vault
            .decrypt(&connection.connection_uri)
            .map_err(|e| wrap(BuildStage::Decrypt, e))?;

        let dialect = dialect_of(&plaintext).map_err(|e| wrap(BuildStage::Dialect, e))?;
        if dialect != connection.dialect {
            return Err(wrap(
                BuildStage::Dialect,
                QueryGateError::data_integrity(format!(
                    "stored dialect '{}' does not match URI dialect '{dialect}'",
                    connection.dialect
                )),
            ));
        }

        let normalized = normalize_driver(&plaintext).map_err(|e| wrap(BuildStage::Normalize, e))?;
        drop(plaintext);

        self.cache
            .get_or_create(&connection.id, || async move {
                Engine::connect(dialect, &normalized).await.map_err(|e| wrap(BuildStage::Connect, e))
            })
            .await
    }

    pub async fn resolve_by_id(&self, id: &str) -> Result<EngineHandle> {
        let connection = self.get(id).await?;
        self.resolve(&connection).await
    }

    /// Resolve the engine and run one statement on it
    pub async fn execute(
        &self,
        connection: &DatabaseConnection,
        sql: &str,
        limits: &ExecutionLimits,
    ) -> Result<QueryResult> {
        let engine = self.resolve(connection).await?;
        engine.execute(sql, limits).await
    }
}
