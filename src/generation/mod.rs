//! SQL Generation Pipeline
//!
//! Turns a stored prompt into a status-tagged SQL generation record:
//! load prompt and connection, resolve the engine, ask the agent for
//! candidate SQL, guard it, execute it, classify the outcome.
//!
//! # States
//! `INITIALIZED` → `VALID` | `INVALID` | `ERROR`
//!
//! - `VALID`: the candidate executed successfully
//! - `INVALID`: the agent answered incorrectly (empty, unsafe or rejected by
//!   the database). Retrying generation may help.
//! - `ERROR`: infrastructure failed (engine resolution, pool, timeout, lost
//!   connection, agent call). Retrying generation will not help.
//!
//! A missing prompt or connection is returned as `NotFound` before any agent
//! call is made. Every other failure becomes a terminal record; the pipeline
//! never returns a record left in `INITIALIZED`.

mod agent;

pub use agent::{AgentResponse, ConnectionContext, FixedSqlAgent, SqlAgent};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::connection::{ConnectionService, DatabaseConnection, Metadata};
use crate::engine::{ExecutionLimits, QueryResult};
use crate::error::{QueryGateError, Result};
use crate::guard;
use crate::repository::{Document, Repository, RepositoryExt, GENERATIONS, PROMPTS};

/// Default model recorded when the caller does not choose one
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Natural-language prompt bound to one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub text: String,
    pub db_connection_id: String,
    /// Schemas to consider; empty means the connection's schemas
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Document for Prompt {
    const COLLECTION: &'static str = PROMPTS;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Model name and generation parameters, echoed on every record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self { model_name: DEFAULT_MODEL.to_string(), api_base: None, temperature: 0.0, max_tokens: None }
    }
}

/// Caller-supplied options for one generation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlGenerationRequest {
    #[serde(default)]
    pub llm_config: LlmConfig,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Status of a generation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GenerationStatus {
    Initialized,
    Valid,
    Invalid,
    Error,
}

impl GenerationStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
            Self::Error => "ERROR",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initialized)
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes that mean "the candidate was wrong"; every other failure is `ERROR`
const INVALID_CODES: &[&str] = &["EXECUTION_ERROR", "CANDIDATE_REJECTED"];

/// Terminal status for a failed generation
#[must_use]
pub fn classify(error: &QueryGateError) -> GenerationStatus {
    if INVALID_CODES.contains(&error.error_code()) {
        GenerationStatus::Invalid
    } else {
        GenerationStatus::Error
    }
}

/// One generation attempt and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlGeneration {
    pub id: String,
    pub prompt_id: String,
    /// Candidate text as executed (or as refused)
    pub sql: Option<String>,
    pub status: GenerationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub input_tokens_used: u64,
    pub output_tokens_used: u64,
    pub llm_config: LlmConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Document for SqlGeneration {
    const COLLECTION: &'static str = GENERATIONS;

    fn id(&self) -> &str {
        &self.id
    }
}

impl SqlGeneration {
    fn new(prompt: &Prompt, request: SqlGenerationRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt_id: prompt.id.clone(),
            sql: None,
            status: GenerationStatus::Initialized,
            error: None,
            error_code: None,
            input_tokens_used: 0,
            output_tokens_used: 0,
            llm_config: request.llm_config,
            row_count: None,
            execution_ms: None,
            metadata: request.metadata,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// The single status-setting step
    fn finish(&mut self, outcome: Result<QueryResult>) {
        match outcome {
            Ok(result) => {
                self.status = GenerationStatus::Valid;
                self.row_count = Some(result.row_count());
                self.execution_ms = Some(result.execution_ms);
            }
            Err(e) => {
                self.status = classify(&e);
                self.error_code = Some(e.error_code().to_string());
                self.error = Some(e.message());
            }
        }
        self.completed_at = Some(Utc::now());
    }
}

/// Generate → guard → execute → classify
pub struct SqlGenerationPipeline {
    repository: Arc<dyn Repository>,
    connections: Arc<ConnectionService>,
    agent: Arc<dyn SqlAgent>,
    limits: ExecutionLimits,
}

impl fmt::Debug for SqlGenerationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlGenerationPipeline").field("limits", &self.limits).finish_non_exhaustive()
    }
}

impl SqlGenerationPipeline {
    pub fn new(
        repository: Arc<dyn Repository>,
        connections: Arc<ConnectionService>,
        agent: Arc<dyn SqlAgent>,
    ) -> Self {
        Self { repository, connections, agent, limits: ExecutionLimits::default() }
    }

    /// Row and statement-time limits applied to every candidate
    #[must_use]
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Run one generation for `prompt_id` and return its terminal record
    ///
    /// The record is not persisted; see [`Self::generate_and_store`].
    #[tracing::instrument(skip(self, request), fields(model = %request.llm_config.model_name))]
    pub async fn generate(&self, prompt_id: &str, request: SqlGenerationRequest) -> Result<SqlGeneration> {
        let prompt: Prompt = self.repository.get(prompt_id).await?;
        let connection: DatabaseConnection = self.connections.get(&prompt.db_connection_id).await?;

        let mut generation = SqlGeneration::new(&prompt, request);
        let outcome = self.run(&prompt, &connection, &mut generation).await;
        generation.finish(outcome);

        tracing::info!(
            generation_id = %generation.id,
            connection_id = %connection.id,
            status = %generation.status,
            "generation finished"
        );

        Ok(generation)
    }

    /// Run one generation and insert the record into the repository
    pub async fn generate_and_store(
        &self,
        prompt_id: &str,
        request: SqlGenerationRequest,
    ) -> Result<SqlGeneration> {
        let generation = self.generate(prompt_id, request).await?;
        self.repository.put(&generation).await?;
        Ok(generation)
    }

    async fn run(
        &self,
        prompt: &Prompt,
        connection: &DatabaseConnection,
        generation: &mut SqlGeneration,
    ) -> Result<QueryResult> {
        let engine = self.connections.resolve(connection).await?;

        let context = ConnectionContext::for_prompt(connection, prompt);
        let response = self
            .agent
            .generate(&prompt.text, &context, &generation.llm_config)
            .await
            .map_err(as_agent_error)?;

        generation.input_tokens_used = response.input_tokens;
        generation.output_tokens_used = response.output_tokens;

        let raw = response.sql.unwrap_or_default();
        if !raw.trim().is_empty() {
            generation.sql = Some(raw.trim().to_string());
        }

        let candidate = guard::check_candidate(&raw, engine.dialect())?;
        tracing::debug!(candidate_len = candidate.len(), "executing candidate");
        generation.sql = Some(candidate.clone());

        engine.execute(&candidate, &self.limits).await
    }
}

/// Anything the agent raises is an agent failure, whatever its kind
fn as_agent_error(error: QueryGateError) -> QueryGateError {
    match error {
        QueryGateError::Agent(_) => error,
        other => QueryGateError::agent(other.message()),
    }
}

/// Store a new prompt for an existing connection
pub async fn create_prompt(
    repository: &dyn Repository,
    text: &str,
    connection_id: &str,
    schemas: Vec<String>,
    metadata: Metadata,
) -> Result<Prompt> {
    if text.trim().is_empty() {
        return Err(QueryGateError::invalid_input("Prompt text must not be empty"));
    }

    let connection: DatabaseConnection = repository.get(connection_id).await?;

    let prompt = Prompt {
        id: uuid::Uuid::new_v4().to_string(),
        text: text.to_string(),
        db_connection_id: connection.id,
        schemas,
        metadata,
        created_at: Utc::now(),
    };

    repository.put(&prompt).await?;
    Ok(prompt)
}

/// Stored generations, oldest first, optionally for one prompt
pub async fn list_generations(
    repository: &dyn Repository,
    prompt_id: Option<&str>,
) -> Result<Vec<SqlGeneration>> {
    let mut generations: Vec<SqlGeneration> = match prompt_id {
        Some(id) => repository.list_where(&|doc| doc["prompt_id"] == id).await?,
        None => repository.list().await?,
    };
    generations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(generations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EnginePoolCache;
    use crate::repository::MemoryRepository;
    use crate::vault::CredentialVault;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Answer(Option<&'static str>),
        Fail,
    }

    /// Agent with a fixed answer that counts its calls
    struct ScriptedAgent {
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedAgent {
        fn answering(sql: &'static str) -> Arc<Self> {
            Arc::new(Self { script: Script::Answer(Some(sql)), calls: AtomicUsize::new(0) })
        }

        fn with(script: Script) -> Arc<Self> {
            Arc::new(Self { script, calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SqlAgent for ScriptedAgent {
        async fn generate(
            &self,
            _prompt_text: &str,
            _context: &ConnectionContext,
            _llm_config: &LlmConfig,
        ) -> Result<AgentResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Answer(sql) => Ok(AgentResponse {
                    sql: sql.map(str::to_string),
                    input_tokens: 120,
                    output_tokens: 14,
                }),
                Script::Fail => Err(QueryGateError::agent("provider timed out")),
            }
        }
    }

    struct Fixture {
        repository: Arc<MemoryRepository>,
        connections: Arc<ConnectionService>,
    }

    impl Fixture {
        fn new() -> Self {
            let repository = Arc::new(MemoryRepository::new());
            let key = CredentialVault::generate_key().unwrap();
            let connections = Arc::new(ConnectionService::new(
                repository.clone(),
                Arc::new(CredentialVault::from_base64_key(&key).unwrap()),
                Arc::new(EnginePoolCache::new()),
            ));
            Self { repository, connections }
        }

        fn pipeline(&self, agent: Arc<dyn SqlAgent>) -> SqlGenerationPipeline {
            SqlGenerationPipeline::new(self.repository.clone(), self.connections.clone(), agent)
        }

        async fn prompt_for(&self, uri: &str) -> Prompt {
            let connection =
                self.connections.register("test", uri, vec![], Metadata::new()).await.unwrap();
            create_prompt(self.repository.as_ref(), "how many customers?", &connection.id, vec![], Metadata::new())
                .await
                .unwrap()
        }
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(classify(&QueryGateError::execution("syntax error")), GenerationStatus::Invalid);
        assert_eq!(classify(&QueryGateError::rejected("unsafe statement")), GenerationStatus::Invalid);
        assert_eq!(classify(&QueryGateError::agent("down")), GenerationStatus::Error);
        assert_eq!(classify(&QueryGateError::statement_timeout("slow")), GenerationStatus::Error);
        assert_eq!(classify(&QueryGateError::pool_timeout("busy")), GenerationStatus::Error);
        assert_eq!(classify(&QueryGateError::connection_lost("reset")), GenerationStatus::Error);
        assert_eq!(
            classify(&QueryGateError::connection_build(
                "c1",
                "mysql",
                crate::error::BuildStage::Connect,
                "refused"
            )),
            GenerationStatus::Error
        );
    }

    #[test]
    fn test_status_vocabulary() {
        assert_eq!(serde_json::to_string(&GenerationStatus::Initialized).unwrap(), r#""INITIALIZED""#);
        assert_eq!(serde_json::to_string(&GenerationStatus::Valid).unwrap(), r#""VALID""#);
        assert_eq!(GenerationStatus::Invalid.to_string(), "INVALID");
        assert!(GenerationStatus::Error.is_terminal());
        assert!(!GenerationStatus::Initialized.is_terminal());
    }

    #[test]
    fn test_llm_config_defaults() {
        let config = LlmConfig::default();
        assert_eq!(config.model_name, "gpt-4o-mini");
        assert!(config.temperature.abs() < f64::EPSILON);

        let request: SqlGenerationRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.llm_config, config);
    }

    #[tokio::test]
    async fn test_unknown_prompt_is_not_found() {
        let fixture = Fixture::new();
        let agent = ScriptedAgent::answering("SELECT 1");

        let err = fixture
            .pipeline(agent.clone())
            .generate("missing", SqlGenerationRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryGateError::NotFound { ref collection, .. } if collection == PROMPTS));
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_found_before_agent_call() {
        let fixture = Fixture::new();
        let prompt = Prompt {
            id: "p1".to_string(),
            text: "list orders".to_string(),
            db_connection_id: "gone".to_string(),
            schemas: vec![],
            metadata: Metadata::new(),
            created_at: Utc::now(),
        };
        fixture.repository.put(&prompt).await.unwrap();
        let agent = ScriptedAgent::answering("SELECT 1");

        let err = fixture
            .pipeline(agent.clone())
            .generate("p1", SqlGenerationRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryGateError::NotFound { ref id, .. } if id == "gone"));
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_create_prompt_requires_connection() {
        let fixture = Fixture::new();
        let err = create_prompt(fixture.repository.as_ref(), "q", "missing", vec![], Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryGateError::NotFound { .. }));

        let err = create_prompt(fixture.repository.as_ref(), "  ", "missing", vec![], Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryGateError::InvalidInput(_)));
    }

    #[cfg(feature = "sqlite")]
    mod sqlite {
        use super::*;
        use pretty_assertions::assert_eq;

        fn shop_database(dir: &tempfile::TempDir) -> String {
            let path = dir.path().join("shop.db");
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 INSERT INTO customers (name) VALUES ('Ada'), ('Grace'), ('Linus');",
            )
            .unwrap();
            format!("sqlite:///{}", path.display())
        }

        async fn run(fixture: &Fixture, uri: &str, agent: Arc<ScriptedAgent>) -> SqlGeneration {
            let prompt = fixture.prompt_for(uri).await;
            fixture.pipeline(agent).generate(&prompt.id, SqlGenerationRequest::default()).await.unwrap()
        }

        #[tokio::test]
        async fn test_valid_generation() {
            let dir = tempfile::tempdir().unwrap();
            let fixture = Fixture::new();
            let agent = ScriptedAgent::answering("```sql\nSELECT name FROM customers ORDER BY id;\n```");

            let generation = run(&fixture, &shop_database(&dir), agent.clone()).await;

            assert_eq!(generation.status, GenerationStatus::Valid);
            assert_eq!(generation.sql.as_deref(), Some("SELECT name FROM customers ORDER BY id"));
            assert_eq!(generation.row_count, Some(3));
            assert_eq!(generation.input_tokens_used, 120);
            assert_eq!(generation.output_tokens_used, 14);
            assert_eq!(generation.llm_config, LlmConfig::default());
            assert!(generation.error.is_none());
            assert!(generation.completed_at.is_some());
            assert_eq!(agent.calls(), 1);
        }

        #[tokio::test]
        async fn test_syntax_error_is_invalid() {
            let dir = tempfile::tempdir().unwrap();
            let fixture = Fixture::new();

            let generation =
                run(&fixture, &shop_database(&dir), ScriptedAgent::answering("SELEC name FROM customers")).await;

            assert_eq!(generation.status, GenerationStatus::Invalid);
            assert_eq!(generation.error_code.as_deref(), Some("EXECUTION_ERROR"));
            assert_eq!(generation.sql.as_deref(), Some("SELEC name FROM customers"));
            assert!(generation.error.unwrap().contains(r#"near "SELEC": syntax error"#));
        }

        #[tokio::test]
        async fn test_missing_table_is_invalid() {
            let dir = tempfile::tempdir().unwrap();
            let fixture = Fixture::new();

            let generation =
                run(&fixture, &shop_database(&dir), ScriptedAgent::answering("SELECT * FROM invoices")).await;

            assert_eq!(generation.status, GenerationStatus::Invalid);
            assert!(generation.error.unwrap().contains("no such table"));
        }

        #[tokio::test]
        async fn test_unsafe_candidate_is_invalid_and_not_executed() {
            let dir = tempfile::tempdir().unwrap();
            let uri = shop_database(&dir);
            let fixture = Fixture::new();

            let generation = run(&fixture, &uri, ScriptedAgent::answering("DELETE FROM customers")).await;

            assert_eq!(generation.status, GenerationStatus::Invalid);
            assert_eq!(generation.error_code.as_deref(), Some("CANDIDATE_REJECTED"));
            assert_eq!(generation.sql.as_deref(), Some("DELETE FROM customers"));

            let conn = rusqlite::Connection::open(dir.path().join("shop.db")).unwrap();
            let remaining: i64 = conn.query_row("SELECT count(*) FROM customers", [], |r| r.get(0)).unwrap();
            assert_eq!(remaining, 3);
        }

        #[tokio::test]
        async fn test_empty_answer_is_invalid() {
            let dir = tempfile::tempdir().unwrap();
            let fixture = Fixture::new();

            let generation = run(&fixture, &shop_database(&dir), ScriptedAgent::with(Script::Answer(None))).await;

            assert_eq!(generation.status, GenerationStatus::Invalid);
            assert!(generation.sql.is_none());
            assert!(generation.error.unwrap().contains("empty candidate"));
        }

        #[tokio::test]
        async fn test_agent_failure_is_error() {
            let dir = tempfile::tempdir().unwrap();
            let fixture = Fixture::new();

            let generation = run(&fixture, &shop_database(&dir), ScriptedAgent::with(Script::Fail)).await;

            assert_eq!(generation.status, GenerationStatus::Error);
            assert_eq!(generation.error_code.as_deref(), Some("AGENT_ERROR"));
        }

        #[tokio::test]
        async fn test_unreachable_connection_is_error() {
            let fixture = Fixture::new();
            let agent = ScriptedAgent::answering("SELECT 1");

            let generation = run(
                &fixture,
                "sqlite:////nonexistent-querygate-dir/sub/db.sqlite",
                agent.clone(),
            )
            .await;

            assert_eq!(generation.status, GenerationStatus::Error);
            assert_eq!(generation.error_code.as_deref(), Some("CONNECTION_BUILD_ERROR"));
            assert!(generation.error.unwrap().contains("at connect"));
            assert_eq!(agent.calls(), 0);
        }

        #[tokio::test]
        async fn test_statement_timeout_is_error() {
            let dir = tempfile::tempdir().unwrap();
            let fixture = Fixture::new();
            let prompt = fixture.prompt_for(&shop_database(&dir)).await;
            let agent = ScriptedAgent::answering(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT count(*) FROM n",
            );

            let generation = fixture
                .pipeline(agent)
                .with_limits(ExecutionLimits::new(None, Some(50)))
                .generate(&prompt.id, SqlGenerationRequest::default())
                .await
                .unwrap();

            assert_eq!(generation.status, GenerationStatus::Error);
            assert_eq!(generation.error_code.as_deref(), Some("STATEMENT_TIMEOUT"));
        }

        #[tokio::test]
        async fn test_generate_and_store() {
            let dir = tempfile::tempdir().unwrap();
            let fixture = Fixture::new();
            let prompt = fixture.prompt_for(&shop_database(&dir)).await;
            let pipeline = fixture.pipeline(ScriptedAgent::answering("SELECT count(*) FROM customers"));

            let first = pipeline.generate_and_store(&prompt.id, SqlGenerationRequest::default()).await.unwrap();
            let second = pipeline.generate_and_store(&prompt.id, SqlGenerationRequest::default()).await.unwrap();

            let stored = list_generations(fixture.repository.as_ref(), Some(&prompt.id)).await.unwrap();
            assert_eq!(stored.len(), 2);
            assert!(stored.iter().any(|g| g.id == first.id));
            assert!(stored.iter().any(|g| g.id == second.id));
            assert!(list_generations(fixture.repository.as_ref(), Some("other")).await.unwrap().is_empty());

            // Both runs share one cached engine
            assert_eq!(fixture.connections.cache().len(), 1);
        }
    }
}
