//! SQL-generating agent seam
//!
//! The completion call itself lives outside this crate. The pipeline only
//! sees [`SqlAgent::generate`], which receives the prompt text plus the
//! connection context and answers with candidate SQL and token counts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{LlmConfig, Prompt};
use crate::connection::{DatabaseConnection, Metadata};
use crate::dialect::Dialect;
use crate::error::Result;

/// What the agent is told about the target database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub alias: String,
    pub dialect: Dialect,
    pub schemas: Vec<String>,
    pub metadata: Metadata,
}

impl ConnectionContext {
    /// Context for a prompt; the prompt's schemas override the connection's when given
    #[must_use]
    pub fn for_prompt(connection: &DatabaseConnection, prompt: &Prompt) -> Self {
        let schemas =
            if prompt.schemas.is_empty() { connection.schemas.clone() } else { prompt.schemas.clone() };

        Self {
            connection_id: connection.id.clone(),
            alias: connection.alias.clone(),
            dialect: connection.dialect,
            schemas,
            metadata: connection.metadata.clone(),
        }
    }
}

/// Candidate SQL and token usage reported by the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// `None` when the agent answered without producing SQL
    pub sql: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// External SQL-generating agent
///
/// Failures to answer (provider down, timeout) are reported as `Agent`
/// errors. Candidate text is untrusted and is validated by the pipeline.
#[async_trait]
pub trait SqlAgent: Send + Sync {
    async fn generate(
        &self,
        prompt_text: &str,
        context: &ConnectionContext,
        llm_config: &LlmConfig,
    ) -> Result<AgentResponse>;
}

/// Agent that answers every prompt with the same caller-supplied SQL
///
/// Lets hand-written SQL go through the same validation and recording path
/// as generated SQL.
#[derive(Debug, Clone)]
pub struct FixedSqlAgent {
    sql: String,
}

impl FixedSqlAgent {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }
}

#[async_trait]
impl SqlAgent for FixedSqlAgent {
    async fn generate(
        &self,
        _prompt_text: &str,
        _context: &ConnectionContext,
        _llm_config: &LlmConfig,
    ) -> Result<AgentResponse> {
        Ok(AgentResponse { sql: Some(self.sql.clone()), input_tokens: 0, output_tokens: 0 })
    }
}
