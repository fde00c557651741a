//! End-to-End Pipeline Tests
//!
//! Runs the full path (register connection → store prompt → generate →
//! execute → classify → persist) against real `SQLite` files and CSV
//! directories. It validates:
//! - Working SQL is recorded as `VALID` with its row count
//! - SQL the database rejects is `INVALID`, never `ERROR`
//! - Unreachable connections are `ERROR` with the connection failure kept
//! - Missing connections fail as not-found before the agent is called
//! - Concurrent generations share one cached engine

#![cfg(feature = "sqlite")]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use querygate::{
    create_prompt, list_generations, AgentResponse, ConnectionContext, ConnectionService,
    CredentialVault, EnginePoolCache, ExecutionLimits, GenerationStatus, JsonFileRepository,
    LlmConfig, Metadata, Prompt, QueryGateError, Repository, SqlAgent, SqlGenerationPipeline,
    SqlGenerationRequest,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Create an e-commerce `SQLite` database with sample data
fn create_ecommerce_db(dir: &Path) -> PathBuf {
    let path = dir.join("ecommerce.db");
    let conn = rusqlite::Connection::open(&path).expect("Failed to create database");

    conn.execute_batch(
        "CREATE TABLE customers (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             email TEXT,
             country TEXT
         );
         CREATE TABLE products (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             price REAL NOT NULL
         );
         CREATE TABLE orders (
             id INTEGER PRIMARY KEY,
             customer_id INTEGER NOT NULL REFERENCES customers(id),
             created_at TEXT NOT NULL
         );
         CREATE TABLE order_items (
             order_id INTEGER NOT NULL REFERENCES orders(id),
             product_id INTEGER NOT NULL REFERENCES products(id),
             quantity INTEGER NOT NULL
         );

         INSERT INTO customers VALUES
             (1, 'Alice', 'alice@example.com', 'DE'),
             (2, 'Bob', 'bob@example.com', 'US'),
             (3, 'Charlie', NULL, 'US');
         INSERT INTO products VALUES
             (1, 'Keyboard', 49.5),
             (2, 'Monitor', 199.0),
             (3, 'Cable', 5.0);
         INSERT INTO orders VALUES
             (10, 1, '2024-01-05'),
             (11, 2, '2024-01-07'),
             (12, 1, '2024-02-01');
         INSERT INTO order_items VALUES
             (10, 1, 1), (10, 3, 2),
             (11, 2, 1),
             (12, 3, 4);",
    )
    .expect("Failed to seed database");

    path
}

fn sqlite_uri(path: &Path) -> String {
    format!("sqlite:///{}", path.display())
}

/// Agent answering every prompt with fixed SQL, counting its calls
struct CountingAgent {
    sql: Option<String>,
    calls: AtomicUsize,
}

impl CountingAgent {
    fn new(sql: &str) -> Arc<Self> {
        Arc::new(Self { sql: Some(sql.to_string()), calls: AtomicUsize::new(0) })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlAgent for CountingAgent {
    async fn generate(
        &self,
        _prompt_text: &str,
        _context: &ConnectionContext,
        _llm_config: &LlmConfig,
    ) -> querygate::Result<AgentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AgentResponse { sql: self.sql.clone(), input_tokens: 512, output_tokens: 48 })
    }
}

struct Harness {
    dir: tempfile::TempDir,
    repository: Arc<JsonFileRepository>,
    connections: Arc<ConnectionService>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repository = Arc::new(JsonFileRepository::new(dir.path().join("store.json")));
        let key = CredentialVault::generate_key().expect("Failed to generate key");
        let connections = Arc::new(ConnectionService::new(
            repository.clone(),
            Arc::new(CredentialVault::from_base64_key(&key).expect("Invalid key")),
            Arc::new(EnginePoolCache::new()),
        ));
        Self { dir, repository, connections }
    }

    fn pipeline(&self, agent: Arc<dyn SqlAgent>) -> SqlGenerationPipeline {
        SqlGenerationPipeline::new(self.repository.clone(), self.connections.clone(), agent)
            .with_limits(ExecutionLimits::new(Some(1000), Some(5_000)))
    }

    async fn prompt(&self, uri: &str, text: &str) -> Prompt {
        let connection = self
            .connections
            .register("ecommerce", uri, vec!["main".to_string()], Metadata::new())
            .await
            .expect("Failed to register connection");
        create_prompt(self.repository.as_ref(), text, &connection.id, vec![], Metadata::new())
            .await
            .expect("Failed to create prompt")
    }

    async fn ecommerce_prompt(&self, text: &str) -> Prompt {
        let db = create_ecommerce_db(self.dir.path());
        self.prompt(&sqlite_uri(&db), text).await
    }
}

// ============================================================================
// Terminal Status Tests
// ============================================================================

#[tokio::test]
async fn test_revenue_per_customer_is_valid() {
    let harness = Harness::new();
    let prompt = harness.ecommerce_prompt("Revenue per customer").await;
    let agent = CountingAgent::new(
        "```sql
SELECT c.name, SUM(p.price * oi.quantity) AS revenue
FROM customers c
JOIN orders o ON o.customer_id = c.id
JOIN order_items oi ON oi.order_id = o.id
JOIN products p ON p.id = oi.product_id
GROUP BY c.name
ORDER BY revenue DESC;
```",
    );

    let generation = harness
        .pipeline(agent.clone())
        .generate_and_store(&prompt.id, SqlGenerationRequest::default())
        .await
        .unwrap();

    assert_eq!(generation.status, GenerationStatus::Valid);
    assert_eq!(generation.row_count, Some(2));
    assert_eq!(generation.input_tokens_used, 512);
    assert_eq!(generation.output_tokens_used, 48);
    assert!(generation.sql.as_deref().unwrap().starts_with("SELECT c.name"));
    assert!(!generation.sql.as_deref().unwrap().ends_with(';'));
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn test_missing_table_is_invalid() {
    let harness = Harness::new();
    let prompt = harness.ecommerce_prompt("List invoices").await;

    let generation = harness
        .pipeline(CountingAgent::new("SELECT * FROM invoices"))
        .generate(&prompt.id, SqlGenerationRequest::default())
        .await
        .unwrap();

    assert_eq!(generation.status, GenerationStatus::Invalid);
    assert!(generation.error.as_deref().unwrap().contains("no such table: invoices"));
}

#[tokio::test]
async fn test_wrong_dialect_syntax_is_invalid_not_error() {
    let harness = Harness::new();
    let prompt = harness.ecommerce_prompt("Top two products").await;

    // SQL Server syntax does not parse on SQLite
    let generation = harness
        .pipeline(CountingAgent::new("SELECT TOP 2 name FROM products ORDER BY price DESC"))
        .generate(&prompt.id, SqlGenerationRequest::default())
        .await
        .unwrap();

    assert_eq!(generation.status, GenerationStatus::Invalid);
    assert_eq!(generation.error_code.as_deref(), Some("EXECUTION_ERROR"));
}

#[tokio::test]
async fn test_write_candidate_is_invalid_and_database_untouched() {
    let harness = Harness::new();
    let prompt = harness.ecommerce_prompt("Remove cheap products").await;

    let generation = harness
        .pipeline(CountingAgent::new("DELETE FROM products WHERE price < 10"))
        .generate(&prompt.id, SqlGenerationRequest::default())
        .await
        .unwrap();

    assert_eq!(generation.status, GenerationStatus::Invalid);
    assert!(generation.error.as_deref().unwrap().contains("unsafe statement"));

    let conn = rusqlite::Connection::open(harness.dir.path().join("ecommerce.db")).unwrap();
    let count: i64 = conn.query_row("SELECT count(*) FROM products", [], |r| r.get(0)).unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_unreachable_connection_is_error_with_cause() {
    let harness = Harness::new();
    let prompt = harness
        .prompt("sqlite:////nonexistent-querygate-dir/deep/shop.db", "Count customers")
        .await;
    let agent = CountingAgent::new("SELECT count(*) FROM customers");

    let generation =
        harness.pipeline(agent.clone()).generate(&prompt.id, SqlGenerationRequest::default()).await.unwrap();

    assert_eq!(generation.status, GenerationStatus::Error);
    assert_eq!(generation.error_code.as_deref(), Some("CONNECTION_BUILD_ERROR"));
    let error = generation.error.unwrap();
    assert!(error.contains(&prompt.db_connection_id));
    assert!(error.contains("at connect"));
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn test_missing_connection_is_not_found_before_agent_call() {
    let harness = Harness::new();
    let prompt = harness.ecommerce_prompt("Count orders").await;
    harness.connections.delete(&prompt.db_connection_id).await.unwrap();
    let agent = CountingAgent::new("SELECT count(*) FROM orders");

    let err = harness
        .pipeline(agent.clone())
        .generate(&prompt.id, SqlGenerationRequest::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QueryGateError::NotFound { .. }));
    assert_eq!(agent.calls(), 0);
}

// ============================================================================
// Persistence and Sharing
// ============================================================================

#[tokio::test]
async fn test_records_survive_reopening_store() {
    let harness = Harness::new();
    let prompt = harness.ecommerce_prompt("Customers in the US").await;
    let pipeline = harness.pipeline(CountingAgent::new("SELECT name FROM customers WHERE country = 'US'"));

    let generation = pipeline.generate_and_store(&prompt.id, SqlGenerationRequest::default()).await.unwrap();

    let reopened = JsonFileRepository::new(harness.dir.path().join("store.json"));
    let stored = list_generations(&reopened, Some(&prompt.id)).await.unwrap();
    assert_eq!(stored, vec![generation]);

    let raw = std::fs::read_to_string(reopened.path()).unwrap();
    assert!(!raw.contains("ecommerce.db"), "store must hold ciphertext only");
}

#[tokio::test]
async fn test_concurrent_generations_share_one_engine() {
    let harness = Harness::new();
    let prompt = harness.ecommerce_prompt("Product count").await;
    let pipeline = Arc::new(harness.pipeline(CountingAgent::new("SELECT count(*) FROM products")));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let prompt_id = prompt.id.clone();
            tokio::spawn(async move { pipeline.generate(&prompt_id, SqlGenerationRequest::default()).await })
        })
        .collect();

    for task in tasks {
        let generation = task.await.unwrap().unwrap();
        assert_eq!(generation.status, GenerationStatus::Valid);
    }

    assert_eq!(harness.connections.cache().len(), 1);
    let engine = harness.connections.cache().get(&prompt.db_connection_id).unwrap();
    assert!(engine.stats().size <= engine.policy().max_connections());
}

#[tokio::test]
async fn test_csv_directory_connection() {
    let harness = Harness::new();
    let exports = harness.dir.path().join("exports");
    std::fs::create_dir_all(&exports).unwrap();
    std::fs::write(exports.join("products.csv"), "id,name,price\n1,Keyboard,49.5\n2,Monitor,199\n").unwrap();
    std::fs::write(exports.join("stock.csv"), "product_id,warehouse,units\n1,Berlin,12\n2,Austin,0\n").unwrap();

    let prompt = harness.prompt(&format!("csv://{}", exports.display()), "Products in stock").await;
    let generation = harness
        .pipeline(CountingAgent::new(
            "SELECT p.name FROM products p JOIN stock s ON s.product_id = p.id WHERE s.units > 0",
        ))
        .generate(&prompt.id, SqlGenerationRequest::default())
        .await
        .unwrap();

    assert_eq!(generation.status, GenerationStatus::Valid);
    assert_eq!(generation.row_count, Some(1));
}

#[tokio::test]
async fn test_repository_trait_object() {
    let harness = Harness::new();
    let prompt = harness.ecommerce_prompt("Anything").await;

    let repository: Arc<dyn Repository> = harness.repository.clone();
    let prompts = repository.find_all("prompts").await.unwrap();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0]["id"], prompt.id.as_str());
}
