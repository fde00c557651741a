//! In-process connection doubles for pool, cache and service tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ConnectionFactory, ExecutionLimits, QueryResult, SqlConnection};
use crate::dialect::Dialect;
use crate::error::{QueryGateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Execution,
    ConnectionLost,
    Timeout,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MockBehavior {
    pub connect_fails: bool,
    pub connect_delay: Option<Duration>,
    pub ping_fails: bool,
    pub query_failure: Option<MockFailure>,
}

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    queries: AtomicUsize,
    behavior: Mutex<MockBehavior>,
}

/// Factory whose connections share counters and behavior switches
#[derive(Clone)]
pub struct MockFactory {
    dialect: Dialect,
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::with_dialect(Dialect::Sqlite)
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        Self { dialect, state: Arc::new(MockState::default()) }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.state.behavior.lock() = behavior;
    }

    fn behavior(&self) -> MockBehavior {
        *self.state.behavior.lock()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        let behavior = self.behavior();
        if let Some(delay) = behavior.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if behavior.connect_fails {
            return Err(QueryGateError::connection_lost("connection refused"));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection { state: Arc::clone(&self.state) }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl SqlConnection for MockConnection {
    async fn query(&mut self, _sql: &str, _limits: &ExecutionLimits) -> Result<QueryResult> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.state.behavior.lock();

        match behavior.query_failure {
            Some(MockFailure::Execution) => {
                Err(QueryGateError::execution("syntax error at or near \"SELEC\""))
            }
            Some(MockFailure::ConnectionLost) => {
                Err(QueryGateError::connection_lost("server closed the connection"))
            }
            Some(MockFailure::Timeout) => {
                Err(QueryGateError::statement_timeout("statement exceeded 10ms"))
            }
            None => Ok(QueryResult {
                columns: vec!["result".to_string()],
                rows: vec![vec![serde_json::json!(1)]],
                rows_affected: None,
                execution_ms: 0,
            }),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        if self.state.behavior.lock().ping_fails {
            Err(QueryGateError::connection_lost("ping failed"))
        } else {
            Ok(())
        }
    }

    async fn close(self: Box<Self>) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
