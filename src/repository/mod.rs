//! Record Repository
//!
//! Generic persistence for connections, prompts and generations. Records are
//! stored as JSON documents addressed by `(collection, id)`; the repository
//! makes no schema assumptions beyond that.
//!
//! # Implementations
//! - [`MemoryRepository`]: process-local, used by tests and embedding callers
//! - [`JsonFileRepository`]: a single pretty-printed JSON file, used by the CLI
//!
//! Typed access goes through [`Document`] and the [`RepositoryExt`] helpers,
//! which serialize with `serde`.

mod json_file;

pub use json_file::JsonFileRepository;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{QueryGateError, Result};

/// Collection holding `DatabaseConnection` records
pub const CONNECTIONS: &str = "database_connections";

/// Collection holding `Prompt` records
pub const PROMPTS: &str = "prompts";

/// Collection holding `SqlGeneration` records
pub const GENERATIONS: &str = "sql_generations";

/// Predicate over stored documents for `find_by`
pub type Predicate<'a> = &'a (dyn Fn(&Value) -> bool + Send + Sync);

/// Id-addressable JSON document store
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Store a new document; fails if the id is already taken
    async fn insert(&self, collection: &str, id: &str, document: Value) -> Result<()>;

    /// Replace an existing document; fails with `NotFound` if absent
    async fn update(&self, collection: &str, id: &str, document: Value) -> Result<()>;

    /// Remove a document, returning whether it existed
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    async fn find_by(&self, collection: &str, predicate: Predicate<'_>) -> Result<Vec<Value>>;

    async fn find_all(&self, collection: &str) -> Result<Vec<Value>> {
        self.find_by(collection, &|_| true).await
    }
}

/// A record type stored in one repository collection
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}

/// Typed helpers over any [`Repository`]
#[async_trait]
pub trait RepositoryExt: Repository {
    /// Load a record, failing with `NotFound` if absent
    async fn get<T: Document>(&self, id: &str) -> Result<T> {
        let document = self
            .find_by_id(T::COLLECTION, id)
            .await?
            .ok_or_else(|| QueryGateError::not_found(T::COLLECTION, id))?;
        from_document(document)
    }

    async fn put<T: Document>(&self, record: &T) -> Result<()> {
        self.insert(T::COLLECTION, record.id(), to_document(record)?).await
    }

    async fn replace<T: Document>(&self, record: &T) -> Result<()> {
        self.update(T::COLLECTION, record.id(), to_document(record)?).await
    }

    async fn list<T: Document>(&self) -> Result<Vec<T>> {
        self.find_all(T::COLLECTION).await?.into_iter().map(from_document).collect()
    }

    async fn list_where<T: Document>(&self, predicate: Predicate<'_>) -> Result<Vec<T>> {
        self.find_by(T::COLLECTION, predicate).await?.into_iter().map(from_document).collect()
    }
}

impl<R: Repository + ?Sized> RepositoryExt for R {}

fn to_document<T: Serialize>(record: &T) -> Result<Value> {
    serde_json::to_value(record)
        .map_err(|e| QueryGateError::storage(format!("Could not serialize record: {e}")))
}

fn from_document<T: DeserializeOwned>(document: Value) -> Result<T> {
    serde_json::from_value(document)
        .map_err(|e| QueryGateError::storage(format!("Stored record has an invalid format: {e}")))
}

/// Documents of every collection, ordered by id within a collection
pub(crate) type Collections = BTreeMap<String, BTreeMap<String, Value>>;

pub(crate) fn insert_into(collections: &mut Collections, collection: &str, id: &str, document: Value) -> Result<()> {
    let documents = collections.entry(collection.to_string()).or_default();
    if documents.contains_key(id) {
        return Err(QueryGateError::storage(format!("{collection} '{id}' already exists")));
    }
    documents.insert(id.to_string(), document);
    Ok(())
}

pub(crate) fn update_in(collections: &mut Collections, collection: &str, id: &str, document: Value) -> Result<()> {
    let slot = collections
        .get_mut(collection)
        .and_then(|documents| documents.get_mut(id))
        .ok_or_else(|| QueryGateError::not_found(collection, id))?;
    *slot = document;
    Ok(())
}

pub(crate) fn delete_from(collections: &mut Collections, collection: &str, id: &str) -> bool {
    collections.get_mut(collection).is_some_and(|documents| documents.remove(id).is_some())
}

pub(crate) fn select(collections: &Collections, collection: &str, predicate: Predicate<'_>) -> Vec<Value> {
    collections
        .get(collection)
        .map(|documents| documents.values().filter(|doc| predicate(doc)).cloned().collect())
        .unwrap_or_default()
}

/// In-process repository
#[derive(Debug, Default)]
pub struct MemoryRepository {
    collections: RwLock<Collections>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.collections.read().get(collection).and_then(|documents| documents.get(id)).cloned())
    }

    async fn insert(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        insert_into(&mut self.collections.write(), collection, id, document)
    }

    async fn update(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        update_in(&mut self.collections.write(), collection, id, document)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(delete_from(&mut self.collections.write(), collection, id))
    }

    async fn find_by(&self, collection: &str, predicate: Predicate<'_>) -> Result<Vec<Value>> {
        Ok(select(&self.collections.read(), collection, predicate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Document for Note {
        const COLLECTION: &'static str = "notes";

        fn id(&self) -> &str {
            &self.id
        }
    }

    fn note(id: &str, body: &str) -> Note {
        Note { id: id.to_string(), body: body.to_string() }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let repo = MemoryRepository::new();
        repo.insert("notes", "n1", json!({"id": "n1", "body": "hello"})).await.unwrap();

        assert_eq!(repo.find_by_id("notes", "n1").await.unwrap(), Some(json!({"id": "n1", "body": "hello"})));
        assert_eq!(repo.find_by_id("notes", "n2").await.unwrap(), None);
        assert_eq!(repo.find_by_id("other", "n1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let repo = MemoryRepository::new();
        repo.put(&note("n1", "a")).await.unwrap();

        let err = repo.put(&note("n1", "b")).await.unwrap_err();
        assert!(matches!(err, QueryGateError::Storage(_)));
        assert_eq!(repo.get::<Note>("n1").await.unwrap().body, "a");
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let repo = MemoryRepository::new();
        let err = repo.replace(&note("n1", "a")).await.unwrap_err();
        assert!(matches!(err, QueryGateError::NotFound { .. }));

        repo.put(&note("n1", "a")).await.unwrap();
        repo.replace(&note("n1", "b")).await.unwrap();
        assert_eq!(repo.get::<Note>("n1").await.unwrap(), note("n1", "b"));
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = MemoryRepository::new();
        repo.put(&note("n1", "a")).await.unwrap();

        assert!(repo.delete("notes", "n1").await.unwrap());
        assert!(!repo.delete("notes", "n1").await.unwrap());
        assert!(matches!(repo.get::<Note>("n1").await, Err(QueryGateError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_find_by_predicate() {
        let repo = MemoryRepository::new();
        for (id, body) in [("n1", "keep"), ("n2", "drop"), ("n3", "keep")] {
            repo.put(&note(id, body)).await.unwrap();
        }

        let kept: Vec<Note> = repo.list_where(&|doc| doc["body"] == "keep").await.unwrap();
        assert_eq!(kept, vec![note("n1", "keep"), note("n3", "keep")]);
        assert_eq!(repo.list::<Note>().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_get_reports_collection() {
        let repo = MemoryRepository::new();
        let err = repo.get::<Note>("missing").await.unwrap_err();
        assert_eq!(err.message(), "notes 'missing' not found");
    }
}
