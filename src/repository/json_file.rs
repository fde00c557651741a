//! JSON file repository
//!
//! All collections live in one pretty-printed file:
//! ```json
//! {
//!   "database_connections": { "<id>": { ... } },
//!   "prompts": { "<id>": { ... } }
//! }
//! ```
//! Every operation reads the file, and writes re-serialize it whole. A
//! missing file is an empty store; parent directories are created on first
//! write.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use super::{delete_from, insert_into, select, update_in, Collections, Predicate, Repository};
use crate::error::{QueryGateError, Result};

/// Repository backed by a single JSON file
#[derive(Debug)]
pub struct JsonFileRepository {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Collections> {
        if !self.path.exists() {
            return Ok(Collections::default());
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| QueryGateError::storage(format!("Could not read store file: {e}")))?;

        if contents.trim().is_empty() {
            return Ok(Collections::default());
        }

        serde_json::from_str(&contents)
            .map_err(|e| QueryGateError::storage(format!("Invalid store file format: {e}")))
    }

    fn save(&self, collections: &Collections) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                QueryGateError::storage(format!("Could not create store directory: {e}"))
            })?;
        }

        let contents = serde_json::to_string_pretty(collections)
            .map_err(|e| QueryGateError::storage(format!("Could not serialize store: {e}")))?;

        fs::write(&self.path, contents)
            .map_err(|e| QueryGateError::storage(format!("Could not write store file: {e}")))
    }

    fn modify<T>(&self, change: impl FnOnce(&mut Collections) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        let mut collections = self.load()?;
        let outcome = change(&mut collections)?;
        self.save(&collections)?;
        Ok(outcome)
    }
}

#[async_trait]
impl Repository for JsonFileRepository {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.get(collection).and_then(|documents| documents.get(id)).cloned())
    }

    async fn insert(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.modify(|collections| insert_into(collections, collection, id, document))
    }

    async fn update(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.modify(|collections| update_in(collections, collection, id, document))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.modify(|collections| Ok(delete_from(collections, collection, id)))
    }

    async fn find_by(&self, collection: &str, predicate: Predicate<'_>) -> Result<Vec<Value>> {
        let _guard = self.lock.lock();
        Ok(select(&self.load()?, collection, predicate))
    }
}
