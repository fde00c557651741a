//! Engine Pool Cache
//!
//! Concurrency-safe mapping from connection id to a live pooled engine.
//!
//! # Guarantees
//! - At most one engine is built per connection id at a time: concurrent
//!   callers for the same id wait on a shared per-id cell, the first build
//!   runs and every caller observes its handle
//! - Builds for different ids proceed in parallel; the map lock is held only
//!   to look up or insert the cell, never across a build
//! - A build that fails or is cancelled leaves no visible entry
//! - Eviction is explicit (`invalidate`), never automatic
//!
//! An `invalidate` that races an in-flight build removes the pending cell;
//! the builder still returns its engine to its own caller, but it is not
//! cached and is released when that caller drops it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::engine::{Engine, EngineHandle};
use crate::error::{QueryGateError, Result};

type Slot = Arc<OnceCell<EngineHandle>>;

/// Process-wide cache of pooled engines, keyed by connection id
#[derive(Default)]
pub struct EnginePoolCache {
    entries: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for EnginePoolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePoolCache").field("engines", &self.len()).finish()
    }
}

impl EnginePoolCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached engine for `connection_id`, building it with `build` if absent
    ///
    /// `build` is not invoked when a live entry exists or when a concurrent
    /// caller's build for the same id succeeds first.
    #[tracing::instrument(skip(self, build), fields(connection_id = %connection_id))]
    pub async fn get_or_create<F, Fut>(&self, connection_id: &str, build: F) -> Result<EngineHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Engine>>,
    {
        let slot = {
            let mut entries = self.entries.lock();
            Arc::clone(entries.entry(connection_id.to_string()).or_default())
        };

        let built = slot
            .get_or_try_init(|| async {
                tracing::debug!("building engine");
                let engine = build().await?;
                tracing::info!(dialect = %engine.dialect(), "engine cached");
                Ok::<_, QueryGateError>(Arc::new(engine))
            })
            .await;

        match built {
            Ok(handle) => Ok(Arc::clone(handle)),
            Err(e) => {
                self.discard_pending(connection_id, &slot);
                Err(e)
            }
        }
    }

    /// Drop an uninitialized cell so a failed build leaves no entry behind
    ///
    /// The cell stays mapped while another caller still holds it: that caller
    /// is waiting to run its own build into this cell, and its engine must
    /// land in the map.
    fn discard_pending(&self, connection_id: &str, slot: &Slot) {
        let mut entries = self.entries.lock();
        let pending = entries.get(connection_id).is_some_and(|current| {
            // map + this caller
            Arc::ptr_eq(current, slot) && !current.initialized() && Arc::strong_count(current) == 2
        });
        if pending {
            entries.remove(connection_id);
        }
    }

    /// Cached engine for `connection_id`, if one is live
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<EngineHandle> {
        self.entries.lock().get(connection_id).and_then(|slot| slot.get().cloned())
    }

    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.get(connection_id).is_some()
    }

    /// Number of live engines
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().values().filter(|slot| slot.initialized()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict and dispose the engine for `connection_id`
    ///
    /// Returns whether a live engine was evicted. The next `get_or_create`
    /// for this id always builds a new engine.
    #[tracing::instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn invalidate(&self, connection_id: &str) -> bool {
        let slot = self.entries.lock().remove(connection_id);

        match slot.and_then(|slot| slot.get().cloned()) {
            Some(engine) => {
                engine.dispose().await;
                tracing::info!(dialect = %engine.dialect(), "engine evicted");
                true
            }
            None => false,
        }
    }

    /// Evict and dispose every engine (shutdown)
    pub async fn invalidate_all(&self) -> usize {
        let slots: Vec<Slot> = self.entries.lock().drain().map(|(_, slot)| slot).collect();

        let mut disposed = 0;
        for engine in slots.iter().filter_map(|slot| slot.get()) {
            engine.dispose().await;
            disposed += 1;
        }

        tracing::info!(disposed, "engine cache cleared");
        disposed
    }
}
