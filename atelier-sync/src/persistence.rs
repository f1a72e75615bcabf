//! Persistence Gateway: best-effort durability for the shared state.
//!
//! Individual writes run inline on the engine task right after the in-memory
//! mutation. The periodic full-state batch and backups run on the blocking
//! pool. A failed write is logged and counted; memory is never rolled back
//! and no client is disconnected.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::element::Element;
use crate::storage::{ElementStore, StoreConfig, StoreError, StoreStats};

#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<ElementStore>,
    failures: Arc<AtomicU64>,
}

impl PersistenceGateway {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(ElementStore::open(config)?)))
    }

    pub fn new(store: Arc<ElementStore>) -> Self {
        Self {
            store,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Read the durable state at startup.
    pub fn load(&self) -> Result<Vec<Element>, StoreError> {
        self.store.load()
    }

    /// Write-through of a single upsert. Returns `false` on failure.
    pub fn persist_one(&self, element: &Element) -> bool {
        match self.store.persist_one(element) {
            Ok(()) => true,
            Err(e) => {
                self.record_failure();
                log::error!("failed to persist element {}: {e}", element.id);
                false
            }
        }
    }

    /// Write-through of a single removal. Returns `false` on failure.
    pub fn remove(&self, id: &str) -> bool {
        match self.store.remove(id) {
            Ok(()) => true,
            Err(e) => {
                self.record_failure();
                log::error!("failed to delete element {id}: {e}");
                false
            }
        }
    }

    /// Write generation to pair with a state snapshot for [`persist_batch`](Self::persist_batch).
    pub fn generation(&self) -> u64 {
        self.store.generation()
    }

    /// Rewrite the durable state from a snapshot taken at write generation
    /// `as_of`, off the async runtime. Single writes made since then win.
    pub async fn persist_batch(&self, elements: Vec<Element>, as_of: u64) -> Result<usize, StoreError> {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || store.persist_snapshot(&elements, as_of))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
            .and_then(|r| r);

        match &result {
            Ok(count) => log::debug!("autosave wrote {count} elements"),
            Err(e) => {
                self.record_failure();
                log::error!("autosave failed: {e}");
            }
        }
        result
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.stats())
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    pub async fn backup(&self, target: Option<PathBuf>) -> Result<PathBuf, StoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.backup(target.as_deref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Number of writes that failed since startup.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn store(&self) -> &Arc<ElementStore> {
        &self.store
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}
