//! Manager for the per-file body documents of one workspace.
//!
//! [`BodyDocManager`] lazily loads [`BodyDoc`]s on first access and caches
//! them, keyed by entry path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::body_doc::{BodyDoc, body_doc_name};
use super::storage::CrdtStorage;
use super::types::UpdateOrigin;
use crate::error::Result;

/// Manager for multiple body document CRDTs.
///
/// # Example
///
/// ```ignore
/// use diaryx_sync::crdt::{BodyDocManager, MemoryStorage};
/// use std::sync::Arc;
///
/// let manager = BodyDocManager::new(Arc::new(MemoryStorage::new()));
/// let doc = manager.get_or_create("notes/hello.md");
/// doc.set_body("# Hello World")?;
/// manager.save_all()?;
/// ```
pub struct BodyDocManager {
    storage: Arc<dyn CrdtStorage>,
    docs: RwLock<HashMap<String, Arc<BodyDoc>>>,
}

impl BodyDocManager {
    /// Create a new body document manager.
    pub fn new(storage: Arc<dyn CrdtStorage>) -> Self {
        Self {
            storage,
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Get a document, loading it from storage if necessary.
    ///
    /// Returns `None` if the body was never created or stored.
    pub fn get(&self, path: &str) -> Option<Arc<BodyDoc>> {
        if let Some(doc) = self.docs.read().get(path) {
            return Some(Arc::clone(doc));
        }

        match self.storage.load_state(&body_doc_name(path)) {
            Ok(Some(_)) => Some(self.get_or_create(path)),
            Ok(None) => None,
            Err(e) => {
                log::warn!("[DocumentState] Failed to load body for {}: {}", path, e);
                None
            }
        }
    }

    /// Get a document, creating it if it doesn't exist.
    pub fn get_or_create(&self, path: &str) -> Arc<BodyDoc> {
        if let Some(doc) = self.docs.read().get(path) {
            return Arc::clone(doc);
        }

        let mut docs = self.docs.write();
        // Another caller may have inserted while we waited
        if let Some(doc) = docs.get(path) {
            return Arc::clone(doc);
        }

        let doc = match BodyDoc::load(Arc::clone(&self.storage), path) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("[DocumentState] Starting empty body for {}: {}", path, e);
                BodyDoc::new(Arc::clone(&self.storage), path)
            }
        };
        let doc = Arc::new(doc);
        docs.insert(path.to_string(), Arc::clone(&doc));
        doc
    }

    /// Drop a document from the cache and delete its persisted state.
    ///
    /// The next access starts from an empty body.
    pub fn reset(&self, path: &str) -> Result<()> {
        self.docs.write().remove(path);
        self.storage.delete_doc(&body_doc_name(path))
    }

    /// Compact every loaded document.
    pub fn save_all(&self) -> Result<()> {
        let docs: Vec<Arc<BodyDoc>> = self.docs.read().values().cloned().collect();
        for doc in docs {
            doc.save()?;
        }
        Ok(())
    }

    /// Apply a remote update to a document, creating it if needed.
    ///
    /// Returns whether the text changed.
    pub fn apply_update(&self, path: &str, update: &[u8], origin: UpdateOrigin) -> Result<bool> {
        self.get_or_create(path).apply_update(update, origin)
    }
}
