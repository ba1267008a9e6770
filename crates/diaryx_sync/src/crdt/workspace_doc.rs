//! Workspace CRDT document: the metadata replica.
//!
//! This module provides [`WorkspaceCrdt`], which wraps a yrs [`Doc`] holding
//! the workspace's file tree and per-entry attributes.
//!
//! # Structure
//!
//! ```text
//! Y.Doc
//! └── Y.Map "files"
//!     ├── "index.md"        → FileMetadata { title: "Home", contents: [...] }
//!     ├── "2024/day1.md"    → FileMetadata { part_of: "index.md", ... }
//!     └── "old.md"          → FileMetadata { deleted: true, ... }   (tombstone)
//! ```
//!
//! Values are JSON strings so concurrent writers replace whole entries; the
//! later writer wins per key, which is what conflict detection compares.
//!
//! Every local mutation returns the incremental update it produced so the
//! caller can queue it for transmission.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

use super::memory_storage::MemoryStorage;
use super::storage::CrdtStorage;
use super::types::{FileMetadata, UpdateOrigin};
use crate::error::{DiaryxError, Result};

/// The name of the Y.Map containing file metadata.
const FILES_MAP_NAME: &str = "files";

/// The document name used for workspace storage.
pub const WORKSPACE_DOC_NAME: &str = "workspace";

/// The live yrs document and its files map.
struct Replica {
    doc: Doc,
    files_map: MapRef,
}

impl Replica {
    fn new() -> Self {
        let doc = Doc::new();
        let files_map = doc.get_or_insert_map(FILES_MAP_NAME);
        Self { doc, files_map }
    }

    fn apply_state(&self, state: &[u8]) -> Result<()> {
        if state.is_empty() {
            return Ok(());
        }
        let update = Update::decode_v1(state).map_err(|e| crdt_err("decode state", e))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| crdt_err("apply state", e))
    }

    /// Raw JSON per key.
    fn raw_entries(&self) -> HashMap<String, String> {
        let txn = self.doc.transact();
        self.files_map
            .iter(&txn)
            .map(|(key, value)| (key.to_string(), value.to_string(&txn)))
            .collect()
    }
}

/// Keys whose raw value differs between two views, sorted.
fn changed_keys(before: &HashMap<String, String>, after: &HashMap<String, String>) -> Vec<String> {
    let mut changed: Vec<String> = after
        .iter()
        .filter(|(path, json)| before.get(*path) != Some(*json))
        .map(|(path, _)| path.clone())
        .chain(before.keys().filter(|p| !after.contains_key(*p)).cloned())
        .collect();
    changed.sort();
    changed
}

/// The metadata replica of one workspace.
pub struct WorkspaceCrdt {
    /// yrs allows one transaction per doc at a time; the lock also guards
    /// [`WorkspaceCrdt::reset_to`] swapping the doc out
    replica: Mutex<Replica>,
    storage: Arc<dyn CrdtStorage>,
    doc_name: String,
}

fn crdt_err(context: &str, e: impl std::fmt::Display) -> DiaryxError {
    DiaryxError::Crdt(format!("{}: {}", context, e))
}

impl WorkspaceCrdt {
    /// Create a new empty workspace CRDT with the given storage backend.
    pub fn new(storage: Arc<dyn CrdtStorage>) -> Self {
        Self {
            replica: Mutex::new(Replica::new()),
            storage,
            doc_name: WORKSPACE_DOC_NAME.to_string(),
        }
    }

    /// Load the workspace CRDT from storage (snapshot plus update log).
    ///
    /// If nothing was stored, returns a new empty workspace.
    pub fn load(storage: Arc<dyn CrdtStorage>) -> Result<Self> {
        let crdt = Self::new(storage);
        if let Some(state) = crdt.storage.load_state(&crdt.doc_name)? {
            crdt.replica.lock().apply_state(&state)?;
        }
        Ok(crdt)
    }

    /// Build a throwaway replica from a full-state update.
    ///
    /// Used to inspect a peer's view before merging it.
    pub fn from_update(update: &[u8]) -> Result<Self> {
        let crdt = Self::new(Arc::new(MemoryStorage::new()));
        crdt.replica.lock().apply_state(update)?;
        Ok(crdt)
    }

    // ==================== File Operations ====================

    /// Get metadata for a file at the given path (tombstones included).
    pub fn get_file(&self, path: &str) -> Option<FileMetadata> {
        let replica = self.replica.lock();
        let txn = replica.doc.transact();
        replica
            .files_map
            .get(&txn, path)
            .and_then(|value| serde_json::from_str(&value.to_string(&txn)).ok())
    }

    /// Set metadata for a file, returning the incremental update.
    ///
    /// The update is appended to storage with `Local` origin. An empty vector
    /// means nothing changed.
    pub fn set_file(&self, path: &str, metadata: &FileMetadata) -> Result<Vec<u8>> {
        let json = serde_json::to_string(metadata)?;
        let update = {
            let replica = self.replica.lock();
            let sv_before = replica.doc.transact().state_vector();
            {
                let mut txn = replica.doc.transact_mut();
                replica.files_map.insert(&mut txn, path, json);
            }
            replica.doc.transact().encode_state_as_update_v1(&sv_before)
        };
        self.persist_local(update)
    }

    /// Tombstone a file. Returns `None` when the path is unknown or already
    /// deleted.
    pub fn delete_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.get_file(path) {
            Some(mut metadata) if !metadata.deleted => {
                metadata.mark_deleted();
                self.set_file(path, &metadata).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Tombstone every live entry in a single transaction.
    ///
    /// Returns the tombstoned paths and the combined update.
    pub fn delete_all(&self) -> Result<(Vec<String>, Vec<u8>)> {
        let live: Vec<(String, FileMetadata)> = self.list_active_files();
        if live.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut paths = Vec::with_capacity(live.len());
        let update = {
            let replica = self.replica.lock();
            let sv_before = replica.doc.transact().state_vector();
            {
                let mut txn = replica.doc.transact_mut();
                for (path, mut metadata) in live {
                    metadata.mark_deleted();
                    let json = serde_json::to_string(&metadata)?;
                    replica.files_map.insert(&mut txn, path.as_str(), json);
                    paths.push(path);
                }
            }
            replica.doc.transact().encode_state_as_update_v1(&sv_before)
        };
        let update = self.persist_local(update)?;
        Ok((paths, update))
    }

    fn persist_local(&self, update: Vec<u8>) -> Result<Vec<u8>> {
        if !update.is_empty() {
            self.storage
                .append_update(&self.doc_name, &update, UpdateOrigin::Local)?;
        }
        Ok(update)
    }

    /// List all files, tombstones included, sorted by path.
    pub fn list_files(&self) -> Vec<(String, FileMetadata)> {
        let replica = self.replica.lock();
        let txn = replica.doc.transact();
        let mut files: Vec<(String, FileMetadata)> = replica
            .files_map
            .iter(&txn)
            .filter_map(|(key, value)| {
                let metadata = serde_json::from_str(&value.to_string(&txn)).ok()?;
                Some((key.to_string(), metadata))
            })
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files
    }

    /// List all non-deleted files, sorted by path.
    pub fn list_active_files(&self) -> Vec<(String, FileMetadata)> {
        self.list_files()
            .into_iter()
            .filter(|(_, meta)| !meta.deleted)
            .collect()
    }

    /// Number of entries, tombstones included.
    pub fn file_count(&self) -> usize {
        let replica = self.replica.lock();
        let txn = replica.doc.transact();
        replica.files_map.len(&txn) as usize
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.replica.lock().doc.transact().state_vector().encode_v1()
    }

    /// Encode the full document state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.replica
            .lock()
            .doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode only the updates a peer with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| crdt_err("decode state vector", e))?;
        Ok(self
            .replica
            .lock()
            .doc
            .transact()
            .encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a peer and persist it.
    ///
    /// Returns the paths whose stored value changed, sorted.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<Vec<String>> {
        let decoded = Update::decode_v1(update).map_err(|e| crdt_err("decode update", e))?;

        let changed = {
            let replica = self.replica.lock();
            let before = replica.raw_entries();
            replica
                .doc
                .transact_mut()
                .apply_update(decoded)
                .map_err(|e| crdt_err("apply update", e))?;
            changed_keys(&before, &replica.raw_entries())
        };

        self.storage.append_update(&self.doc_name, update, origin)?;
        Ok(changed)
    }

    /// Replace the whole replica with `state`, a full-state update.
    ///
    /// Local operations that `state` does not contain are gone afterwards,
    /// from memory and from storage. An empty `state` leaves an empty replica.
    /// Returns the paths whose stored value changed, sorted.
    pub fn reset_to(&self, state: &[u8]) -> Result<Vec<String>> {
        let fresh = Replica::new();
        fresh.apply_state(state)?;

        let changed = {
            let mut replica = self.replica.lock();
            let before = replica.raw_entries();
            *replica = fresh;
            changed_keys(&before, &replica.raw_entries())
        };

        self.storage.delete_doc(&self.doc_name)?;
        if !state.is_empty() {
            self.storage.save_doc(&self.doc_name, state)?;
        }
        Ok(changed)
    }

    // ==================== Persistence ====================

    /// Fold the update log into a snapshot.
    pub fn save(&self) -> Result<()> {
        self.storage.compact(&self.doc_name)
    }
}

impl std::fmt::Debug for WorkspaceCrdt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCrdt")
            .field("doc_name", &self.doc_name)
            .field("file_count", &self.file_count())
            .finish()
    }
}
