//! Storage abstraction for CRDT persistence.
//!
//! This module defines the [`CrdtStorage`] trait which abstracts over different
//! storage backends (SQLite, in-memory) for persisting CRDT documents and updates.

use yrs::{Doc, ReadTxn, Transact, Update, updates::decoder::Decode};

use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::{DiaryxError, Result};

/// Trait for CRDT document storage backends.
///
/// # Storage Model
///
/// The storage maintains two types of data:
/// 1. **Document snapshots**: Compacted full state of a CRDT document
/// 2. **Update log**: Incremental updates appended since the last snapshot
///
/// A document's current state is the snapshot with every logged update
/// applied on top; [`CrdtStorage::load_state`] computes exactly that.
pub trait CrdtStorage: Send + Sync {
    /// Load the document snapshot. Returns `None` if none was saved.
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Save the full document state, overwriting any existing snapshot.
    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()>;

    /// Delete a document and all its updates.
    fn delete_doc(&self, name: &str) -> Result<()>;

    /// List all document names that have a snapshot or logged updates.
    fn list_docs(&self) -> Result<Vec<String>>;

    /// Append an incremental update to the update log.
    ///
    /// Returns the ID of the newly created update record.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64>;

    /// Get all logged updates for a document, oldest first.
    fn get_all_updates(&self, name: &str) -> Result<Vec<CrdtUpdate>>;

    /// Fold the update log into the snapshot and clear the log.
    fn compact(&self, name: &str) -> Result<()> {
        let updates = self.get_all_updates(name)?;
        if updates.is_empty() {
            return Ok(());
        }
        let state = self.load_state(name)?.unwrap_or_default();
        self.delete_doc(name)?;
        self.save_doc(name, &state)
    }

    /// Snapshot plus log, as a single state update.
    ///
    /// Returns `None` when nothing was ever stored under `name`.
    fn load_state(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let base = self.load_doc(name)?;
        let updates = self.get_all_updates(name)?;
        if updates.is_empty() {
            return Ok(base);
        }
        fold_updates(base.as_deref(), updates.iter().map(|u| u.data.as_slice())).map(Some)
    }
}

/// Apply `base` and then every update to a scratch doc and encode the result.
pub(crate) fn fold_updates<'a>(
    base: Option<&'a [u8]>,
    updates: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Vec<u8>> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        for data in base.into_iter().chain(updates) {
            let update = Update::decode_v1(data).map_err(|e| DiaryxError::Crdt(e.to_string()))?;
            txn.apply_update(update)
                .map_err(|e| DiaryxError::Crdt(e.to_string()))?;
        }
    }
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&Default::default()))
}
