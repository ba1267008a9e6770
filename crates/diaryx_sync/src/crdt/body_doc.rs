//! Per-file document body CRDT.
//!
//! This module provides [`BodyDoc`], a Y.Doc holding one entry's markdown body
//! in a `Y.Text` named `body`. Bodies are replicated independently of the
//! metadata replica: each is its own sync unit on the multiplexed body channel.

use std::sync::Arc;

use parking_lot::Mutex;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use super::storage::CrdtStorage;
use super::types::UpdateOrigin;
use crate::error::{DiaryxError, Result};

/// Name of the Y.Text holding the document body content.
const BODY_TEXT_NAME: &str = "body";

/// Storage name for the body of `path`.
pub fn body_doc_name(path: &str) -> String {
    format!("body:{}", path)
}

/// A CRDT document for a single file's body content.
///
/// # Example
///
/// ```ignore
/// use diaryx_sync::crdt::{BodyDoc, MemoryStorage};
/// use std::sync::Arc;
///
/// let doc = BodyDoc::new(Arc::new(MemoryStorage::new()), "notes/hello.md");
/// let update = doc.set_body("# Hello World")?;
/// assert_eq!(doc.get_body(), "# Hello World");
/// ```
pub struct BodyDoc {
    doc: Doc,
    body_text: TextRef,
    storage: Arc<dyn CrdtStorage>,
    path: String,
    txn_lock: Mutex<()>,
}

/// Byte ranges `(start, old_end, new_end)` that differ between two strings,
/// aligned to char boundaries.
fn diff_range(current: &str, new: &str) -> (usize, usize, usize) {
    let prefix: usize = current
        .chars()
        .zip(new.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();

    let max_suffix = (current.len() - prefix).min(new.len() - prefix);
    let suffix: usize = current[prefix..]
        .chars()
        .rev()
        .zip(new[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .scan(0usize, |total, len| {
            *total += len;
            (*total <= max_suffix).then_some(len)
        })
        .sum();

    (prefix, current.len() - suffix, new.len() - suffix)
}

impl BodyDoc {
    /// Create a new empty body document for `path`.
    pub fn new(storage: Arc<dyn CrdtStorage>, path: &str) -> Self {
        let doc = Doc::new();
        let body_text = doc.get_or_insert_text(BODY_TEXT_NAME);
        Self {
            doc,
            body_text,
            storage,
            path: path.to_string(),
            txn_lock: Mutex::new(()),
        }
    }

    /// Load a body document from storage, or create a new one if nothing is stored.
    pub fn load(storage: Arc<dyn CrdtStorage>, path: &str) -> Result<Self> {
        let body = Self::new(storage, path);
        if let Some(state) = body.storage.load_state(&body_doc_name(path))? {
            match Update::decode_v1(&state) {
                Ok(update) => {
                    if let Err(e) = body.doc.transact_mut().apply_update(update) {
                        log::warn!("[DocumentState] Stored body for {} is corrupt: {}", path, e);
                    }
                }
                Err(e) => log::warn!("[DocumentState] Stored body for {} is corrupt: {}", path, e),
            }
        }
        Ok(body)
    }

    /// The entry path this body belongs to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the full body content as a string.
    pub fn get_body(&self) -> String {
        let _guard = self.txn_lock.lock();
        let txn = self.doc.transact();
        self.body_text.get_string(&txn)
    }

    /// Whether the body holds no text.
    pub fn is_empty(&self) -> bool {
        let _guard = self.txn_lock.lock();
        let txn = self.doc.transact();
        self.body_text.len(&txn) == 0
    }

    /// Set the body content with a minimal prefix/suffix diff.
    ///
    /// Unchanged text keeps its CRDT identity so concurrent edits elsewhere in
    /// the text merge cleanly. Returns the incremental update (empty when the
    /// content was already equal).
    pub fn set_body(&self, content: &str) -> Result<Vec<u8>> {
        let update = {
            let _guard = self.txn_lock.lock();
            let (current, sv_before) = {
                let txn = self.doc.transact();
                (self.body_text.get_string(&txn), txn.state_vector())
            };
            if current == content {
                return Ok(Vec::new());
            }

            let (start, old_end, new_end) = diff_range(&current, content);
            {
                // Text offsets are UTF-8 byte offsets (the default OffsetKind)
                let mut txn = self.doc.transact_mut();
                if old_end > start {
                    self.body_text
                        .remove_range(&mut txn, start as u32, (old_end - start) as u32);
                }
                if new_end > start {
                    self.body_text
                        .insert(&mut txn, start as u32, &content[start..new_end]);
                }
            }
            self.doc.transact().encode_state_as_update_v1(&sv_before)
        };

        if !update.is_empty() {
            self.storage
                .append_update(&body_doc_name(&self.path), &update, UpdateOrigin::Local)?;
        }
        Ok(update)
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for sync.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let _guard = self.txn_lock.lock();
        self.doc.transact().state_vector().encode_v1()
    }

    /// Encode the full state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let _guard = self.txn_lock.lock();
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the updates a peer with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DiaryxError::Crdt(format!("decode state vector: {}", e)))?;
        let _guard = self.txn_lock.lock();
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a peer and persist it.
    ///
    /// Returns whether the text changed.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<bool> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| DiaryxError::Crdt(format!("decode update: {}", e)))?;

        let changed = {
            let _guard = self.txn_lock.lock();
            let before = self.body_text.get_string(&self.doc.transact());
            self.doc
                .transact_mut()
                .apply_update(decoded)
                .map_err(|e| DiaryxError::Crdt(format!("apply update: {}", e)))?;
            before != self.body_text.get_string(&self.doc.transact())
        };

        self.storage
            .append_update(&body_doc_name(&self.path), update, origin)?;
        Ok(changed)
    }

    /// Fold this body's update log into a snapshot.
    pub fn save(&self) -> Result<()> {
        self.storage.compact(&body_doc_name(&self.path))
    }
}

impl std::fmt::Debug for BodyDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyDoc").field("path", &self.path).finish()
    }
}
