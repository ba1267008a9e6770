//! In-memory storage implementation.
//!
//! Used by tests and by workspaces whose replica does not need to outlive the
//! process.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;

use super::storage::CrdtStorage;
use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::Result;

/// In-memory CRDT storage. Data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Document snapshots (name -> binary state)
    docs: RwLock<HashMap<String, Vec<u8>>>,

    /// Update logs (name -> list of updates)
    updates: RwLock<HashMap<String, Vec<CrdtUpdate>>>,

    next_id: AtomicI64,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CrdtStorage for MemoryStorage {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.docs.read().get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        self.docs.write().insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        self.docs.write().remove(name);
        self.updates.write().remove(name);
        Ok(())
    }

    fn list_docs(&self) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = self.docs.read().keys().cloned().collect();
        names.extend(
            self.updates
                .read()
                .iter()
                .filter(|(_, log)| !log.is_empty())
                .map(|(name, _)| name.clone()),
        );
        Ok(names.into_iter().collect())
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.updates
            .write()
            .entry(name.to_string())
            .or_default()
            .push(CrdtUpdate {
                update_id: id,
                doc_name: name.to_string(),
                data: update.to_vec(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                origin,
            });
        Ok(id)
    }

    fn get_all_updates(&self, name: &str) -> Result<Vec<CrdtUpdate>> {
        Ok(self.updates.read().get(name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, updates::decoder::Decode};

    fn text_update(doc: &Doc, text: &str) -> Vec<u8> {
        let body = doc.get_or_insert_text("body");
        let sv = doc.transact().state_vector();
        let mut txn = doc.transact_mut();
        let len = body.len(&txn);
        body.insert(&mut txn, len, text);
        drop(txn);
        doc.transact().encode_state_as_update_v1(&sv)
    }

    #[test]
    fn test_save_load_delete() {
        let storage = MemoryStorage::new();
        storage.save_doc("test", b"state").unwrap();
        storage.append_update("test", b"update", UpdateOrigin::Local).unwrap();
        assert_eq!(storage.load_doc("test").unwrap(), Some(b"state".to_vec()));
        assert_eq!(storage.list_docs().unwrap(), vec!["test"]);

        storage.delete_doc("test").unwrap();
        assert!(storage.load_doc("test").unwrap().is_none());
        assert!(storage.get_all_updates("test").unwrap().is_empty());
        assert!(storage.list_docs().unwrap().is_empty());
    }

    #[test]
    fn test_update_ids_increase() {
        let storage = MemoryStorage::new();
        let id1 = storage.append_update("a", b"1", UpdateOrigin::Local).unwrap();
        let id2 = storage.append_update("b", b"2", UpdateOrigin::Remote).unwrap();
        assert!(id1 < id2);
        assert_eq!(storage.get_all_updates("b").unwrap()[0].origin, UpdateOrigin::Remote);
    }

    #[test]
    fn test_compact_preserves_state() {
        let storage = MemoryStorage::new();
        let doc = Doc::new();
        for word in ["hello", " ", "world"] {
            let update = text_update(&doc, word);
            storage.append_update("body", &update, UpdateOrigin::Local).unwrap();
        }

        storage.compact("body").unwrap();
        assert!(storage.get_all_updates("body").unwrap().is_empty());

        let state = storage.load_state("body").unwrap().unwrap();
        let restored = Doc::new();
        restored
            .transact_mut()
            .apply_update(Update::decode_v1(&state).unwrap())
            .unwrap();
        let text = restored.get_or_insert_text("body");
        assert_eq!(text.get_string(&restored.transact()), "hello world");
    }
}
