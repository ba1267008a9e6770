//! SQLite-backed storage implementation for CRDT persistence.
//!
//! Native workspaces keep their replica in `.diaryx/crdt.db` inside the
//! workspace storage so a restart resumes from the last persisted state
//! instead of re-seeding from files.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::storage::{CrdtStorage, fold_updates};
use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::Result;

/// SQLite-backed CRDT storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    ///
    /// This will create the necessary tables if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory SQLite database for testing.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            -- Document snapshots (compacted state)
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Incremental updates since the snapshot
            -- No foreign key: updates may arrive before any snapshot exists
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_name TEXT NOT NULL,
                data BLOB NOT NULL,
                origin TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_updates_doc_id ON updates(doc_name, id);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl CrdtStorage for SqliteStorage {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO documents (name, state, updated_at) VALUES (?, ?, ?)",
            params![name, state, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM updates WHERE doc_name = ?", params![name])?;
        tx.execute("DELETE FROM documents WHERE name = ?", params![name])?;
        tx.commit()?;
        Ok(())
    }

    fn list_docs(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM documents UNION SELECT doc_name FROM updates ORDER BY 1",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO updates (doc_name, data, origin, timestamp) VALUES (?, ?, ?, ?)",
            params![
                name,
                update,
                origin.to_string(),
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_all_updates(&self, name: &str) -> Result<Vec<CrdtUpdate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, data, origin, timestamp FROM updates WHERE doc_name = ? ORDER BY id ASC",
        )?;
        let updates = stmt
            .query_map(params![name], |row| {
                let origin: String = row.get(2)?;
                Ok(CrdtUpdate {
                    update_id: row.get(0)?,
                    doc_name: name.to_string(),
                    data: row.get(1)?,
                    timestamp: row.get(3)?,
                    origin: origin.parse().unwrap_or(UpdateOrigin::Local),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(updates)
    }

    fn compact(&self, name: &str) -> Result<()> {
        let base = self.load_doc(name)?;
        let updates = self.get_all_updates(name)?;
        let Some(last_id) = updates.last().map(|u| u.update_id) else {
            return Ok(());
        };
        let state = fold_updates(base.as_deref(), updates.iter().map(|u| u.data.as_slice()))?;

        // Snapshot and log trim commit together so a crash never loses updates
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO documents (name, state, updated_at) VALUES (?, ?, ?)",
            params![name, state, chrono::Utc::now().timestamp_millis()],
        )?;
        tx.execute(
            "DELETE FROM updates WHERE doc_name = ? AND id <= ?",
            params![name, last_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, Map, ReadTxn, Transact, Update, updates::decoder::Decode};

    #[test]
    fn test_sqlite_delete_doc() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save_doc("test", b"data").unwrap();
        storage
            .append_update("test", b"update", UpdateOrigin::Local)
            .unwrap();

        storage.delete_doc("test").unwrap();

        assert!(storage.load_doc("test").unwrap().is_none());
        assert!(storage.get_all_updates("test").unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_list_docs_includes_log_only() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save_doc("doc1", b"data1").unwrap();
        storage
            .append_update("doc2", b"u", UpdateOrigin::Remote)
            .unwrap();
        assert_eq!(storage.list_docs().unwrap(), vec!["doc1", "doc2"]);
    }

    #[test]
    fn test_sqlite_compact_with_yrs() {
        let storage = SqliteStorage::in_memory().unwrap();

        let doc = Doc::new();
        let map = doc.get_or_insert_map("files");
        for i in 0..10 {
            let sv = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                map.insert(&mut txn, format!("file{}", i), format!("value{}", i));
            }
            let update = doc.transact().encode_state_as_update_v1(&sv);
            storage
                .append_update("test", &update, UpdateOrigin::Local)
                .unwrap();
        }

        storage.compact("test").unwrap();
        assert!(storage.get_all_updates("test").unwrap().is_empty());

        let state = storage.load_state("test").unwrap().unwrap();
        let restored = Doc::new();
        restored
            .transact_mut()
            .apply_update(Update::decode_v1(&state).unwrap())
            .unwrap();
        let map = restored.get_or_insert_map("files");
        let txn = restored.transact();
        assert_eq!(map.len(&txn), 10);
        assert!(map.get(&txn, "file9").is_some());
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".diaryx").join("crdt.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.save_doc("workspace", b"state").unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(
            storage.load_doc("workspace").unwrap(),
            Some(b"state".to_vec())
        );
    }
}
