//! SQLite-backed store.
//!
//! Files live in a single key-value table keyed by workspace path. Useful on
//! devices without a writable filesystem and for bundling a whole workspace
//! into one file.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::{BoxFuture, LocalStore, StoreKind, TreeNode, normalize_path};
use crate::error::{DiaryxError, Result};

/// SQLite-backed store.
///
/// The connection is wrapped in a `Mutex`; each operation is a single
/// statement so no transaction spans an await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database. Data is lost on drop.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                content BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path);
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT content FROM files WHERE path = ?",
            params![path],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| DiaryxError::NotFound(PathBuf::from(path)))
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let path = normalize_path(path);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO files (path, content, updated_at) VALUES (?, ?, ?)",
            params![path, bytes, chrono::Utc::now().timestamp_millis()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DiskFull =>
            {
                DiaryxError::QuotaExceeded(PathBuf::from(&path))
            }
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ReadOnly =>
            {
                DiaryxError::PermissionDenied(PathBuf::from(&path))
            }
            other => DiaryxError::Database(other),
        })?;
        Ok(())
    }

    fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        let path = normalize_path(path);
        let conn = self.conn.lock();

        if conn.execute("DELETE FROM files WHERE path = ?", params![path])? > 0 {
            return Ok(());
        }

        let pattern = if path.is_empty() {
            "%".to_string()
        } else {
            format!("{}/%", escape_like(&path))
        };
        let children: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE path LIKE ? ESCAPE '\\'",
            params![pattern],
            |row| row.get(0),
        )?;

        if children == 0 {
            return Err(DiaryxError::NotFound(PathBuf::from(path)));
        }
        if !recursive {
            return Err(DiaryxError::InvalidState(format!(
                "directory '{}' is not empty",
                path
            )));
        }
        conn.execute(
            "DELETE FROM files WHERE path LIKE ? ESCAPE '\\'",
            params![pattern],
        )?;
        Ok(())
    }

    fn all_paths(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT path FROM files ORDER BY path")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(paths)
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

impl LocalStore for SqliteStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Sqlite
    }

    fn read_text<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let bytes = self.get(path)?;
            String::from_utf8(bytes).map_err(|e| DiaryxError::FileRead {
                path: PathBuf::from(path),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })
        })
    }

    fn write_text<'a>(&'a self, path: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.put(path, text.as_bytes()) })
    }

    fn read_binary<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.get(path) })
    }

    fn write_binary<'a>(&'a self, path: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.put(path, bytes) })
    }

    fn delete_entry<'a>(&'a self, path: &'a str, recursive: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.remove(path, recursive) })
    }

    fn list_tree<'a>(&'a self, root: &'a str) -> BoxFuture<'a, Result<TreeNode>> {
        Box::pin(async move { Ok(TreeNode::from_paths(root, self.all_paths()?)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        store.write_text("notes/a.md", "alpha").await.unwrap();
        store.write_binary("notes/_x.bin", &[1, 2, 3]).await.unwrap();
        store.write_text("notes_other.md", "beta").await.unwrap();

        assert_eq!(store.read_text("notes/a.md").await.unwrap(), "alpha");
        assert!(store.exists("notes/_x.bin").await);

        store.delete_entry("notes", true).await.unwrap();
        // LIKE wildcards in the prefix must not match siblings
        assert_eq!(store.list_files("").await.unwrap(), vec!["notes_other.md"]);
    }

    #[tokio::test]
    async fn test_sqlite_store_missing() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(matches!(
            store.read_binary("nope").await,
            Err(DiaryxError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_entry("nope", false).await,
            Err(DiaryxError::NotFound(_))
        ));
    }
}
