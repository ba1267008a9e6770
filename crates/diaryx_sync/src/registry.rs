//! Device-local catalog of known workspaces.
//!
//! The registry is a single SQLite table keyed by workspace id. A workspace is
//! either local-only (id `local-<uuid>`) or synced (id issued by the server).
//! Promotion rewrites the id but keeps the storage directory, so files on disk
//! never move when a workspace starts syncing.
//!
//! At most one workspace is active; the pointer is a column on the table so it
//! can never dangle.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{DiaryxError, Result};
use crate::store::StoreKind;

/// A registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Workspace {
    /// Local id or server UUID
    pub id: String,
    /// Display name
    pub name: String,
    /// Medium holding the workspace files
    pub storage_kind: StoreKind,
    /// Storage directory name, fixed at creation
    pub storage_dir: String,
    /// Whether the workspace is local-only
    pub is_local: bool,
    /// When a server snapshot was last imported (ms since epoch)
    pub downloaded_at: Option<i64>,
    /// When the workspace was last made active (ms since epoch)
    pub last_opened_at: Option<i64>,
    /// When the entry was created (ms since epoch)
    pub created_at: i64,
}

/// Prefix of ids generated for local-only workspaces.
pub const LOCAL_ID_PREFIX: &str = "local-";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

const COLUMNS: &str =
    "id, name, storage_kind, storage_dir, is_local, downloaded_at, last_opened_at, created_at";

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    let kind: String = row.get(2)?;
    let storage_kind = kind.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        storage_kind,
        storage_dir: row.get(3)?,
        is_local: row.get(4)?,
        downloaded_at: row.get(5)?,
        last_opened_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// The workspace registry.
pub struct WorkspaceRegistry {
    conn: Mutex<Connection>,
}

impl WorkspaceRegistry {
    /// Open or create a registry database, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| DiaryxError::from_io(parent, e, true))?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    /// A registry that lives only as long as the value.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                storage_kind TEXT NOT NULL,
                storage_dir TEXT NOT NULL,
                is_local INTEGER NOT NULL,
                downloaded_at INTEGER,
                last_opened_at INTEGER,
                created_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Every workspace, oldest first.
    pub fn list(&self) -> Result<Vec<Workspace>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM workspaces ORDER BY created_at, id",
            COLUMNS
        ))?;
        let workspaces = stmt
            .query_map([], workspace_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workspaces)
    }

    /// Look up a workspace by id.
    pub fn get(&self, id: &str) -> Result<Option<Workspace>> {
        let conn = self.conn.lock();
        let workspace = conn
            .query_row(
                &format!("SELECT {} FROM workspaces WHERE id = ?", COLUMNS),
                params![id],
                workspace_from_row,
            )
            .optional()?;
        Ok(workspace)
    }

    fn require(&self, id: &str) -> Result<Workspace> {
        self.get(id)?
            .ok_or_else(|| DiaryxError::WorkspaceNotFound(id.to_string()))
    }

    fn insert(&self, workspace: &Workspace) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO workspaces ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                COLUMNS
            ),
            params![
                workspace.id,
                workspace.name,
                workspace.storage_kind.as_str(),
                workspace.storage_dir,
                workspace.is_local,
                workspace.downloaded_at,
                workspace.last_opened_at,
                workspace.created_at,
            ],
        )?;
        Ok(())
    }

    /// Create a local-only workspace with a fresh id.
    pub fn create(&self, name: &str, storage_kind: StoreKind) -> Result<Workspace> {
        let id = format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4());
        let workspace = Workspace {
            id: id.clone(),
            name: name.to_string(),
            storage_kind,
            storage_dir: id,
            is_local: true,
            downloaded_at: None,
            last_opened_at: None,
            created_at: now_ms(),
        };
        self.insert(&workspace)?;
        log::info!("[Registry] Created local workspace {} ({})", workspace.id, name);
        Ok(workspace)
    }

    /// Record a workspace first seen on the server.
    ///
    /// Returns the existing entry unchanged if `id` is already registered.
    pub fn register_synced(
        &self,
        id: &str,
        name: &str,
        storage_kind: StoreKind,
    ) -> Result<Workspace> {
        if let Some(existing) = self.get(id)? {
            return Ok(existing);
        }
        let workspace = Workspace {
            id: id.to_string(),
            name: name.to_string(),
            storage_kind,
            storage_dir: id.to_string(),
            is_local: false,
            downloaded_at: None,
            last_opened_at: None,
            created_at: now_ms(),
        };
        self.insert(&workspace)?;
        log::info!("[Registry] Registered synced workspace {} ({})", id, name);
        Ok(workspace)
    }

    /// Rewrite a local id to the server id and mark the workspace synced.
    ///
    /// Idempotent: if `local_id` is gone and `server_id` is already synced,
    /// this returns the synced entry without changes. The storage directory
    /// and the active pointer are preserved.
    pub fn promote(&self, local_id: &str, server_id: &str) -> Result<Workspace> {
        if local_id == server_id {
            let ws = self.require(server_id)?;
            if !ws.is_local {
                return Ok(ws);
            }
        } else if self.get(local_id)?.is_none() {
            return match self.get(server_id)? {
                Some(ws) if !ws.is_local => {
                    log::debug!("[Registry] {} already promoted to {}", local_id, server_id);
                    Ok(ws)
                }
                _ => Err(DiaryxError::WorkspaceNotFound(local_id.to_string())),
            };
        } else if self.get(server_id)?.is_some() {
            return Err(DiaryxError::InvalidState(format!(
                "cannot promote {}: {} is already registered",
                local_id, server_id
            )));
        }

        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE workspaces SET id = ?, is_local = 0 WHERE id = ?",
                params![server_id, local_id],
            )?;
        }
        log::info!("[Registry] Promoted {} to {}", local_id, server_id);
        self.require(server_id)
    }

    /// Flip a synced workspace back to local-only, keeping its id.
    pub fn demote(&self, id: &str) -> Result<Workspace> {
        self.update(id, "UPDATE workspaces SET is_local = 1 WHERE id = ?", params![id])?;
        log::info!("[Registry] Demoted {} to local-only", id);
        self.require(id)
    }

    /// Change the display name.
    pub fn rename(&self, id: &str, name: &str) -> Result<Workspace> {
        self.update(
            id,
            "UPDATE workspaces SET name = ? WHERE id = ?",
            params![name, id],
        )?;
        self.require(id)
    }

    /// Stamp `downloaded_at` with the current time.
    pub fn mark_downloaded(&self, id: &str) -> Result<Workspace> {
        self.update(
            id,
            "UPDATE workspaces SET downloaded_at = ? WHERE id = ?",
            params![now_ms(), id],
        )?;
        self.require(id)
    }

    /// Make `id` the active workspace and stamp `last_opened_at`.
    pub fn set_active(&self, id: &str) -> Result<Workspace> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE workspaces SET is_active = 1, last_opened_at = ? WHERE id = ?",
                params![now_ms(), id],
            )?;
            if changed == 0 {
                return Err(DiaryxError::WorkspaceNotFound(id.to_string()));
            }
            tx.execute(
                "UPDATE workspaces SET is_active = 0 WHERE id != ?",
                params![id],
            )?;
            tx.commit()?;
        }
        log::info!("[Registry] Active workspace is now {}", id);
        self.require(id)
    }

    /// The active workspace, if any.
    pub fn active(&self) -> Result<Option<Workspace>> {
        let conn = self.conn.lock();
        let workspace = conn
            .query_row(
                &format!("SELECT {} FROM workspaces WHERE is_active = 1", COLUMNS),
                [],
                workspace_from_row,
            )
            .optional()?;
        Ok(workspace)
    }

    /// Drop the registry entry. Storage is not touched.
    pub fn remove(&self, id: &str) -> Result<()> {
        self.update(id, "DELETE FROM workspaces WHERE id = ?", params![id])?;
        log::info!("[Registry] Removed {}", id);
        Ok(())
    }

    /// Delete every entry.
    pub fn reset(&self) -> Result<()> {
        self.conn.lock().execute("DELETE FROM workspaces", [])?;
        Ok(())
    }

    fn update(&self, id: &str, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute(sql, params)? == 0 {
            return Err(DiaryxError::WorkspaceNotFound(id.to_string()));
        }
        Ok(())
    }
}
