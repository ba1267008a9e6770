//! Per-workspace replicated state.
//!
//! [`DocumentState`] owns the metadata replica ([`WorkspaceCrdt`]) and the body
//! replicas ([`BodyDocManager`]) of one workspace, plus the local store their
//! content is materialized into. It is the single source of truth the
//! transport, the conflict tracker and the bootstrap flows share.
//!
//! Local mutations produce incremental updates that are queued in an outbox
//! until the transport session flushes them. Remote updates are merged and then
//! written back to the store as entry files.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::crdt::{BodyDocManager, CrdtStorage, FileMetadata, UpdateOrigin, WorkspaceCrdt};
use crate::entry::{self, parse_entry, render_entry};
use crate::error::{DiaryxError, Result};
use crate::store::{LocalStore, is_hidden, is_markdown};

/// Which replica a queued update belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocKey {
    /// The workspace metadata replica
    Metadata,
    /// The body replica of one entry
    Body(String),
}

/// A local update waiting to be sent.
#[derive(Debug, Clone)]
pub struct QueuedUpdate {
    /// Target replica
    pub key: DocKey,
    /// Encoded yrs update
    pub update: Vec<u8>,
    /// Entry paths the update touches
    pub paths: Vec<String>,
}

/// An entry eligible for body sync.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHandle {
    /// Workspace-relative path
    pub path: String,
    /// Current metadata
    pub metadata: FileMetadata,
}

#[derive(Default)]
struct Outbox {
    queue: Vec<QueuedUpdate>,
    held: bool,
    flushed: bool,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Metadata and body replicas of one workspace.
pub struct DocumentState {
    store: Arc<dyn LocalStore>,
    workspace: WorkspaceCrdt,
    bodies: BodyDocManager,
    outbox: Mutex<Outbox>,
    outbox_ready: Notify,
    /// Paths whose remote changes are not written to the store (open conflicts)
    suspended: RwLock<HashSet<String>>,
}

impl DocumentState {
    /// Load the replicas of a workspace from `storage`.
    pub fn new(store: Arc<dyn LocalStore>, storage: Arc<dyn CrdtStorage>) -> Result<Self> {
        let workspace = WorkspaceCrdt::load(Arc::clone(&storage))?;
        let bodies = BodyDocManager::new(storage);
        Ok(Self {
            store,
            workspace,
            bodies,
            outbox: Mutex::new(Outbox::default()),
            outbox_ready: Notify::new(),
            suspended: RwLock::new(HashSet::new()),
        })
    }

    /// The local store entries are materialized into.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// The metadata replica.
    pub fn workspace(&self) -> &WorkspaceCrdt {
        &self.workspace
    }

    /// The body replicas.
    pub fn bodies(&self) -> &BodyDocManager {
        &self.bodies
    }

    // ==================== Seeding ====================

    /// Seed both replicas from the entry files under `root`.
    ///
    /// Safe on a non-empty replica: metadata is only rewritten when it differs
    /// from the file, bodies are updated with a minimal diff, and replica
    /// entries without a file are left alone. Returns the number of entries
    /// that changed.
    pub async fn initialize_from_files(&self, root: &str) -> Result<usize> {
        let files = self.store.list_files(root).await?;
        let mut seeded = 0;

        for path in files {
            if is_hidden(&path) || !is_markdown(&path) {
                continue;
            }
            let content = match self.store.read_text(&path).await {
                Ok(content) => content,
                Err(DiaryxError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let (mut metadata, body) = match parse_entry(&path, &content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("[DocumentState] Skipping unparseable entry {}: {}", path, e);
                    continue;
                }
            };

            let mut changed = false;
            let unchanged = self
                .workspace
                .get_file(&path)
                .is_some_and(|existing| !existing.deleted && existing.same_content(&metadata));
            if !unchanged {
                metadata.modified_at = now_millis();
                let update = self.workspace.set_file(&path, &metadata)?;
                self.queue(DocKey::Metadata, update, vec![path.clone()]);
                changed = true;
            }

            let doc = self.bodies.get_or_create(&path);
            if doc.get_body() != body {
                let update = doc.set_body(&body)?;
                self.queue(DocKey::Body(path.clone()), update, vec![path.clone()]);
                changed = true;
            }

            if changed {
                seeded += 1;
            }
        }

        log::info!(
            "[DocumentState] Initialized from files under '{}': {} entries changed",
            root,
            seeded
        );
        Ok(seeded)
    }

    /// Tombstone every live entry. Returns how many were tombstoned.
    pub fn mark_all_deleted(&self) -> Result<usize> {
        let (paths, update) = self.workspace.delete_all()?;
        let count = paths.len();
        if count > 0 {
            self.queue(DocKey::Metadata, update, paths);
        }
        log::info!("[DocumentState] Tombstoned {} entries", count);
        Ok(count)
    }

    /// Live entries, keyed by path.
    pub fn get_all_files(&self) -> BTreeMap<String, FileHandle> {
        self.workspace
            .list_active_files()
            .into_iter()
            .map(|(path, metadata)| (path.clone(), FileHandle { path, metadata }))
            .collect()
    }

    // ==================== Outbox ====================

    fn queue(&self, key: DocKey, update: Vec<u8>, paths: Vec<String>) {
        self.outbox
            .lock()
            .queue
            .push(QueuedUpdate { key, update, paths });
        self.outbox_ready.notify_one();
    }

    /// Keep queued updates from being flushed until they are discarded or
    /// released.
    pub fn hold_outbox(&self) {
        self.outbox.lock().held = true;
    }

    /// Allow a held outbox to flush.
    pub fn release_outbox(&self) {
        self.outbox.lock().held = false;
        self.outbox_ready.notify_one();
    }

    /// Take every queued update for transmission.
    ///
    /// Returns nothing while the outbox is held. The first call on an
    /// unheld outbox counts as the first flush.
    pub fn take_outbox(&self) -> Vec<QueuedUpdate> {
        let mut outbox = self.outbox.lock();
        if outbox.held {
            return Vec::new();
        }
        outbox.flushed = true;
        std::mem::take(&mut outbox.queue)
    }

    /// Wait until something is queued or the outbox is released.
    pub async fn outbox_changed(&self) {
        self.outbox_ready.notified().await;
    }

    /// Number of queued updates.
    pub fn queued_len(&self) -> usize {
        self.outbox.lock().queue.len()
    }

    /// Whether queued updates are being held back.
    pub fn is_outbox_held(&self) -> bool {
        self.outbox.lock().held
    }

    /// Whether the outbox has been flushed at least once.
    pub fn has_flushed(&self) -> bool {
        self.outbox.lock().flushed
    }

    /// Drop every queued local update and the body state they carried.
    ///
    /// Bodies touched by a dropped update are reset so their pre-connect
    /// content cannot be merged into the server's copy a second time. Fails
    /// with `InvalidState` once the outbox has been flushed. Releases a held
    /// outbox.
    pub fn discard_queued_local_updates(&self, reason: &str) -> Result<usize> {
        let drained = {
            let mut outbox = self.outbox.lock();
            if outbox.flushed {
                return Err(DiaryxError::InvalidState(format!(
                    "cannot discard queued updates after the first flush ({})",
                    reason
                )));
            }
            outbox.held = false;
            std::mem::take(&mut outbox.queue)
        };

        let bodies: BTreeSet<&str> = drained
            .iter()
            .filter_map(|queued| match &queued.key {
                DocKey::Body(path) => Some(path.as_str()),
                DocKey::Metadata => None,
            })
            .collect();
        for path in &bodies {
            self.bodies.reset(path)?;
        }

        log::info!(
            "[DocumentState] Discarded {} queued updates ({} bodies reset): {}",
            drained.len(),
            bodies.len(),
            reason
        );
        self.outbox_ready.notify_one();
        Ok(drained.len())
    }

    /// Replace the metadata replica with `server_state` (a full-state update)
    /// and materialize every entry whose metadata changed.
    ///
    /// Used after discarding pre-connect updates, whose operations must not
    /// linger in the replica. Returns the number of changed entries.
    pub async fn rebase_metadata(&self, server_state: &[u8]) -> Result<usize> {
        let changed = self.workspace.reset_to(server_state)?;
        for path in &changed {
            if self.is_suspended(path) {
                continue;
            }
            if let Err(e) = self.materialize(path).await {
                log::warn!("[DocumentState] Failed to materialize {}: {}", path, e);
                if !e.is_recoverable() {
                    return Err(e);
                }
            }
        }
        log::info!(
            "[DocumentState] Metadata replica reset to server state, {} entries changed",
            changed.len()
        );
        Ok(changed.len())
    }

    // ==================== Local edits ====================

    /// Replace an entry's metadata and body, and write its file.
    ///
    /// `modified_at` is stamped with the current time.
    pub async fn write_entry(&self, path: &str, metadata: &FileMetadata, body: &str) -> Result<()> {
        let mut metadata = metadata.clone();
        metadata.deleted = false;
        metadata.modified_at = now_millis();

        let update = self.workspace.set_file(path, &metadata)?;
        self.queue(DocKey::Metadata, update, vec![path.to_string()]);

        let doc = self.bodies.get_or_create(path);
        if doc.get_body() != body {
            let update = doc.set_body(body)?;
            self.queue(DocKey::Body(path.to_string()), update, vec![path.to_string()]);
        }

        let content = render_entry(path, &metadata, body)?;
        self.store.write_text(path, &content).await
    }

    /// Replace an entry's body, keeping its metadata.
    pub async fn set_body(&self, path: &str, body: &str) -> Result<()> {
        let metadata = self
            .workspace
            .get_file(path)
            .filter(|m| !m.deleted)
            .ok_or_else(|| DiaryxError::NotFound(path.into()))?;
        self.write_entry(path, &metadata, body).await
    }

    /// Replace an entry's metadata, keeping its body.
    pub async fn set_metadata(&self, path: &str, metadata: &FileMetadata) -> Result<()> {
        let body = self
            .bodies
            .get(path)
            .map(|doc| doc.get_body())
            .unwrap_or_default();
        self.write_entry(path, metadata, &body).await
    }

    /// Tombstone an entry and remove its file.
    pub async fn delete_entry(&self, path: &str) -> Result<()> {
        if let Some(update) = self.workspace.delete_file(path)? {
            self.queue(DocKey::Metadata, update, vec![path.to_string()]);
        }
        match self.store.delete_entry(path, false).await {
            Ok(()) | Err(DiaryxError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Current metadata and body text of a live entry.
    pub fn local_snapshot(&self, path: &str) -> Option<(FileMetadata, String)> {
        let metadata = self.workspace.get_file(path).filter(|m| !m.deleted)?;
        let body = self
            .bodies
            .get(path)
            .map(|doc| doc.get_body())
            .unwrap_or_default();
        Some((metadata, body))
    }

    // ==================== Remote changes ====================

    /// Merge a remote metadata update and materialize the changed entries.
    ///
    /// Returns the paths whose metadata changed.
    pub async fn apply_remote_metadata(
        &self,
        update: &[u8],
        origin: UpdateOrigin,
    ) -> Result<Vec<String>> {
        let changed = self.workspace.apply_update(update, origin)?;
        for path in &changed {
            if self.is_suspended(path) {
                log::debug!("[DocumentState] Holding remote metadata for {}", path);
                continue;
            }
            if let Err(e) = self.materialize(path).await {
                log::warn!("[DocumentState] Failed to materialize {}: {}", path, e);
                if !e.is_recoverable() {
                    return Err(e);
                }
            }
        }
        Ok(changed)
    }

    /// Merge a remote body update and materialize the entry if its text
    /// changed. Returns whether the text changed.
    pub async fn apply_remote_body(
        &self,
        path: &str,
        update: &[u8],
        origin: UpdateOrigin,
    ) -> Result<bool> {
        let changed = self.bodies.apply_update(path, update, origin)?;
        if changed && !self.is_suspended(path) {
            self.materialize(path).await?;
        }
        Ok(changed)
    }

    /// Write the replica's view of `path` to the store.
    ///
    /// Tombstoned entries are removed. Identical content is not rewritten. An
    /// empty body replica never replaces a non-empty body on disk, since the
    /// body may simply not have synced yet. Returns whether the store changed.
    pub async fn materialize(&self, path: &str) -> Result<bool> {
        if is_hidden(path) || !is_markdown(path) {
            return Ok(false);
        }
        let Some(metadata) = self.workspace.get_file(path) else {
            return Ok(false);
        };

        if metadata.deleted {
            return match self.store.delete_entry(path, false).await {
                Ok(()) => {
                    log::debug!("[DocumentState] Removed tombstoned entry {}", path);
                    Ok(true)
                }
                Err(DiaryxError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            };
        }

        let current = self.store.read_text_opt(path).await?;
        let mut body = self
            .bodies
            .get(path)
            .map(|doc| doc.get_body())
            .unwrap_or_default();
        if body.is_empty()
            && let Some(existing) = current.as_deref()
            && let Ok((_, disk_body)) = parse_entry(path, existing)
            && !disk_body.is_empty()
        {
            body = disk_body;
        }

        let rendered = render_entry(path, &metadata, &body)?;
        if current.as_deref() == Some(rendered.as_str()) {
            return Ok(false);
        }
        self.store.write_text(path, &rendered).await?;
        log::debug!("[DocumentState] Wrote {}", path);
        Ok(true)
    }

    // ==================== Conflict holds ====================

    /// Stop writing remote changes of `path` to the store.
    pub fn suspend(&self, path: &str) {
        self.suspended.write().insert(path.to_string());
    }

    /// Resume writing remote changes of `path` to the store.
    pub fn resume(&self, path: &str) {
        self.suspended.write().remove(path);
    }

    /// Whether remote changes of `path` are held back.
    pub fn is_suspended(&self, path: &str) -> bool {
        self.suspended.read().contains(path)
    }

    // ==================== Queries ====================

    /// Audience of `path` after inheritance through `part_of`.
    pub fn effective_audience(&self, path: &str) -> Vec<String> {
        entry::effective_audience(path, |p| {
            self.workspace
                .get_file(p)
                .filter(|m| !m.deleted)
                .map(|m| (m.audience, m.part_of))
        })
    }

    /// Compact both replicas into their snapshots.
    pub fn persist(&self) -> Result<()> {
        self.workspace.save()?;
        self.bodies.save_all()
    }
}

impl std::fmt::Debug for DocumentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentState")
            .field("workspace", &self.workspace)
            .field("queued", &self.queued_len())
            .finish()
    }
}
