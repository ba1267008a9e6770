//! Bootstrap Orchestrator.
//!
//! Brings a device's replica of a workspace to a consistent starting point and
//! hands it to a live [`TransportSession`]. There are five flows:
//!
//! | Flow | Source of truth | Ends with |
//! |------|-----------------|-----------|
//! | [`download_server`](BootstrapOrchestrator::download_server) | server snapshot | metadata sync, body subscriptions |
//! | [`upload_local`](BootstrapOrchestrator::upload_local) | local files | metadata sync, proactive body push |
//! | [`create_new`](BootstrapOrchestrator::create_new) | a fresh local workspace | same as upload |
//! | [`import_archive`](BootstrapOrchestrator::import_archive) | a user archive | metadata sync |
//! | [`resume`](BootstrapOrchestrator::resume) | local files and replicas | metadata sync, body subscriptions |
//!
//! [`create_local`](BootstrapOrchestrator::create_local) only touches the
//! registry and the local store.
//!
//! Every step is safe to repeat. A failed flow leaves the files and registry
//! entries it already produced, and calling it again picks up from there.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SyncConfig;
use crate::conflict::{ConflictTracker, MANIFEST_PATH};
use crate::crdt::{CrdtStorage, FileMetadata, MemoryStorage, SqliteStorage};
use crate::document_state::DocumentState;
use crate::entry::render_entry;
use crate::error::{DiaryxError, Result};
use crate::progress::{BootstrapStage, ProgressReporter};
use crate::registry::{Workspace, WorkspaceRegistry};
use crate::remote::{RemoteApi, RemoteWorkspace, SnapshotImportMode};
use crate::snapshot::{ExportFilter, export_snapshot, import_snapshot};
use crate::store::{
    LocalStore, META_DIR, MemoryStore, NativeStore, SqliteStore, StoreKind, is_hidden,
    is_markdown,
};
use crate::transport::{BodySyncOptions, SessionOptions, SyncConnector, TransportSession};

/// Root entry written into new workspaces.
pub const ROOT_INDEX: &str = "index.md";

/// The two halves of a workspace's local storage.
#[derive(Clone)]
pub struct WorkspaceStorage {
    /// Entry files
    pub store: Arc<dyn LocalStore>,
    /// Replica state
    pub crdt: Arc<dyn CrdtStorage>,
}

/// Resolves a registry entry to its storage.
pub trait StorageProvider: Send + Sync {
    /// Open (creating if needed) the storage of `workspace`.
    fn open(&self, workspace: &Workspace) -> Result<WorkspaceStorage>;
}

/// Storage under one directory, laid out by [`StoreKind`]:
///
/// - `native`: files in `<root>/<storage_dir>/`, replicas in
///   `<root>/<storage_dir>/.diaryx/crdt.db`
/// - `sqlite`: `<root>/<storage_dir>.db` and `<root>/<storage_dir>.crdt.db`
/// - `memory`: kept for the life of the provider
pub struct StorageRoot {
    root: PathBuf,
    memory: Mutex<HashMap<String, WorkspaceStorage>>,
}

impl StorageRoot {
    /// Provider rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Provider for the directory named in `config`, falling back to the
    /// platform data directory.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self::new(config.resolved_workspaces_dir()?))
    }
}

impl StorageProvider for StorageRoot {
    fn open(&self, workspace: &Workspace) -> Result<WorkspaceStorage> {
        let dir = &workspace.storage_dir;
        match workspace.storage_kind {
            StoreKind::Memory => {
                let mut memory = self.memory.lock();
                let storage = memory.entry(dir.clone()).or_insert_with(|| WorkspaceStorage {
                    store: Arc::new(MemoryStore::new()),
                    crdt: Arc::new(MemoryStorage::new()),
                });
                Ok(storage.clone())
            }
            StoreKind::Native => {
                let files = self.root.join(dir);
                let crdt = SqliteStorage::open(files.join(META_DIR).join("crdt.db"))?;
                Ok(WorkspaceStorage {
                    store: Arc::new(NativeStore::new(files)),
                    crdt: Arc::new(crdt),
                })
            }
            StoreKind::Sqlite => {
                // Opening is synchronous anyway: rusqlite below blocks on the same directory
                std::fs::create_dir_all(&self.root)
                    .map_err(|e| DiaryxError::from_io(&self.root, e, true))?;
                let store = SqliteStore::open(self.root.join(format!("{}.db", dir)))?;
                let crdt = SqliteStorage::open(self.root.join(format!("{}.crdt.db", dir)))?;
                Ok(WorkspaceStorage {
                    store: Arc::new(store),
                    crdt: Arc::new(crdt),
                })
            }
        }
    }
}

/// Knobs shared by every flow.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// How long to wait for the first metadata sync
    pub metadata_sync_timeout: Duration,
    /// Overall deadline for the proactive body push
    pub body_sync_timeout: Duration,
    /// Concurrent body subscriptions
    pub body_sync_concurrency: usize,
    /// How the server applies uploaded snapshots
    pub import_mode: SnapshotImportMode,
    /// Medium for workspaces created by a flow
    pub storage_kind: StoreKind,
}

impl BootstrapOptions {
    /// Options from a config file.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            metadata_sync_timeout: config.metadata_sync_timeout(),
            body_sync_timeout: config.body_sync_timeout(),
            body_sync_concurrency: config.body_sync_concurrency,
            import_mode: SnapshotImportMode::Replace,
            storage_kind: StoreKind::Native,
        }
    }
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// A bootstrapped workspace with its live session.
pub struct BootstrapOutcome {
    /// Registry entry as it stands after the flow
    pub workspace: Workspace,
    /// Session left running in the background
    pub session: Arc<TransportSession>,
    /// Whether metadata sync finished before its timeout
    pub metadata_synced: bool,
}

impl BootstrapOutcome {
    /// Replicas of the workspace.
    pub fn state(&self) -> &Arc<DocumentState> {
        self.session.document_state()
    }

    /// Conflicts raised by the session.
    pub fn conflicts(&self) -> &Arc<ConflictTracker> {
        self.session.conflicts()
    }
}

impl std::fmt::Debug for BootstrapOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapOutcome")
            .field("workspace", &self.workspace)
            .field("session", &self.session.state())
            .field("metadata_synced", &self.metadata_synced)
            .finish()
    }
}

/// Sequences registry, storage, snapshots and transport for each flow.
pub struct BootstrapOrchestrator {
    registry: Arc<WorkspaceRegistry>,
    remote: Arc<dyn RemoteApi>,
    connector: Arc<dyn SyncConnector>,
    storage: Arc<dyn StorageProvider>,
    config: SyncConfig,
    options: BootstrapOptions,
}

impl BootstrapOrchestrator {
    /// Orchestrator over explicit collaborators.
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        remote: Arc<dyn RemoteApi>,
        connector: Arc<dyn SyncConnector>,
        storage: Arc<dyn StorageProvider>,
        config: SyncConfig,
    ) -> Self {
        let options = BootstrapOptions::from_config(&config);
        Self {
            registry,
            remote,
            connector,
            storage,
            config,
            options,
        }
    }

    /// Replace the options derived from the config.
    pub fn with_options(mut self, options: BootstrapOptions) -> Self {
        self.options = options;
        self
    }

    /// The registry flows record their outcome in.
    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    /// Open the storage of a registered workspace.
    pub fn open_storage(&self, workspace: &Workspace) -> Result<WorkspaceStorage> {
        self.storage.open(workspace)
    }

    // ==================== Flows ====================

    /// Create a local-only workspace with a root index entry.
    ///
    /// No connection is made.
    pub async fn create_local(&self, name: &str) -> Result<Workspace> {
        let workspace = self.registry.create(name, self.options.storage_kind)?;
        let storage = self.storage.open(&workspace)?;

        if !storage.store.exists(ROOT_INDEX).await {
            let mut metadata = FileMetadata::new(Some(name.to_string()));
            metadata.contents = Some(Vec::new());
            let content = render_entry(ROOT_INDEX, &metadata, &format!("# {}\n", name))?;
            storage.store.write_text(ROOT_INDEX, &content).await?;
        }

        log::info!("[Bootstrap] Created local workspace {} ({})", workspace.id, name);
        self.registry.set_active(&workspace.id)
    }

    /// Replace local content with the server's copy of `workspace_id`.
    ///
    /// Local files are cleared and every known entry is tombstoned before the
    /// snapshot is imported, so entries the server no longer has cannot come
    /// back through a merge. Updates captured before the connection are
    /// discarded once metadata sync finished or timed out, and the metadata
    /// replica is rebuilt from the server's state.
    pub async fn download_server(
        &self,
        workspace_id: &str,
        progress: &ProgressReporter,
    ) -> Result<BootstrapOutcome> {
        progress.stage(BootstrapStage::Preparing);
        let workspace = match self.registry.get(workspace_id)? {
            Some(workspace) => workspace,
            None => {
                let name = self.remote_name(workspace_id).await?;
                self.registry
                    .register_synced(workspace_id, &name, self.options.storage_kind)?
            }
        };
        log::info!("[Bootstrap] Downloading workspace {} ({})", workspace.id, workspace.name);

        let storage = self.storage.open(&workspace)?;
        let state = Arc::new(DocumentState::new(
            Arc::clone(&storage.store),
            Arc::clone(&storage.crdt),
        )?);
        state.hold_outbox();

        progress.stage(BootstrapStage::ClearingLocal);
        let cleared = clear_local_files(storage.store.as_ref()).await?;
        // Bases recorded against the old local copy no longer apply
        match storage.store.delete_entry(MANIFEST_PATH, false).await {
            Ok(()) | Err(DiaryxError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        log::info!("[Bootstrap] Cleared {} local files", cleared);

        progress.stage(BootstrapStage::Tombstoning);
        let tombstoned = state.mark_all_deleted()?;
        log::info!("[Bootstrap] Tombstoned {} entries", tombstoned);

        progress.stage(BootstrapStage::Downloading);
        let archive = self.remote.download_snapshot(&workspace.id, progress).await?;

        progress.stage(BootstrapStage::ImportingFiles);
        let summary = import_snapshot(storage.store.as_ref(), &archive, "", progress).await?;
        log::info!(
            "[Bootstrap] Imported {} files ({} skipped)",
            summary.imported,
            summary.skipped
        );
        self.registry.mark_downloaded(&workspace.id)?;

        let session = self.start_session(&workspace, state, progress).await?;
        let metadata_synced = self.wait_for_metadata(&session, progress).await;

        session
            .discard_local_updates("server snapshot is authoritative")
            .await?;

        progress.stage(BootstrapStage::SyncingBodies);
        // Without metadata the replica is still empty; the snapshot names the entries
        let paths: Vec<String> = if metadata_synced {
            session.document_state().get_all_files().into_keys().collect()
        } else {
            summary.files.into_iter().filter(|p| is_markdown(p)).collect()
        };
        session
            .subscribe_bodies(
                paths,
                BodySyncOptions {
                    concurrency: self.options.body_sync_concurrency,
                    wait_for_complete: false,
                    timeout: self.options.body_sync_timeout,
                    progress: progress.clone(),
                },
            )
            .await?;

        self.finish(&workspace.id, session, metadata_synced, progress)
    }

    /// Push a registered workspace to the server and start syncing it.
    ///
    /// A local-only workspace gets a remote workspace of the same name (or
    /// is merged into the existing one carrying that name) and is promoted
    /// to its id. The
    /// snapshot upload seeds files only, so every body is pushed once
    /// metadata sync finished or timed out.
    pub async fn upload_local(
        &self,
        workspace_id: &str,
        progress: &ProgressReporter,
    ) -> Result<BootstrapOutcome> {
        progress.stage(BootstrapStage::Preparing);
        let workspace = self
            .registry
            .get(workspace_id)?
            .ok_or_else(|| DiaryxError::WorkspaceNotFound(workspace_id.to_string()))?;
        let storage = self.storage.open(&workspace)?;

        let (remote_id, import_mode) = if workspace.is_local {
            let (remote, mode) = self.create_remote(&workspace.name).await?;
            (remote.id, mode)
        } else {
            (workspace.id.clone(), self.options.import_mode)
        };

        progress.stage(BootstrapStage::Exporting);
        let archive =
            export_snapshot(storage.store.as_ref(), "", &ExportFilter::all(), progress).await?;
        log::info!(
            "[Bootstrap] Uploading {} files to {}",
            archive.entries.len(),
            remote_id
        );

        progress.stage(BootstrapStage::Uploading);
        self.remote
            .upload_snapshot(&remote_id, archive.bytes, import_mode, progress)
            .await?;

        let workspace = if workspace.is_local {
            self.registry.promote(&workspace.id, &remote_id)?
        } else {
            workspace
        };

        let state = Arc::new(DocumentState::new(storage.store, storage.crdt)?);
        let session = self.start_session(&workspace, state, progress).await?;
        let metadata_synced = self.wait_for_metadata(&session, progress).await;

        progress.stage(BootstrapStage::SyncingBodies);
        let paths = session.document_state().get_all_files().into_keys().collect();
        session
            .subscribe_bodies(
                paths,
                BodySyncOptions {
                    concurrency: self.options.body_sync_concurrency,
                    wait_for_complete: true,
                    timeout: self.options.body_sync_timeout,
                    progress: progress.clone(),
                },
            )
            .await?;

        self.finish(&workspace.id, session, metadata_synced, progress)
    }

    /// Create a workspace locally and on the server, then sync it.
    pub async fn create_new(
        &self,
        name: &str,
        progress: &ProgressReporter,
    ) -> Result<BootstrapOutcome> {
        let workspace = self.create_local(name).await?;
        self.upload_local(&workspace.id, progress).await
    }

    /// Seed a workspace from a user-supplied archive.
    ///
    /// The archive goes to the server and is expanded locally from the same
    /// bytes, so nothing is downloaded back.
    pub async fn import_archive(
        &self,
        name: &str,
        archive: Vec<u8>,
        progress: &ProgressReporter,
    ) -> Result<BootstrapOutcome> {
        progress.stage(BootstrapStage::Preparing);
        let (remote, import_mode) = self.create_remote(name).await?;
        let workspace =
            self.registry
                .register_synced(&remote.id, &remote.name, self.options.storage_kind)?;
        let storage = self.storage.open(&workspace)?;

        progress.stage(BootstrapStage::Uploading);
        self.remote
            .upload_snapshot(&workspace.id, archive.clone(), import_mode, progress)
            .await?;

        progress.stage(BootstrapStage::ImportingFiles);
        let summary = import_snapshot(storage.store.as_ref(), &archive, "", progress).await?;
        log::info!(
            "[Bootstrap] Imported archive into {}: {} files ({} skipped)",
            workspace.id,
            summary.imported,
            summary.skipped
        );

        let state = Arc::new(DocumentState::new(storage.store, storage.crdt)?);
        let session = self.start_session(&workspace, state, progress).await?;
        let metadata_synced = self.wait_for_metadata(&session, progress).await;

        self.finish(&workspace.id, session, metadata_synced, progress)
    }

    /// Reconnect a workspace that already syncs with the server.
    ///
    /// Local files stay the source of truth for what this device changed
    /// while offline. Bodies are requested once metadata sync finished or
    /// timed out.
    pub async fn resume(
        &self,
        workspace_id: &str,
        progress: &ProgressReporter,
    ) -> Result<BootstrapOutcome> {
        progress.stage(BootstrapStage::Preparing);
        let workspace = self
            .registry
            .get(workspace_id)?
            .ok_or_else(|| DiaryxError::WorkspaceNotFound(workspace_id.to_string()))?;
        if workspace.is_local {
            return Err(DiaryxError::InvalidState(format!(
                "workspace '{}' is local-only, upload it first",
                workspace.name
            )));
        }
        let storage = self.storage.open(&workspace)?;

        let state = Arc::new(DocumentState::new(storage.store, storage.crdt)?);
        let session = self.start_session(&workspace, state, progress).await?;
        let metadata_synced = self.wait_for_metadata(&session, progress).await;

        progress.stage(BootstrapStage::SyncingBodies);
        let paths = session.document_state().get_all_files().into_keys().collect();
        session
            .subscribe_bodies(
                paths,
                BodySyncOptions {
                    concurrency: self.options.body_sync_concurrency,
                    wait_for_complete: true,
                    timeout: self.options.body_sync_timeout,
                    progress: progress.clone(),
                },
            )
            .await?;

        self.finish(&workspace.id, session, metadata_synced, progress)
    }

    // ==================== Steps ====================

    async fn remote_name(&self, workspace_id: &str) -> Result<String> {
        let name = self
            .remote
            .list_workspaces()
            .await?
            .into_iter()
            .find(|w| w.id == workspace_id)
            .map(|w| w.name)
            .ok_or_else(|| DiaryxError::WorkspaceNotFound(workspace_id.to_string()))?;
        Ok(name)
    }

    /// Create a remote workspace, reusing an existing one on a name clash.
    ///
    /// Returns the workspace and the mode its first upload must use: a fresh
    /// workspace takes the configured mode, a reused one is only merged into
    /// so its files survive. A clash with a workspace this device already
    /// tracks is refused.
    async fn create_remote(&self, name: &str) -> Result<(RemoteWorkspace, SnapshotImportMode)> {
        match self.remote.create_workspace(name).await {
            Ok(remote) => {
                log::info!("[Bootstrap] Created remote workspace {} ({})", remote.id, name);
                Ok((remote, self.options.import_mode))
            }
            Err(DiaryxError::NameCollision {
                existing_id: Some(id),
                ..
            }) => {
                if self.registry.get(&id)?.is_some() {
                    return Err(DiaryxError::NameCollision {
                        name: name.to_string(),
                        existing_id: Some(id),
                    });
                }
                log::warn!(
                    "[Bootstrap] Remote workspace named '{}' exists, merging into {}",
                    name,
                    id
                );
                let remote = RemoteWorkspace {
                    id,
                    name: name.to_string(),
                };
                Ok((remote, SnapshotImportMode::Merge))
            }
            Err(e) => Err(e),
        }
    }

    /// Seed the replicas from the files on disk and connect.
    async fn start_session(
        &self,
        workspace: &Workspace,
        state: Arc<DocumentState>,
        progress: &ProgressReporter,
    ) -> Result<Arc<TransportSession>> {
        progress.stage(BootstrapStage::InitializingState);
        let seeded = state.initialize_from_files("").await?;
        state.persist()?;
        log::info!("[Bootstrap] Seeded {} entries from files", seeded);

        let conflicts = Arc::new(ConflictTracker::load(Arc::clone(&state)).await?);

        progress.stage(BootstrapStage::Connecting);
        let server_url = self
            .config
            .sync_websocket_url()
            .ok_or_else(|| DiaryxError::InvalidState("no server_url configured".into()))?;
        let options = SessionOptions {
            metadata_sync_timeout: self.options.metadata_sync_timeout,
            ..SessionOptions::from_config(&self.config)
        };
        let session = Arc::new(TransportSession::new(
            state,
            conflicts,
            Arc::clone(&self.connector),
            options,
        ));
        session.connect(&server_url, &workspace.id).await?;
        Ok(session)
    }

    async fn wait_for_metadata(
        &self,
        session: &TransportSession,
        progress: &ProgressReporter,
    ) -> bool {
        progress.stage(BootstrapStage::SyncingMetadata);
        session
            .wait_for_initial_metadata_sync(self.options.metadata_sync_timeout)
            .await
    }

    fn finish(
        &self,
        workspace_id: &str,
        session: Arc<TransportSession>,
        metadata_synced: bool,
        progress: &ProgressReporter,
    ) -> Result<BootstrapOutcome> {
        let workspace = self.registry.set_active(workspace_id)?;
        progress.stage(BootstrapStage::Complete);
        log::info!(
            "[Bootstrap] Workspace {} ready (metadata synced: {})",
            workspace.id,
            metadata_synced
        );
        Ok(BootstrapOutcome {
            workspace,
            session,
            metadata_synced,
        })
    }
}

/// Delete every non-hidden file and folder at the top of the store.
///
/// Engine bookkeeping under `.diaryx/` survives.
async fn clear_local_files(store: &dyn LocalStore) -> Result<usize> {
    let tree = store.list_tree("").await?;
    let mut cleared = 0;
    for child in &tree.children {
        if is_hidden(&child.name) {
            continue;
        }
        cleared += if child.is_dir { child.files().len() } else { 1 };
        match store.delete_entry(&child.path, child.is_dir).await {
            Ok(()) | Err(DiaryxError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(cleared)
}
