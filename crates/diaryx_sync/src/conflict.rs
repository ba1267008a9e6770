//! Conflict detection and resolution.
//!
//! A conflict exists when the local and the remote side both modified an
//! entry since the last sync. The "last sync" is recorded per path in a
//! [`SyncManifest`]: the `modified_at` both sides agreed on. Without a recorded
//! base there is nothing to diverge from, so first syncs merge silently.
//!
//! [`ConflictTracker`] captures the local side of every detected conflict
//! before the remote state is merged, and holds remote writes to that entry
//! until the user picks a [`Resolution`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::crdt::{FileMetadata, WorkspaceCrdt};
use crate::document_state::DocumentState;
use crate::entry::parse_entry;
use crate::error::{DiaryxError, Result};
use crate::store::{BoxFuture, LocalStore, META_DIR};

/// Where the sync manifest lives inside a workspace.
pub const MANIFEST_PATH: &str = ".diaryx/sync-manifest.json";

/// Highest duplicate suffix tried before giving up.
const MAX_DUPLICATES: usize = 1000;

/// An unresolved conflict on one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ConflictRecord {
    /// Entry path
    pub path: String,
    /// Local `modified_at` when the conflict was detected
    pub local_modified_at: i64,
    /// Remote `modified_at` when the conflict was detected
    pub remote_modified_at: i64,
}

impl ConflictRecord {
    /// The resolution offered by default.
    pub fn proposed(&self) -> Resolution {
        propose_resolution(self.local_modified_at, self.remote_modified_at)
    }
}

impl From<&ConflictRecord> for DiaryxError {
    fn from(record: &ConflictRecord) -> Self {
        DiaryxError::Conflict {
            path: record.path.clone(),
            local_modified_at: record.local_modified_at,
            remote_modified_at: record.remote_modified_at,
        }
    }
}

/// How to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Resolution {
    /// Keep the local version, discard the remote one
    Local,
    /// Keep the remote version, discard the local one
    Remote,
    /// Keep the newer version in place and the other as a duplicate
    Both,
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "keep_local" | "keep-local" => Ok(Resolution::Local),
            "remote" | "keep_remote" | "keep-remote" => Ok(Resolution::Remote),
            "both" | "keep_both" | "keep-both" => Ok(Resolution::Both),
            other => Err(format!("unknown resolution: {}", other)),
        }
    }
}

/// Decide whether an entry is in conflict.
///
/// Both sides must differ from the recorded base and from each other.
pub fn detect_conflict(
    path: &str,
    local_modified_at: i64,
    remote_modified_at: i64,
    base: Option<i64>,
) -> Option<ConflictRecord> {
    let base = base?;
    if local_modified_at == base || remote_modified_at == base {
        return None;
    }
    if local_modified_at == remote_modified_at {
        return None;
    }
    Some(ConflictRecord {
        path: path.to_string(),
        local_modified_at,
        remote_modified_at,
    })
}

/// Later modification wins. Ties go to the remote side.
pub fn propose_resolution(local_modified_at: i64, remote_modified_at: i64) -> Resolution {
    if local_modified_at > remote_modified_at {
        Resolution::Local
    } else {
        Resolution::Remote
    }
}

/// Supplies the remote body of an entry when a resolution needs it.
pub trait RemoteBodySource: Send + Sync {
    /// The body text the remote authority holds for `path`.
    fn fetch_body<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Per-path `modified_at` both sides agreed on at the last sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifest {
    /// Format version
    pub version: u32,
    /// Agreed `modified_at` per entry path
    pub bases: BTreeMap<String, i64>,
}

impl SyncManifest {
    /// Current manifest format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Empty manifest.
    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            bases: BTreeMap::new(),
        }
    }

    /// Agreed `modified_at` of `path`.
    pub fn base(&self, path: &str) -> Option<i64> {
        self.bases.get(path).copied()
    }

    /// Record an agreed `modified_at`. Returns whether it changed.
    pub fn set_base(&mut self, path: &str, modified_at: i64) -> bool {
        self.bases.insert(path.to_string(), modified_at) != Some(modified_at)
    }

    /// Load from `store`; a missing manifest is empty.
    pub async fn load(store: &dyn LocalStore) -> Result<Self> {
        match store.read_text_opt(MANIFEST_PATH).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Self::new()),
        }
    }

    /// Write to `store`.
    pub async fn save(&self, store: &dyn LocalStore) -> Result<()> {
        debug_assert!(MANIFEST_PATH.starts_with(META_DIR));
        store
            .write_text(MANIFEST_PATH, &serde_json::to_string_pretty(self)?)
            .await
    }
}

#[derive(Debug, Clone)]
struct OpenConflict {
    record: ConflictRecord,
    local: (FileMetadata, String),
    remote: FileMetadata,
}

/// Outcome of applying a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionOutcome {
    /// The entry that was in conflict
    pub path: String,
    /// Where the losing side was written, for [`Resolution::Both`]
    pub duplicate: Option<String>,
}

/// Open conflicts of one workspace and the manifest they are judged against.
pub struct ConflictTracker {
    state: Arc<DocumentState>,
    manifest: Mutex<SyncManifest>,
    open: Mutex<BTreeMap<String, OpenConflict>>,
}

impl ConflictTracker {
    /// Tracker with the manifest stored in the workspace.
    pub async fn load(state: Arc<DocumentState>) -> Result<Self> {
        let manifest = SyncManifest::load(state.store().as_ref()).await?;
        Ok(Self::with_manifest(state, manifest))
    }

    /// Tracker with an explicit manifest.
    pub fn with_manifest(state: Arc<DocumentState>, manifest: SyncManifest) -> Self {
        Self {
            state,
            manifest: Mutex::new(manifest),
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// Compare the remote view with the local replica before merging it.
    ///
    /// Every new conflict captures the local entry and suspends remote writes
    /// to it. Returns the newly opened conflicts.
    pub fn detect(&self, remote: &WorkspaceCrdt) -> Vec<ConflictRecord> {
        let manifest = self.manifest.lock();
        let mut open = self.open.lock();
        let mut found = Vec::new();

        for (path, remote_meta) in remote.list_files() {
            if let Some(existing) = open.get_mut(&path) {
                existing.remote = remote_meta;
                continue;
            }
            if remote_meta.deleted {
                continue;
            }
            let Some(local) = self.state.local_snapshot(&path) else {
                continue;
            };
            let Some(record) = detect_conflict(
                &path,
                local.0.modified_at,
                remote_meta.modified_at,
                manifest.base(&path),
            ) else {
                continue;
            };

            log::warn!(
                "[Conflict] {} changed on both sides (local {}, remote {})",
                path,
                record.local_modified_at,
                record.remote_modified_at
            );
            self.state.suspend(&path);
            open.insert(
                path,
                OpenConflict {
                    record: record.clone(),
                    local,
                    remote: remote_meta,
                },
            );
            found.push(record);
        }
        found
    }

    /// Record the bases of every entry on which both replicas now agree.
    ///
    /// Called after a remote view was merged. Returns whether the manifest
    /// changed.
    pub fn record_agreed(&self, remote: &WorkspaceCrdt) -> bool {
        let open = self.open.lock();
        let mut manifest = self.manifest.lock();
        let mut changed = false;
        for (path, remote_meta) in remote.list_files() {
            if open.contains_key(&path) {
                continue;
            }
            if let Some(local) = self.state.workspace().get_file(&path)
                && local.modified_at == remote_meta.modified_at
            {
                changed |= manifest.set_base(&path, local.modified_at);
            }
        }
        changed
    }

    /// Record the current local `modified_at` of `paths` as agreed.
    ///
    /// Used once local updates for those paths were sent, or remote updates
    /// for them merged.
    pub fn record_paths(&self, paths: &[String]) -> bool {
        let open = self.open.lock();
        let mut manifest = self.manifest.lock();
        let mut changed = false;
        for path in paths {
            if open.contains_key(path) {
                continue;
            }
            if let Some(meta) = self.state.workspace().get_file(path) {
                changed |= manifest.set_base(path, meta.modified_at);
            }
        }
        changed
    }

    /// Agreed `modified_at` of `path`.
    pub fn base(&self, path: &str) -> Option<i64> {
        self.manifest.lock().base(path)
    }

    /// Persist the manifest.
    pub async fn save_manifest(&self) -> Result<()> {
        let manifest = self.manifest.lock().clone();
        manifest.save(self.state.store().as_ref()).await
    }

    /// Every open conflict, by path.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.open
            .lock()
            .values()
            .map(|open| open.record.clone())
            .collect()
    }

    /// Whether `path` has an open conflict.
    pub fn is_open(&self, path: &str) -> bool {
        self.open.lock().contains_key(path)
    }

    /// Apply `resolution` to the conflict on `path`.
    ///
    /// Steps are ordered so an interrupted resolution can simply be run
    /// again: the losing side is written before the winner replaces the
    /// original, and the manifest base moves last.
    pub async fn resolve(
        &self,
        path: &str,
        resolution: Resolution,
        remote_bodies: &dyn RemoteBodySource,
    ) -> Result<ResolutionOutcome> {
        let conflict = self.open.lock().get(path).cloned().ok_or_else(|| {
            DiaryxError::InvalidState(format!("no open conflict on '{}'", path))
        })?;
        let (local_meta, local_body) = conflict.local;

        let duplicate = match resolution {
            Resolution::Local => {
                self.state.write_entry(path, &local_meta, &local_body).await?;
                None
            }
            Resolution::Remote => {
                let remote_body = remote_bodies.fetch_body(path).await?;
                self.state
                    .write_entry(path, &conflict.remote, &remote_body)
                    .await?;
                None
            }
            Resolution::Both => {
                let remote_body = remote_bodies.fetch_body(path).await?;
                let local = (local_meta, local_body);
                let remote = (conflict.remote, remote_body);
                let (winner, loser) = match conflict.record.proposed() {
                    Resolution::Local => (local, remote),
                    _ => (remote, local),
                };

                let duplicate = self.duplicate_path(path, &loser.1).await?;
                let mut dup_meta = loser.0;
                dup_meta.contents = None;
                self.state.write_entry(&duplicate, &dup_meta, &loser.1).await?;
                if let Some(parent) = &dup_meta.part_of {
                    self.add_child(parent, &duplicate).await?;
                }

                self.state.write_entry(path, &winner.0, &winner.1).await?;
                Some(duplicate)
            }
        };

        self.state.resume(path);
        self.open.lock().remove(path);
        if let Some(meta) = self.state.workspace().get_file(path) {
            self.manifest.lock().set_base(path, meta.modified_at);
        }
        self.save_manifest().await?;

        log::info!(
            "[Conflict] Resolved {} as {:?}{}",
            path,
            resolution,
            duplicate
                .as_deref()
                .map(|d| format!(" (duplicate at {})", d))
                .unwrap_or_default()
        );
        Ok(ResolutionOutcome {
            path: path.to_string(),
            duplicate,
        })
    }

    /// A free duplicate path for `path`, or one already holding `body`.
    async fn duplicate_path(&self, path: &str, body: &str) -> Result<String> {
        let store = self.state.store();
        for n in 1..=MAX_DUPLICATES {
            let candidate = duplicate_name(path, n);
            match store.read_text_opt(&candidate).await? {
                None => return Ok(candidate),
                Some(text) => {
                    if parse_entry(&candidate, &text).is_ok_and(|(_, existing)| existing == body) {
                        log::debug!("[Conflict] Reusing duplicate {}", candidate);
                        return Ok(candidate);
                    }
                }
            }
        }
        Err(DiaryxError::InvalidState(format!(
            "no free duplicate name for '{}'",
            path
        )))
    }

    async fn add_child(&self, parent: &str, child: &str) -> Result<()> {
        let Some((mut meta, _)) = self.state.local_snapshot(parent) else {
            return Ok(());
        };
        let contents = meta.contents.get_or_insert_with(Vec::new);
        if contents.iter().any(|c| c == child) {
            return Ok(());
        }
        contents.push(child.to_string());
        self.state.set_metadata(parent, &meta).await
    }
}

impl std::fmt::Debug for ConflictTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictTracker")
            .field("open", &self.conflicts())
            .finish()
    }
}

/// `notes.md` → `notes.conflict.md`, then `notes.conflict-2.md`, ...
pub fn duplicate_name(path: &str, n: usize) -> String {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };
    let (stem, ext) = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file, None),
    };
    let suffix = if n <= 1 {
        "conflict".to_string()
    } else {
        format!("conflict-{}", n)
    };
    let name = match ext {
        Some(ext) => format!("{}.{}.{}", stem, suffix, ext),
        None => format!("{}.{}", stem, suffix),
    };
    match dir {
        Some(dir) => format!("{}/{}", dir, name),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::MemoryStorage;
    use crate::store::MemoryStore;

    struct FixedBodies(&'static str);

    impl RemoteBodySource for FixedBodies {
        fn fetch_body<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move { Ok(self.0.to_string()) })
        }
    }

    #[test]
    fn test_detect_requires_base_and_divergence() {
        assert!(detect_conflict("a.md", 2, 3, None).is_none());
        assert!(detect_conflict("a.md", 1, 3, Some(1)).is_none());
        assert!(detect_conflict("a.md", 2, 1, Some(1)).is_none());
        assert!(detect_conflict("a.md", 2, 2, Some(1)).is_none());
        assert_eq!(
            detect_conflict("a.md", 2, 3, Some(1)),
            Some(ConflictRecord {
                path: "a.md".into(),
                local_modified_at: 2,
                remote_modified_at: 3,
            })
        );
    }

    #[test]
    fn test_propose_prefers_newer_and_remote_on_tie() {
        assert_eq!(propose_resolution(5, 3), Resolution::Local);
        assert_eq!(propose_resolution(3, 5), Resolution::Remote);
        assert_eq!(propose_resolution(4, 4), Resolution::Remote);
    }

    #[test]
    fn test_resolution_from_str() {
        assert_eq!("keep-local".parse::<Resolution>(), Ok(Resolution::Local));
        assert_eq!("Both".parse::<Resolution>(), Ok(Resolution::Both));
        assert!("merge".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_duplicate_name() {
        assert_eq!(duplicate_name("notes.md", 1), "notes.conflict.md");
        assert_eq!(duplicate_name("a/b/notes.md", 2), "a/b/notes.conflict-2.md");
        assert_eq!(duplicate_name("README", 1), "README.conflict");
    }

    async fn tracker_with_conflict(local_body: &str) -> (Arc<MemoryStore>, ConflictTracker) {
        let store = Arc::new(MemoryStore::with_files([
            ("index.md", "---\ncontents:\n- notes.md\n---\n"),
            ("notes.md", "---\npart_of: index.md\n---\nbase"),
        ]));
        let state = Arc::new(
            DocumentState::new(store.clone(), Arc::new(MemoryStorage::new())).unwrap(),
        );
        state.initialize_from_files("").await.unwrap();

        let base = state.workspace().get_file("notes.md").unwrap().modified_at - 10;
        let mut manifest = SyncManifest::new();
        manifest.set_base("notes.md", base);
        let tracker = ConflictTracker::with_manifest(state.clone(), manifest);

        state.set_body("notes.md", local_body).await.unwrap();
        let local = state.workspace().get_file("notes.md").unwrap();

        let remote = WorkspaceCrdt::new(Arc::new(MemoryStorage::new()));
        let mut remote_meta = local.clone();
        remote_meta.title = Some("Remote".into());
        remote_meta.modified_at = local.modified_at + 5_000;
        remote.set_file("notes.md", &remote_meta).unwrap();

        let found = tracker.detect(&remote);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].proposed(), Resolution::Remote);
        assert!(state.is_suspended("notes.md"));
        assert!(tracker.is_open("notes.md"));
        (store, tracker)
    }

    #[tokio::test]
    async fn test_resolve_both_keeps_two_files() {
        let (store, tracker) = tracker_with_conflict("local text").await;
        let outcome = tracker
            .resolve("notes.md", Resolution::Both, &FixedBodies("remote text"))
            .await
            .unwrap();
        assert_eq!(outcome.duplicate.as_deref(), Some("notes.conflict.md"));

        let original = store.read_text("notes.md").await.unwrap();
        let duplicate = store.read_text("notes.conflict.md").await.unwrap();
        assert!(original.ends_with("remote text"));
        assert!(original.contains("title: Remote"));
        assert!(duplicate.ends_with("local text"));

        let index = store.read_text("index.md").await.unwrap();
        assert!(index.contains("notes.conflict.md"));
        assert!(tracker.conflicts().is_empty());
        assert!(!tracker.is_open("notes.md"));
        assert!(tracker.base("notes.md").is_some());
        assert!(store.read_text(MANIFEST_PATH).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_local_and_remote_keep_one_version() {
        let (store, tracker) = tracker_with_conflict("local text").await;
        tracker
            .resolve("notes.md", Resolution::Local, &FixedBodies("remote text"))
            .await
            .unwrap();
        assert!(store.read_text("notes.md").await.unwrap().ends_with("local text"));
        assert!(!store.paths().iter().any(|p| p.contains("conflict")));

        let (store, tracker) = tracker_with_conflict("local text").await;
        tracker
            .resolve("notes.md", Resolution::Remote, &FixedBodies("remote text"))
            .await
            .unwrap();
        assert!(store.read_text("notes.md").await.unwrap().ends_with("remote text"));
        assert!(!store.paths().iter().any(|p| p.contains("conflict")));
    }

    #[tokio::test]
    async fn test_duplicate_with_same_content_is_reused() {
        let (store, tracker) = tracker_with_conflict("local text").await;
        store
            .write_text("notes.conflict.md", "---\npart_of: index.md\n---\nlocal text")
            .await
            .unwrap();
        let outcome = tracker
            .resolve("notes.md", Resolution::Both, &FixedBodies("remote text"))
            .await
            .unwrap();
        assert_eq!(outcome.duplicate.as_deref(), Some("notes.conflict.md"));
        assert!(store.read_text("notes.conflict-2.md").await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_without_conflict_fails() {
        let (_, tracker) = tracker_with_conflict("x").await;
        assert!(matches!(
            tracker
                .resolve("other.md", Resolution::Local, &FixedBodies(""))
                .await,
            Err(DiaryxError::InvalidState(_))
        ));
    }
}
