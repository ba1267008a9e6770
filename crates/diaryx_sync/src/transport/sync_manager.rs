//! Y-sync protocol handling for one workspace.
//!
//! [`SyncManager`] turns incoming frames into replica changes and replies, and
//! the outbox of [`DocumentState`] into outgoing frames. It owns no sockets;
//! the session moves its bytes.
//!
//! The metadata handshake always asks for the server's full state, so every
//! SyncStep2 on the metadata channel describes the complete remote view. That
//! view is checked for conflicts before it is merged.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::conflict::{ConflictRecord, ConflictTracker};
use crate::crdt::{SyncMessage, UpdateOrigin, WorkspaceCrdt, frame_body_message, unframe_body_message};
use crate::document_state::{DocKey, DocumentState};
use crate::error::Result;

/// Which channel a frame travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Workspace metadata
    Metadata,
    /// Multiplexed entry bodies
    Body,
}

/// Result of handling one metadata frame.
#[derive(Debug, Default)]
pub struct MetadataOutcome {
    /// Frames to send back on the metadata channel
    pub replies: Vec<Vec<u8>>,
    /// Whether the frame completed the handshake
    pub synced: bool,
    /// Entry paths whose metadata changed
    pub changed: Vec<String>,
    /// Conflicts opened by this frame
    pub conflicts: Vec<ConflictRecord>,
}

/// Protocol state machine shared by every connection of a session.
pub struct SyncManager {
    state: Arc<DocumentState>,
    conflicts: Arc<ConflictTracker>,
    subscriptions: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    fetches: Mutex<HashMap<String, Vec<oneshot::Sender<Vec<u8>>>>>,
    /// Metadata as the server sent it: the last handshake plus later updates
    server_view: Mutex<Option<WorkspaceCrdt>>,
}

impl SyncManager {
    /// Manager over `state`, judging conflicts with `conflicts`.
    pub fn new(state: Arc<DocumentState>, conflicts: Arc<ConflictTracker>) -> Self {
        Self {
            state,
            conflicts,
            subscriptions: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            server_view: Mutex::new(None),
        }
    }

    /// The replicas this manager syncs.
    pub fn state(&self) -> &Arc<DocumentState> {
        &self.state
    }

    /// First frame on a new metadata connection.
    pub fn metadata_handshake(&self) -> Vec<u8> {
        SyncMessage::full_state_request().encode()
    }

    /// Handle a frame from the metadata channel.
    pub async fn handle_metadata(&self, data: &[u8]) -> Result<MetadataOutcome> {
        let mut outcome = MetadataOutcome::default();

        for message in SyncMessage::decode_all(data)? {
            match message {
                SyncMessage::SyncStep1(remote_sv) => {
                    if self.state.is_outbox_held() {
                        log::debug!("[Transport] Outbox held, not answering metadata SyncStep1");
                        continue;
                    }
                    let diff = self.state.workspace().encode_diff(&remote_sv)?;
                    outcome.replies.push(SyncMessage::SyncStep2(diff).encode());
                }
                SyncMessage::SyncStep2(update) => {
                    let remote = WorkspaceCrdt::from_update(&update)?;
                    outcome.conflicts.extend(self.conflicts.detect(&remote));

                    let changed = self
                        .state
                        .apply_remote_metadata(&update, UpdateOrigin::Sync)
                        .await?;
                    if self.conflicts.record_agreed(&remote) {
                        self.conflicts.save_manifest().await?;
                    }

                    log::info!(
                        "[Transport] Metadata handshake complete: {} files from server, {} changed",
                        remote.file_count(),
                        changed.len()
                    );
                    outcome.changed.extend(changed);
                    outcome.synced = true;
                    *self.server_view.lock() = Some(remote);
                }
                SyncMessage::Update(update) => {
                    if let Some(view) = self.server_view.lock().as_ref() {
                        view.apply_update(&update, UpdateOrigin::Remote)?;
                    }
                    let changed = self
                        .state
                        .apply_remote_metadata(&update, UpdateOrigin::Remote)
                        .await?;
                    if self.conflicts.record_paths(&changed) {
                        self.conflicts.save_manifest().await?;
                    }
                    log::debug!("[Transport] Metadata update touched {:?}", changed);
                    outcome.changed.extend(changed);
                }
            }
        }

        Ok(outcome)
    }

    /// Replace the local metadata replica with the server's view.
    ///
    /// An empty replica results when no handshake completed yet. Returns the
    /// number of entries whose metadata changed.
    pub async fn rebase_on_server(&self) -> Result<usize> {
        let state = self
            .server_view
            .lock()
            .as_ref()
            .map(|view| view.encode_state_as_update())
            .unwrap_or_default();
        self.state.rebase_metadata(&state).await
    }

    /// Subscription request for `path` and a receiver that fires once the
    /// server answered it.
    pub fn body_subscription(&self, path: &str) -> (Vec<u8>, oneshot::Receiver<()>) {
        let doc = self.state.bodies().get_or_create(path);
        let step1 = SyncMessage::SyncStep1(doc.encode_state_vector()).encode();
        let (tx, rx) = oneshot::channel();
        self.subscriptions
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(tx);
        (frame_body_message(path, &step1), rx)
    }

    /// Full-state request for the body of `path` and a receiver for the
    /// server's answer.
    pub fn body_fetch(&self, path: &str) -> (Vec<u8>, oneshot::Receiver<Vec<u8>>) {
        let step1 = SyncMessage::full_state_request().encode();
        let (tx, rx) = oneshot::channel();
        self.fetches
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(tx);
        (frame_body_message(path, &step1), rx)
    }

    /// Handle a frame from the body channel. Returns framed replies.
    pub async fn handle_body(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let (path, body_msg) = unframe_body_message(data)?;
        let mut replies = Vec::new();

        for message in SyncMessage::decode_all(body_msg)? {
            match message {
                SyncMessage::SyncStep1(remote_sv) => {
                    if self.state.is_outbox_held() {
                        log::debug!("[Transport] Outbox held, not answering body SyncStep1 for {}", path);
                        continue;
                    }
                    let doc = self.state.bodies().get_or_create(&path);
                    let diff = doc.encode_diff(&remote_sv)?;
                    replies.push(frame_body_message(
                        &path,
                        &SyncMessage::SyncStep2(diff).encode(),
                    ));
                }
                SyncMessage::SyncStep2(update) => {
                    if let Some(waiters) = self.fetches.lock().remove(&path) {
                        for tx in waiters {
                            let _ = tx.send(update.clone());
                        }
                    }
                    let changed = self
                        .state
                        .apply_remote_body(&path, &update, UpdateOrigin::Sync)
                        .await?;
                    if changed {
                        log::debug!("[Transport] Body synced: {}", path);
                    }
                    if let Some(waiters) = self.subscriptions.lock().remove(&path) {
                        for tx in waiters {
                            let _ = tx.send(());
                        }
                    }
                }
                SyncMessage::Update(update) => {
                    self.state
                        .apply_remote_body(&path, &update, UpdateOrigin::Remote)
                        .await?;
                }
            }
        }

        Ok(replies)
    }

    /// Turn the outbox into frames.
    ///
    /// Metadata updates that leave count as agreed with the server.
    pub async fn drain_outbox(&self) -> Result<Vec<(Channel, Vec<u8>)>> {
        let queued = self.state.take_outbox();
        if queued.is_empty() {
            return Ok(Vec::new());
        }

        let mut frames = Vec::with_capacity(queued.len());
        let mut sent_paths = Vec::new();
        for item in queued {
            let message = SyncMessage::Update(item.update).encode();
            match item.key {
                DocKey::Metadata => {
                    frames.push((Channel::Metadata, message));
                    sent_paths.extend(item.paths);
                }
                DocKey::Body(path) => {
                    frames.push((Channel::Body, frame_body_message(&path, &message)));
                }
            }
        }

        if self.conflicts.record_paths(&sent_paths) {
            self.conflicts.save_manifest().await?;
        }
        log::debug!("[Transport] Flushing {} queued updates", frames.len());
        Ok(frames)
    }

    /// Drop every pending subscription and fetch. Their receivers error out.
    pub fn abandon_pending(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let fetches = std::mem::take(&mut *self.fetches.lock());
        if !subscriptions.is_empty() || !fetches.is_empty() {
            log::debug!(
                "[Transport] Abandoning {} subscriptions and {} fetches",
                subscriptions.len(),
                fetches.len()
            );
        }
    }
}
