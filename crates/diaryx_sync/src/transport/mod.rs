//! Transport Session: the live connection to the remote authority.
//!
//! A session opens two channels per workspace. The metadata channel carries
//! the workspace replica; the body channel multiplexes every entry body,
//! each frame prefixed with its path. Local edits queue in the outbox of
//! [`DocumentState`] and only leave once the metadata handshake finished (or
//! its wait timed out), so a freshly bootstrapped device never pushes stale
//! state ahead of the server's.
//!
//! ```ignore
//! let session = TransportSession::new(state, conflicts, Arc::new(TungsteniteConnector), options);
//! session.connect("wss://sync.diaryx.org/sync", "workspace123").await?;
//! session.wait_for_initial_metadata_sync(Duration::from_secs(30)).await;
//! session.subscribe_bodies(paths, BodySyncOptions::default()).await?;
//! ```

mod channel;
mod sync_manager;

pub use channel::{
    Connection, ControlMessage, SyncConnector, TungsteniteConnector, WireMessage,
    build_websocket_url,
};
pub use sync_manager::{Channel, MetadataOutcome, SyncManager};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use ts_rs::TS;

use crate::config::SyncConfig;
use crate::conflict::{ConflictTracker, RemoteBodySource};
use crate::crdt::{BodyDoc, MemoryStorage, UpdateOrigin};
use crate::document_state::DocumentState;
use crate::error::{DiaryxError, Result};
use crate::progress::{BootstrapStage, ProgressReporter};
use crate::store::BoxFuture;

/// Phase of a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SessionState {
    /// No connection
    Disconnected,
    /// Opening channels (first attempt or reconnect)
    Connecting,
    /// Connected, waiting for the metadata handshake
    MetadataSyncing,
    /// Metadata in sync, exchanging updates
    Steady,
    /// Steady, with an initial body backfill running
    BodySyncing,
}

/// Session knobs, usually taken from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Token appended to the channel URLs
    pub auth_token: Option<String>,
    /// Reconnect attempts before the session gives up
    pub max_reconnect_attempts: u32,
    /// Keepalive interval
    pub ping_interval: Duration,
    /// Used when a body sync starts before anyone waited for metadata
    pub metadata_sync_timeout: Duration,
    /// Deadline for a single full-state body fetch
    pub fetch_timeout: Duration,
}

impl SessionOptions {
    /// Options from a config file.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            auth_token: config.auth_token.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            ping_interval: config.ping_interval(),
            metadata_sync_timeout: config.metadata_sync_timeout(),
            fetch_timeout: config.metadata_sync_timeout(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// How [`TransportSession::subscribe_bodies`] runs.
#[derive(Debug, Clone)]
pub struct BodySyncOptions {
    /// Subscriptions in flight at once
    pub concurrency: usize,
    /// Wait for the server to answer every subscription
    pub wait_for_complete: bool,
    /// Overall deadline when waiting
    pub timeout: Duration,
    /// Receives `SyncingBodies` progress
    pub progress: ProgressReporter,
}

impl Default for BodySyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            wait_for_complete: false,
            timeout: Duration::from_secs(120),
            progress: ProgressReporter::noop(),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): 1s doubling up to 32s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(5);
    Duration::from_millis((1000u64 << exp).min(32_000))
}

#[derive(Debug, PartialEq, Eq)]
enum ConnectionEnd {
    Closed,
    Stopped,
}

struct Channels {
    metadata: tokio::sync::mpsc::UnboundedSender<WireMessage>,
    body: tokio::sync::mpsc::UnboundedSender<WireMessage>,
}

struct Shared {
    manager: SyncManager,
    conflicts: Arc<ConflictTracker>,
    connector: Arc<dyn SyncConnector>,
    options: SessionOptions,
    status: watch::Sender<SessionState>,
    /// Metadata handshake finished on the current connection
    metadata_synced: watch::Sender<bool>,
    /// Body traffic allowed: metadata synced once or its wait timed out
    gate: watch::Sender<bool>,
    stop: watch::Sender<bool>,
    channels: Mutex<Option<Channels>>,
    subscribed: Mutex<BTreeSet<String>>,
}

/// Connection to the remote authority for one workspace.
///
/// Two channels are kept open: one for the metadata replica and one
/// multiplexing every body replica. Dropping the session stops it.
pub struct TransportSession {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportSession {
    /// A disconnected session over `state`.
    pub fn new(
        state: Arc<DocumentState>,
        conflicts: Arc<ConflictTracker>,
        connector: Arc<dyn SyncConnector>,
        options: SessionOptions,
    ) -> Self {
        let shared = Shared {
            manager: SyncManager::new(state, Arc::clone(&conflicts)),
            conflicts,
            connector,
            options,
            status: watch::Sender::new(SessionState::Disconnected),
            metadata_synced: watch::Sender::new(false),
            gate: watch::Sender::new(false),
            stop: watch::Sender::new(false),
            channels: Mutex::new(None),
            subscribed: Mutex::new(BTreeSet::new()),
        };
        Self {
            shared: Arc::new(shared),
            task: Mutex::new(None),
        }
    }

    /// Current phase.
    pub fn state(&self) -> SessionState {
        *self.shared.status.borrow()
    }

    /// Observe phase changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.status.subscribe()
    }

    /// Whether the metadata handshake finished on the current connection.
    pub fn is_metadata_synced(&self) -> bool {
        *self.shared.metadata_synced.borrow()
    }

    /// The replicas this session syncs.
    pub fn document_state(&self) -> &Arc<DocumentState> {
        self.shared.manager.state()
    }

    /// Conflicts detected by this session.
    pub fn conflicts(&self) -> &Arc<ConflictTracker> {
        &self.shared.conflicts
    }

    /// Paths whose bodies are kept subscribed.
    pub fn subscribed(&self) -> Vec<String> {
        self.shared.subscribed.lock().iter().cloned().collect()
    }

    /// Open both channels for `workspace_id` on `server_url` (a `ws(s)://`
    /// endpoint) and start syncing in the background.
    ///
    /// The first connection attempt is awaited so its failure reaches the
    /// caller; later drops reconnect with backoff.
    pub async fn connect(&self, server_url: &str, workspace_id: &str) -> Result<()> {
        if self.task.lock().as_ref().is_some_and(|t| !t.is_finished()) {
            log::debug!("[Transport] Already connected");
            return Ok(());
        }

        let token = self.shared.options.auth_token.as_deref();
        let metadata_url = build_websocket_url(server_url, workspace_id, false, token)?;
        let body_url = build_websocket_url(server_url, workspace_id, true, token)?;

        self.shared.stop.send_replace(false);
        self.shared.set_status(SessionState::Connecting);
        log::info!("[Transport] Connecting workspace {}", workspace_id);

        let first = match self.shared.open(&metadata_url, &body_url).await {
            Ok(connections) => connections,
            Err(e) => {
                log::error!("[Transport] Connection failed: {}", e);
                self.shared.set_status(SessionState::Disconnected);
                return Err(e);
            }
        };

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            shared.run(metadata_url, body_url, first).await;
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Wait until the metadata handshake finishes.
    ///
    /// Returns `false` on timeout. A timeout is not an error: syncing carries
    /// on in the background and body traffic is allowed from then on.
    pub async fn wait_for_initial_metadata_sync(&self, timeout: Duration) -> bool {
        let mut synced = self.shared.metadata_synced.subscribe();
        let reached = async move { synced.wait_for(|s| *s).await.is_ok() };
        match tokio::time::timeout(timeout, reached).await {
            Ok(reached) => reached,
            Err(_) => {
                log::warn!(
                    "[Transport] Metadata sync not complete after {}ms, continuing in background",
                    timeout.as_millis()
                );
                self.shared.gate.send_replace(true);
                false
            }
        }
    }

    /// Subscribe to the bodies of `paths`.
    ///
    /// Never starts before metadata sync finished or timed out. At most
    /// `concurrency` subscriptions are in flight. With `wait_for_complete`,
    /// returns once the server answered all of them or `timeout` passed; a
    /// timeout only ends the wait, and the remaining subscriptions keep going
    /// out in the background until the session stops.
    pub async fn subscribe_bodies(&self, paths: Vec<String>, options: BodySyncOptions) -> Result<()> {
        if !*self.shared.gate.borrow() {
            self.wait_for_initial_metadata_sync(self.shared.options.metadata_sync_timeout)
                .await;
        }
        if paths.is_empty() {
            return Ok(());
        }

        self.shared.subscribed.lock().extend(paths.iter().cloned());
        let backfill = self.state() == SessionState::Steady;
        if backfill {
            self.shared.set_status(SessionState::BodySyncing);
        }

        let total = paths.len() as u64;
        let completed = Arc::new(AtomicU64::new(0));
        let wait = options.wait_for_complete;
        options
            .progress
            .report(BootstrapStage::SyncingBodies, 0, total, None);

        let mut fanout = tokio::spawn(Shared::fan_out(
            Arc::clone(&self.shared),
            paths,
            options.concurrency.max(1),
            wait,
            Arc::clone(&completed),
            options.progress.clone(),
        ));

        if wait {
            match tokio::time::timeout(options.timeout, &mut fanout).await {
                Ok(_) => log::info!("[Transport] Body sync complete for {} files", total),
                Err(_) => log::warn!(
                    "[Transport] Body sync timed out after {}ms ({}/{} files), continuing in background",
                    options.timeout.as_millis(),
                    completed.load(Ordering::SeqCst),
                    total
                ),
            }
        } else {
            let _ = fanout.await;
            log::info!("[Transport] Requested bodies for {} files", total);
        }

        if backfill && self.state() == SessionState::BodySyncing {
            self.shared.set_status(SessionState::Steady);
        }
        Ok(())
    }

    /// Drop the local updates captured before this session connected and
    /// rebuild the metadata replica from what the server sent.
    ///
    /// Later local edits must not build on the dropped operations, which the
    /// server never sees. When no metadata arrived yet the replica starts
    /// empty and the pending handshake fills it. Returns how many updates
    /// were dropped.
    pub async fn discard_local_updates(&self, reason: &str) -> Result<usize> {
        let discarded = self.document_state().discard_queued_local_updates(reason)?;
        let rebased = self.shared.manager.rebase_on_server().await?;
        log::info!(
            "[Transport] Metadata replica rebuilt from server state ({} entries changed)",
            rebased
        );
        Ok(discarded)
    }

    /// Stop receiving body updates for `path`.
    pub fn unsubscribe(&self, path: &str) -> Result<()> {
        self.shared.subscribed.lock().remove(path);
        let message = ControlMessage::Unsubscribe {
            path: path.to_string(),
        }
        .to_wire()?;
        self.shared.send(Channel::Body, message);
        Ok(())
    }

    /// Close the channels and stop reconnecting. Safe in any state.
    ///
    /// Pending subscriptions and fetches are abandoned; a later `connect`
    /// resubscribes every path still subscribed.
    pub async fn disconnect(&self) {
        self.shared.stop.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(mut handle) = handle
            && tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
        {
            handle.abort();
        }
        self.shared.teardown();
        log::info!("[Transport] Disconnected");
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.shared.stop.send_replace(true);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl RemoteBodySource for TransportSession {
    fn fetch_body<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let answer = {
                let channels = self.shared.channels.lock();
                let channels = channels
                    .as_ref()
                    .ok_or_else(|| DiaryxError::Transport("not connected".into()))?;
                let (frame, answer) = self.shared.manager.body_fetch(path);
                channels
                    .body
                    .send(WireMessage::Binary(frame))
                    .map_err(|_| DiaryxError::Transport("body channel closed".into()))?;
                answer
            };

            let timeout = self.shared.options.fetch_timeout;
            let update = tokio::time::timeout(timeout, answer)
                .await
                .map_err(|_| DiaryxError::Timeout {
                    operation: format!("remote body of {}", path),
                    after_ms: timeout.as_millis() as u64,
                })?
                .map_err(|_| DiaryxError::Transport("connection closed".into()))?;

            let scratch = BodyDoc::new(Arc::new(MemoryStorage::new()), path);
            scratch.apply_update(&update, UpdateOrigin::Sync)?;
            Ok(scratch.get_body())
        })
    }
}

impl Shared {
    fn set_status(&self, state: SessionState) {
        let previous = self.status.send_replace(state);
        if previous != state {
            log::info!("[Transport] {:?} -> {:?}", previous, state);
        }
    }

    fn send(&self, channel: Channel, message: WireMessage) {
        let channels = self.channels.lock();
        let Some(channels) = channels.as_ref() else {
            log::debug!("[Transport] Not connected, dropping {:?} frame", channel);
            return;
        };
        let tx = match channel {
            Channel::Metadata => &channels.metadata,
            Channel::Body => &channels.body,
        };
        if tx.send(message).is_err() {
            log::debug!("[Transport] {:?} channel closed", channel);
        }
    }

    fn send_subscription(&self, path: &str) -> Option<oneshot::Receiver<()>> {
        if self.channels.lock().is_none() {
            log::debug!("[Transport] Not connected, {} will subscribe on connect", path);
            return None;
        }
        let (frame, answered) = self.manager.body_subscription(path);
        self.send(Channel::Body, WireMessage::Binary(frame));
        Some(answered)
    }

    /// Send the subscription of every path, `concurrency` at a time, and
    /// count answers. Ends early when the session stops.
    async fn fan_out(
        shared: Arc<Shared>,
        paths: Vec<String>,
        concurrency: usize,
        wait: bool,
        completed: Arc<AtomicU64>,
        progress: ProgressReporter,
    ) {
        let total = paths.len() as u64;
        let semaphore = Semaphore::new(concurrency);
        let work = futures_util::future::join_all(paths.iter().map(|path| {
            let semaphore = &semaphore;
            let shared = &shared;
            let completed = &completed;
            let progress = &progress;
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let Some(answered) = shared.send_subscription(path) else {
                    return;
                };
                if wait && answered.await.is_err() {
                    log::debug!("[Transport] Subscription to {} abandoned", path);
                    return;
                }
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                progress.report(BootstrapStage::SyncingBodies, done, total, Some(path.clone()));
            }
        }));

        let mut stop = shared.stop.subscribe();
        let stopped = async move {
            let _ = stop.wait_for(|s| *s).await;
        };
        tokio::select! {
            _ = work => {}
            _ = stopped => log::debug!("[Transport] Session stopped, ending body fan-out"),
        }
    }

    async fn open(&self, metadata_url: &str, body_url: &str) -> Result<(Connection, Connection)> {
        let metadata = self.connector.connect(metadata_url).await?;
        let body = self.connector.connect(body_url).await?;
        Ok((metadata, body))
    }

    async fn run(&self, metadata_url: String, body_url: String, first: (Connection, Connection)) {
        let mut next = Some(first);
        let mut attempts: u32 = 0;

        loop {
            let connections = match next.take() {
                Some(connections) => Some(connections),
                None => match self.open(&metadata_url, &body_url).await {
                    Ok(connections) => Some(connections),
                    Err(e) => {
                        log::error!("[Transport] Reconnect failed: {}", e);
                        None
                    }
                },
            };

            if let Some((metadata, body)) = connections {
                attempts = 0;
                if self.run_connection(metadata, body).await == ConnectionEnd::Stopped {
                    break;
                }
            }
            if *self.stop.borrow() {
                break;
            }

            attempts += 1;
            if attempts > self.options.max_reconnect_attempts {
                log::error!("[Transport] Max reconnect attempts reached");
                break;
            }
            let delay = reconnect_delay(attempts);
            log::warn!(
                "[Transport] Reconnecting in {}ms (attempt {})",
                delay.as_millis(),
                attempts
            );
            self.set_status(SessionState::Connecting);

            let mut stop = self.stop.subscribe();
            let stopped = async move {
                let _ = stop.wait_for(|s| *s).await;
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped => break,
            }
        }

        self.teardown();
    }

    fn teardown(&self) {
        if let Some(channels) = self.channels.lock().take() {
            let _ = channels.metadata.send(WireMessage::Close);
            let _ = channels.body.send(WireMessage::Close);
        }
        self.manager.abandon_pending();
        self.metadata_synced.send_replace(false);
        self.set_status(SessionState::Disconnected);
    }

    async fn run_connection(&self, metadata: Connection, body: Connection) -> ConnectionEnd {
        let Connection {
            outgoing: metadata_tx,
            incoming: mut metadata_rx,
        } = metadata;
        let Connection {
            outgoing: body_tx,
            incoming: mut body_rx,
        } = body;

        *self.channels.lock() = Some(Channels {
            metadata: metadata_tx,
            body: body_tx,
        });
        self.metadata_synced.send_replace(false);
        self.set_status(SessionState::MetadataSyncing);
        self.send(
            Channel::Metadata,
            WireMessage::Binary(self.manager.metadata_handshake()),
        );

        let mut stop = self.stop.subscribe();
        let mut gate = self.gate.subscribe();
        let mut resubscribed = false;
        let period = self.options.ping_interval;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let state = Arc::clone(self.manager.state());

        let end = loop {
            if *stop.borrow() {
                break ConnectionEnd::Stopped;
            }
            tokio::select! {
                _ = stop.changed() => {}
                frame = metadata_rx.recv() => match frame {
                    None => break ConnectionEnd::Closed,
                    Some(WireMessage::Binary(data)) => {
                        match self.manager.handle_metadata(&data).await {
                            Ok(outcome) => {
                                for reply in outcome.replies {
                                    self.send(Channel::Metadata, WireMessage::Binary(reply));
                                }
                                if outcome.synced {
                                    self.on_metadata_synced(&mut resubscribed).await;
                                }
                            }
                            Err(e) => log::warn!("[Transport] Bad metadata frame: {}", e),
                        }
                    }
                    Some(WireMessage::Text(text)) => {
                        if self.on_control(Channel::Metadata, &text) {
                            self.on_metadata_synced(&mut resubscribed).await;
                        }
                    }
                    Some(_) => {}
                },
                frame = body_rx.recv() => match frame {
                    None => break ConnectionEnd::Closed,
                    Some(WireMessage::Binary(data)) => match self.manager.handle_body(&data).await {
                        Ok(replies) => {
                            for reply in replies {
                                self.send(Channel::Body, WireMessage::Binary(reply));
                            }
                        }
                        Err(e) => log::warn!("[Transport] Bad body frame: {}", e),
                    },
                    Some(WireMessage::Text(text)) => {
                        self.on_control(Channel::Body, &text);
                    }
                    Some(_) => {}
                },
                _ = state.outbox_changed(), if *gate.borrow() => self.flush().await,
                changed = gate.changed() => {
                    if changed.is_ok() && *gate.borrow() {
                        self.flush().await;
                    }
                }
                _ = ping.tick() => {
                    self.send(Channel::Metadata, WireMessage::Ping);
                    self.send(Channel::Body, WireMessage::Ping);
                }
            }
        };

        log::info!("[Transport] Connection ended: {:?}", end);
        if let Some(channels) = self.channels.lock().take() {
            let _ = channels.metadata.send(WireMessage::Close);
            let _ = channels.body.send(WireMessage::Close);
        }
        self.manager.abandon_pending();
        self.metadata_synced.send_replace(false);
        end
    }

    async fn on_metadata_synced(&self, resubscribed: &mut bool) {
        self.metadata_synced.send_replace(true);
        self.gate.send_replace(true);
        if *self.status.borrow() == SessionState::MetadataSyncing {
            self.set_status(SessionState::Steady);
        }
        self.flush().await;

        if !*resubscribed {
            *resubscribed = true;
            let paths: Vec<String> = self.subscribed.lock().iter().cloned().collect();
            if !paths.is_empty() {
                log::info!("[Transport] Resubscribing {} bodies", paths.len());
            }
            for path in paths {
                self.send_subscription(&path);
            }
        }
    }

    /// Returns whether the message marks the metadata handshake complete.
    fn on_control(&self, channel: Channel, text: &str) -> bool {
        let Ok(message) = serde_json::from_str::<ControlMessage>(text) else {
            log::debug!("[Transport] Ignoring non-control text frame");
            return false;
        };
        match message {
            ControlMessage::SyncProgress { completed, total } => {
                log::debug!("[Transport] {:?} progress {}/{}", channel, completed, total);
            }
            ControlMessage::SyncComplete { files_synced } => {
                log::info!("[Transport] {:?} sync complete ({} files)", channel, files_synced);
                return channel == Channel::Metadata;
            }
            ControlMessage::PeerJoined { peer_count } => {
                log::info!("[Transport] Peer joined ({} connected)", peer_count);
            }
            ControlMessage::PeerLeft { peer_count } => {
                log::info!("[Transport] Peer left ({} connected)", peer_count);
            }
            ControlMessage::Unsubscribe { .. } | ControlMessage::Other => {}
        }
        false
    }

    async fn flush(&self) {
        match self.manager.drain_outbox().await {
            Ok(frames) => {
                for (channel, frame) in frames {
                    self.send(channel, WireMessage::Binary(frame));
                }
            }
            Err(e) => log::warn!("[Transport] Failed to flush local updates: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::SyncManifest;
    use crate::store::MemoryStore;
    use crate::test_utils::FakeServer;

    const URL: &str = "ws://sync.test/sync";

    fn session(server: &Arc<FakeServer>) -> TransportSession {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(DocumentState::new(store, Arc::new(MemoryStorage::new())).unwrap());
        let conflicts = Arc::new(ConflictTracker::with_manifest(
            state.clone(),
            SyncManifest::new(),
        ));
        TransportSession::new(state, conflicts, server.clone(), SessionOptions::default())
    }

    fn waiting(timeout_ms: u64) -> BodySyncOptions {
        BodySyncOptions {
            wait_for_complete: true,
            timeout: Duration::from_millis(timeout_ms),
            ..BodySyncOptions::default()
        }
    }

    #[tokio::test]
    async fn test_metadata_then_bodies() {
        let server = FakeServer::new();
        let ws = server.seed_workspace("W", &[("a.md", "---\ntitle: A\n---\nAlpha")]);
        let session = session(&server);

        session.connect(URL, &ws).await.unwrap();
        assert!(session.wait_for_initial_metadata_sync(Duration::from_secs(2)).await);
        assert_eq!(session.state(), SessionState::Steady);
        assert!(session.document_state().workspace().get_file("a.md").is_some());

        session
            .subscribe_bodies(vec!["a.md".into()], waiting(2_000))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Steady);
        let body = session.document_state().bodies().get("a.md").unwrap().get_body();
        assert_eq!(body, "Alpha");
        let file = session.document_state().store().read_text("a.md").await.unwrap();
        assert!(file.ends_with("Alpha"));

        let events = server.events();
        let step2 = events.iter().position(|e| e == "metadata:step2").unwrap();
        let body = events.iter().position(|e| e == "body:step1:a.md").unwrap();
        assert!(step2 < body);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_metadata_timeout_continues_in_background() {
        let server = FakeServer::new();
        let ws = server.seed_workspace("W", &[("a.md", "---\ntitle: A\n---\nAlpha")]);
        server.hold_metadata(true);
        let session = session(&server);

        session.connect(URL, &ws).await.unwrap();
        assert!(!session.wait_for_initial_metadata_sync(Duration::from_millis(100)).await);
        assert_eq!(session.state(), SessionState::MetadataSyncing);

        // Body traffic is allowed once the wait gave up
        session
            .subscribe_bodies(vec!["a.md".into()], waiting(2_000))
            .await
            .unwrap();
        assert!(server.events().contains(&"body:step1:a.md".to_string()));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_body_timeout_keeps_requesting_in_background() {
        let server = FakeServer::new();
        let files: Vec<(String, String)> = (0..10)
            .map(|i| (format!("e{}.md", i), format!("---\ntitle: E{}\n---\nBody {}", i, i)))
            .collect();
        let seeded: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        let ws = server.seed_workspace("W", &seeded);
        let session = session(&server);
        session.connect(URL, &ws).await.unwrap();
        assert!(session.wait_for_initial_metadata_sync(Duration::from_secs(2)).await);

        let paths: Vec<String> = files.iter().map(|(p, _)| p.clone()).collect();
        session
            .subscribe_bodies(
                paths.clone(),
                BodySyncOptions {
                    concurrency: 1,
                    ..waiting(0)
                },
            )
            .await
            .unwrap();

        let mut synced = 0;
        for _ in 0..200 {
            synced = paths
                .iter()
                .filter(|p| {
                    session
                        .document_state()
                        .bodies()
                        .get(p)
                        .is_some_and(|doc| !doc.get_body().is_empty())
                })
                .count();
            if synced == paths.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(synced, 10);
        let requested = server
            .events()
            .iter()
            .filter(|e| e.starts_with("body:step1:"))
            .count();
        assert_eq!(requested, 10);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_records_paths() {
        let server = FakeServer::new();
        let session = session(&server);

        session.shared.gate.send_replace(true);
        session
            .subscribe_bodies(vec!["a.md".into()], waiting(50))
            .await
            .unwrap();
        assert_eq!(session.subscribed(), vec!["a.md"]);
        assert!(server.events().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_in_any_state() {
        let server = FakeServer::new();
        let ws = server.seed_workspace("W", &[]);
        let session = session(&server);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect(URL, &ws).await.unwrap();
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_metadata_synced());

        // Reconnecting after a disconnect works
        session.connect(URL, &ws).await.unwrap();
        assert!(session.wait_for_initial_metadata_sync(Duration::from_secs(2)).await);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_to_unknown_workspace_fails() {
        let server = FakeServer::new();
        let session = session(&server);
        assert!(session.connect(URL, "missing").await.is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_resubscribes_after_reconnect() {
        let server = FakeServer::new();
        let ws = server.seed_workspace("W", &[("a.md", "---\ntitle: A\n---\nAlpha")]);
        let session = session(&server);

        session.connect(URL, &ws).await.unwrap();
        session
            .subscribe_bodies(vec!["a.md".into()], waiting(2_000))
            .await
            .unwrap();

        server.set_body(&ws, "a.md", "Alpha, edited while away");
        server.drop_connections();

        let mut resynced = false;
        for _ in 0..300 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let body = session.document_state().bodies().get("a.md").map(|d| d.get_body());
            if body.as_deref() == Some("Alpha, edited while away") {
                resynced = true;
                break;
            }
        }
        assert!(resynced);
        let connects = server.events().iter().filter(|e| *e == "connect:body").count();
        assert_eq!(connects, 2);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_fetch_remote_body() {
        let server = FakeServer::new();
        let ws = server.seed_workspace("W", &[("a.md", "---\ntitle: A\n---\nAlpha")]);
        let session = session(&server);

        assert!(session.fetch_body("a.md").await.is_err());
        session.connect(URL, &ws).await.unwrap();
        server.set_body(&ws, "a.md", "Remote text");
        assert_eq!(session.fetch_body("a.md").await.unwrap(), "Remote text");
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_sends_control_message() {
        let server = FakeServer::new();
        let ws = server.seed_workspace("W", &[]);
        let session = session(&server);
        session.connect(URL, &ws).await.unwrap();
        session.wait_for_initial_metadata_sync(Duration::from_secs(2)).await;

        session.unsubscribe("a.md").unwrap();
        let mut seen = false;
        for _ in 0..100 {
            if server.events().contains(&"unsubscribe:a.md".to_string()) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);
        session.disconnect().await;
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let delays: Vec<u64> = (1..=8).map(|n| reconnect_delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 32000, 32000, 32000]);
    }

    #[test]
    fn test_session_state_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionState::MetadataSyncing).unwrap(),
            "\"metadata_syncing\""
        );
    }

    #[test]
    fn test_options_from_config() {
        let mut config = SyncConfig::new("https://x.org");
        config.auth_token = Some("tok".into());
        config.max_reconnect_attempts = 3;
        let options = SessionOptions::from_config(&config);
        assert_eq!(options.auth_token.as_deref(), Some("tok"));
        assert_eq!(options.max_reconnect_attempts, 3);
        assert_eq!(options.ping_interval, Duration::from_secs(30));
    }
}
