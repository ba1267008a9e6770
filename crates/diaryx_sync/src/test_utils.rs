//! Test utilities for diaryx_sync
//!
//! [`FakeServer`] is an in-process stand-in for the sync server. It implements
//! both the HTTP API ([`RemoteApi`]) and the channel connector
//! ([`SyncConnector`]), keeps one metadata replica and a set of body replicas
//! per workspace, and logs what it receives so tests can assert ordering.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crdt::{
    BodyDoc, MemoryStorage, SyncMessage, UpdateOrigin, WorkspaceCrdt, frame_body_message,
    unframe_body_message,
};
use crate::entry::parse_entry;
use crate::error::{DiaryxError, Result};
use crate::progress::ProgressReporter;
use crate::remote::{RemoteApi, RemoteWorkspace, SnapshotImportMode};
use crate::snapshot::{ExportFilter, export_snapshot, import_snapshot};
use crate::store::{BoxFuture, LocalStore, MemoryStore, is_markdown};
use crate::transport::{Connection, ControlMessage, SyncConnector, WireMessage};

struct ServerWorkspace {
    name: String,
    metadata: WorkspaceCrdt,
    bodies: HashMap<String, BodyDoc>,
    /// Files served as the snapshot
    files: BTreeMap<String, Vec<u8>>,
}

impl ServerWorkspace {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            metadata: WorkspaceCrdt::new(Arc::new(MemoryStorage::new())),
            bodies: HashMap::new(),
            files: BTreeMap::new(),
        }
    }

    fn body(&mut self, path: &str) -> &BodyDoc {
        self.bodies
            .entry(path.to_string())
            .or_insert_with(|| BodyDoc::new(Arc::new(MemoryStorage::new()), path))
    }
}

#[derive(Default)]
struct ServerState {
    workspaces: Mutex<BTreeMap<String, ServerWorkspace>>,
    events: Mutex<Vec<String>>,
    hold_metadata: AtomicBool,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerState {
    fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    fn handle_metadata(&self, id: &str, data: &[u8]) -> Vec<WireMessage> {
        let mut out = Vec::new();
        let Ok(messages) = SyncMessage::decode_all(data) else {
            return out;
        };
        let mut workspaces = self.workspaces.lock();
        let Some(ws) = workspaces.get_mut(id) else {
            return out;
        };

        for message in messages {
            match message {
                SyncMessage::SyncStep1(sv) => {
                    self.record("metadata:step1");
                    if self.hold_metadata.load(Ordering::SeqCst) {
                        self.record("metadata:held");
                        continue;
                    }
                    if let Ok(diff) = ws.metadata.encode_diff(&sv) {
                        self.record("metadata:step2");
                        out.push(WireMessage::Binary(SyncMessage::SyncStep2(diff).encode()));
                        out.push(WireMessage::Binary(
                            SyncMessage::SyncStep1(ws.metadata.encode_state_vector()).encode(),
                        ));
                        let complete = ControlMessage::SyncComplete {
                            files_synced: ws.metadata.file_count(),
                        };
                        if let Ok(text) = complete.to_wire() {
                            out.push(text);
                        }
                    }
                }
                SyncMessage::SyncStep2(update) => {
                    self.record("metadata:client_step2");
                    let _ = ws.metadata.apply_update(&update, UpdateOrigin::Remote);
                }
                SyncMessage::Update(update) => {
                    self.record("metadata:update");
                    let _ = ws.metadata.apply_update(&update, UpdateOrigin::Remote);
                }
            }
        }
        out
    }

    fn handle_body(&self, id: &str, data: &[u8]) -> Vec<WireMessage> {
        let mut out = Vec::new();
        let Ok((path, body_msg)) = unframe_body_message(data) else {
            return out;
        };
        let Ok(messages) = SyncMessage::decode_all(body_msg) else {
            return out;
        };
        let mut workspaces = self.workspaces.lock();
        let Some(ws) = workspaces.get_mut(id) else {
            return out;
        };
        let doc = ws.body(&path);

        for message in messages {
            match message {
                SyncMessage::SyncStep1(sv) => {
                    self.record(format!("body:step1:{}", path));
                    if let Ok(diff) = doc.encode_diff(&sv) {
                        let step2 = SyncMessage::SyncStep2(diff).encode();
                        let step1 = SyncMessage::SyncStep1(doc.encode_state_vector()).encode();
                        out.push(WireMessage::Binary(frame_body_message(&path, &step2)));
                        out.push(WireMessage::Binary(frame_body_message(&path, &step1)));
                    }
                }
                SyncMessage::SyncStep2(update) => {
                    self.record(format!("body:step2:{}", path));
                    let _ = doc.apply_update(&update, UpdateOrigin::Remote);
                }
                SyncMessage::Update(update) => {
                    self.record(format!("body:update:{}", path));
                    let _ = doc.apply_update(&update, UpdateOrigin::Remote);
                }
            }
        }
        out
    }
}

/// In-process sync server.
#[derive(Default)]
pub struct FakeServer {
    state: Arc<ServerState>,
}

impl FakeServer {
    /// An empty server.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a workspace holding `files`, with metadata and bodies already
    /// synced by some earlier device. Returns its id.
    pub fn seed_workspace(&self, name: &str, files: &[(&str, &str)]) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut ws = ServerWorkspace::new(name);
        for (path, content) in files {
            ws.files.insert(path.to_string(), content.as_bytes().to_vec());
            if let Ok((metadata, body)) = parse_entry(path, content) {
                let _ = ws.metadata.set_file(path, &metadata);
                let _ = ws.body(path).set_body(&body);
            }
        }
        self.state.workspaces.lock().insert(id.clone(), ws);
        id
    }

    /// Withhold metadata sync replies until released.
    pub fn hold_metadata(&self, hold: bool) {
        self.state.hold_metadata.store(hold, Ordering::SeqCst);
    }

    /// Everything the server received or answered, in order.
    pub fn events(&self) -> Vec<String> {
        self.state.events.lock().clone()
    }

    /// Current body of `path` in workspace `id`.
    pub fn body(&self, id: &str, path: &str) -> Option<String> {
        let workspaces = self.state.workspaces.lock();
        workspaces.get(id)?.bodies.get(path).map(|doc| doc.get_body())
    }

    /// Whether the metadata of workspace `id` holds a live entry at `path`.
    pub fn has_entry(&self, id: &str, path: &str) -> bool {
        let workspaces = self.state.workspaces.lock();
        workspaces
            .get(id)
            .and_then(|ws| ws.metadata.get_file(path))
            .is_some_and(|metadata| !metadata.deleted)
    }

    /// Poll until the body of `path` equals `expected`, up to two seconds.
    pub async fn wait_for_body(&self, id: &str, path: &str, expected: &str) -> bool {
        for _ in 0..200 {
            if self.body(id, path).as_deref() == Some(expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Edit a body on the server side and push the update to nobody.
    pub fn set_body(&self, id: &str, path: &str, body: &str) {
        let mut workspaces = self.state.workspaces.lock();
        if let Some(ws) = workspaces.get_mut(id) {
            let _ = ws.body(path).set_body(body);
        }
    }

    /// Drop every open channel, as a server restart would.
    pub fn drop_connections(&self) {
        for handle in self.state.connections.lock().drain(..) {
            handle.abort();
        }
    }
}

impl RemoteApi for FakeServer {
    fn health(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn list_workspaces(&self) -> BoxFuture<'_, Result<Vec<RemoteWorkspace>>> {
        Box::pin(async move {
            let workspaces = self.state.workspaces.lock();
            Ok(workspaces
                .iter()
                .map(|(id, ws)| RemoteWorkspace {
                    id: id.clone(),
                    name: ws.name.clone(),
                })
                .collect())
        })
    }

    fn create_workspace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<RemoteWorkspace>> {
        Box::pin(async move {
            let mut workspaces = self.state.workspaces.lock();
            if let Some((id, _)) = workspaces.iter().find(|(_, ws)| ws.name == name) {
                return Err(DiaryxError::NameCollision {
                    name: name.to_string(),
                    existing_id: Some(id.clone()),
                });
            }
            let id = uuid::Uuid::new_v4().to_string();
            workspaces.insert(id.clone(), ServerWorkspace::new(name));
            self.state.record(format!("create:{}", name));
            Ok(RemoteWorkspace {
                id,
                name: name.to_string(),
            })
        })
    }

    fn rename_workspace<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<RemoteWorkspace>> {
        Box::pin(async move {
            let mut workspaces = self.state.workspaces.lock();
            let ws = workspaces
                .get_mut(id)
                .ok_or_else(|| DiaryxError::WorkspaceNotFound(id.to_string()))?;
            ws.name = name.to_string();
            Ok(RemoteWorkspace {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
    }

    fn delete_workspace<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state
                .workspaces
                .lock()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| DiaryxError::WorkspaceNotFound(id.to_string()))
        })
    }

    fn download_snapshot<'a>(
        &'a self,
        id: &'a str,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.state.record(format!("download:{}", id));
            let files = {
                let workspaces = self.state.workspaces.lock();
                let ws = workspaces
                    .get(id)
                    .ok_or_else(|| DiaryxError::WorkspaceNotFound(id.to_string()))?;
                ws.files.clone()
            };
            let store = MemoryStore::with_files(files);
            let archive = export_snapshot(&store, "", &ExportFilter::all(), progress).await?;
            Ok(archive.bytes)
        })
    }

    fn upload_snapshot<'a>(
        &'a self,
        id: &'a str,
        archive: Vec<u8>,
        mode: SnapshotImportMode,
        _progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.record(format!("upload:{}", id));
            let store = MemoryStore::new();
            import_snapshot(&store, &archive, "", &ProgressReporter::noop()).await?;

            let mut files = BTreeMap::new();
            for path in store.paths() {
                files.insert(path.clone(), store.read_binary(&path).await?);
            }

            let mut workspaces = self.state.workspaces.lock();
            let ws = workspaces
                .get_mut(id)
                .ok_or_else(|| DiaryxError::WorkspaceNotFound(id.to_string()))?;
            if mode == SnapshotImportMode::Replace {
                for path in ws.metadata.list_active_files().into_iter().map(|(p, _)| p) {
                    if !files.contains_key(&path) {
                        let _ = ws.metadata.delete_file(&path);
                    }
                }
                ws.files.clear();
            }
            // Snapshots seed files and metadata only; bodies arrive over sync
            for (path, bytes) in &files {
                if is_markdown(path)
                    && let Ok(text) = std::str::from_utf8(bytes)
                    && let Ok((metadata, _)) = parse_entry(path, text)
                {
                    let _ = ws.metadata.set_file(path, &metadata);
                }
            }
            ws.files.extend(files);
            Ok(())
        })
    }
}

impl SyncConnector for FakeServer {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(async move {
            let parsed = url::Url::parse(url)?;
            let query: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
            let id = query
                .get("doc")
                .cloned()
                .ok_or_else(|| DiaryxError::Transport("missing doc parameter".into()))?;
            if !self.state.workspaces.lock().contains_key(&id) {
                return Err(DiaryxError::Transport(format!("unknown workspace {}", id)));
            }
            let multiplexed = query.get("multiplexed").is_some_and(|v| v == "true");
            self.state.record(if multiplexed {
                "connect:body"
            } else {
                "connect:metadata"
            });

            let (client_tx, mut client_rx) = mpsc::unbounded_channel::<WireMessage>();
            let (server_tx, server_rx) = mpsc::unbounded_channel::<WireMessage>();
            let state = Arc::clone(&self.state);

            let handle = tokio::spawn(async move {
                while let Some(message) = client_rx.recv().await {
                    let replies = match message {
                        WireMessage::Binary(data) if multiplexed => state.handle_body(&id, &data),
                        WireMessage::Binary(data) => state.handle_metadata(&id, &data),
                        WireMessage::Text(text) => {
                            if let Ok(ControlMessage::Unsubscribe { path }) =
                                serde_json::from_str::<ControlMessage>(&text)
                            {
                                state.record(format!("unsubscribe:{}", path));
                            }
                            Vec::new()
                        }
                        WireMessage::Ping => Vec::new(),
                        WireMessage::Close => break,
                    };
                    for reply in replies {
                        if server_tx.send(reply).is_err() {
                            return;
                        }
                    }
                }
            });
            self.state.connections.lock().push(handle);

            Ok(Connection {
                outgoing: client_tx,
                incoming: server_rx,
            })
        })
    }
}

