//! HTTP API of the remote authority.
//!
//! [`RemoteApi`] is the seam the orchestrator depends on; [`HttpRemote`] is the
//! `reqwest` implementation. Snapshot transfers are streamed in both
//! directions and report byte progress through a [`ProgressReporter`].

use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::error::{DiaryxError, Result};
use crate::progress::{BootstrapStage, ProgressReporter};
use crate::store::BoxFuture;

/// Upload chunk size for snapshot bodies.
const UPLOAD_CHUNK: usize = 64 * 1024;

/// A workspace as the server knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteWorkspace {
    /// Server-issued UUID
    pub id: String,
    /// Display name
    pub name: String,
}

/// How the server applies an uploaded snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotImportMode {
    /// Replace the server workspace with the snapshot
    #[default]
    Replace,
    /// Add snapshot files, keeping files the snapshot lacks
    Merge,
}

impl SnapshotImportMode {
    /// Query-string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotImportMode::Replace => "replace",
            SnapshotImportMode::Merge => "merge",
        }
    }
}

/// Operations the remote authority exposes over HTTP.
pub trait RemoteApi: Send + Sync {
    /// Whether the server answers its health check.
    fn health(&self) -> BoxFuture<'_, Result<bool>>;

    /// Workspaces the authenticated user owns.
    fn list_workspaces(&self) -> BoxFuture<'_, Result<Vec<RemoteWorkspace>>>;

    /// Create a workspace. A taken name yields [`DiaryxError::NameCollision`].
    fn create_workspace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<RemoteWorkspace>>;

    /// Rename a workspace.
    fn rename_workspace<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<RemoteWorkspace>>;

    /// Delete a workspace.
    fn delete_workspace<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Download the workspace snapshot archive.
    fn download_snapshot<'a>(
        &'a self,
        id: &'a str,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Upload a snapshot archive into the workspace.
    fn upload_snapshot<'a>(
        &'a self,
        id: &'a str,
        archive: Vec<u8>,
        mode: SnapshotImportMode,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Deserialize)]
struct CollisionBody {
    #[serde(default)]
    existing_id: Option<String>,
}

/// `reqwest` client for the sync server.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpRemote {
    /// Client for `base_url` (e.g. `https://sync.diaryx.org`).
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    /// Client for the server named in `config`.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let base = config
            .server_base()
            .ok_or_else(|| DiaryxError::InvalidState("no server_url configured".into()))?;
        Ok(Self::new(base, config.auth_token.clone()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Turn a non-success response into [`DiaryxError::Server`].
/// Detail line for a transfer whose size is unknown.
fn transfer_message(received: u64, total: u64) -> Option<String> {
    (total == 0).then(|| format!("{} bytes received", received))
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    log::error!("[Remote] Server returned {}: {}", status, message);
    Err(DiaryxError::Server {
        status: status.as_u16(),
        message,
    })
}

impl RemoteApi for HttpRemote {
    fn health(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let response = self.request(reqwest::Method::GET, "/health").send().await?;
            Ok(response.status().is_success())
        })
    }

    fn list_workspaces(&self) -> BoxFuture<'_, Result<Vec<RemoteWorkspace>>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::GET, "/api/workspaces")
                .send()
                .await?;
            Ok(check(response).await?.json().await?)
        })
    }

    fn create_workspace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<RemoteWorkspace>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::POST, "/api/workspaces")
                .json(&serde_json::json!({ "name": name }))
                .send()
                .await?;

            if response.status() == StatusCode::CONFLICT {
                let existing_id = response
                    .json::<CollisionBody>()
                    .await
                    .ok()
                    .and_then(|b| b.existing_id);
                log::warn!(
                    "[Remote] Workspace name '{}' taken (existing id {:?})",
                    name,
                    existing_id
                );
                return Err(DiaryxError::NameCollision {
                    name: name.to_string(),
                    existing_id,
                });
            }

            let workspace: RemoteWorkspace = check(response).await?.json().await?;
            log::info!("[Remote] Created workspace {} ({})", workspace.id, name);
            Ok(workspace)
        })
    }

    fn rename_workspace<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<RemoteWorkspace>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::PATCH, &format!("/api/workspaces/{}", id))
                .json(&serde_json::json!({ "name": name }))
                .send()
                .await?;
            Ok(check(response).await?.json().await?)
        })
    }

    fn delete_workspace<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::DELETE, &format!("/api/workspaces/{}", id))
                .send()
                .await?;
            check(response).await?;
            Ok(())
        })
    }

    fn download_snapshot<'a>(
        &'a self,
        id: &'a str,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let response = self
                .request(
                    reqwest::Method::GET,
                    &format!("/api/workspaces/{}/snapshot", id),
                )
                .send()
                .await?;
            let response = check(response).await?;

            // Chunked responses carry no length; progress then counts bytes only
            let total = response.content_length().unwrap_or(0);
            progress.report(BootstrapStage::Downloading, 0, total, None);

            let mut bytes = Vec::with_capacity(total as usize);
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                bytes.extend_from_slice(&chunk?);
                let received = bytes.len() as u64;
                progress.report(
                    BootstrapStage::Downloading,
                    received,
                    total,
                    transfer_message(received, total),
                );
            }

            log::info!("[Remote] Downloaded snapshot of {} ({} bytes)", id, bytes.len());
            Ok(bytes)
        })
    }

    fn upload_snapshot<'a>(
        &'a self,
        id: &'a str,
        archive: Vec<u8>,
        mode: SnapshotImportMode,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let total = archive.len() as u64;
            progress.report(BootstrapStage::Uploading, 0, total, None);

            let chunks: Vec<Vec<u8>> = archive.chunks(UPLOAD_CHUNK).map(<[u8]>::to_vec).collect();
            let reporter = progress.clone();
            let mut sent = 0u64;
            let stream = futures_util::stream::iter(chunks).map(move |chunk| {
                sent += chunk.len() as u64;
                reporter.report(BootstrapStage::Uploading, sent, total, None);
                Ok::<_, std::io::Error>(chunk)
            });

            let response = self
                .request(
                    reqwest::Method::POST,
                    &format!("/api/workspaces/{}/snapshot?mode={}", id, mode.as_str()),
                )
                .header(reqwest::header::CONTENT_TYPE, "application/zip")
                .header(reqwest::header::CONTENT_LENGTH, total)
                .body(reqwest::Body::wrap_stream(stream))
                .send()
                .await?;
            check(response).await?;

            log::info!("[Remote] Uploaded snapshot to {} ({} bytes)", id, total);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trimmed() {
        let remote = HttpRemote::new("https://sync.diaryx.org/", None);
        assert_eq!(
            remote.url("/api/workspaces"),
            "https://sync.diaryx.org/api/workspaces"
        );
    }

    #[test]
    fn test_from_config_requires_server() {
        assert!(HttpRemote::from_config(&SyncConfig::default()).is_err());
        let remote = HttpRemote::from_config(&SyncConfig::new("http://localhost:3030")).unwrap();
        assert_eq!(remote.url("/health"), "http://localhost:3030/health");
    }

    #[test]
    fn test_unknown_length_download_reports_bytes() {
        let progress = ProgressReporter::noop();
        progress.report(BootstrapStage::Downloading, 0, 0, None);
        for received in [4096, 8192] {
            progress.report(
                BootstrapStage::Downloading,
                received,
                0,
                transfer_message(received, 0),
            );
        }
        let latest = progress.latest().unwrap();
        assert_eq!(latest.completed, 8192);
        assert_eq!(latest.total, 0);
        assert_eq!(latest.message.as_deref(), Some("8192 bytes received"));
        assert_eq!(transfer_message(10, 100), None);
    }

    #[test]
    fn test_import_mode_serialization() {
        assert_eq!(SnapshotImportMode::Merge.as_str(), "merge");
        assert_eq!(
            serde_json::to_string(&SnapshotImportMode::Replace).unwrap(),
            "\"replace\""
        );
    }
}
