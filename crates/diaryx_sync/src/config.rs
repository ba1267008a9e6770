//! Configuration for the sync engine.
//!
//! [`SyncConfig`] holds the server location, credentials and the timing knobs
//! the Bootstrap Orchestrator and Transport Session use. It is persisted as
//! TOML (typically at `~/.config/diaryx/sync.toml` on Unix systems).
//!
//! # Example
//!
//! ```ignore
//! use diaryx_sync::config::SyncConfig;
//!
//! let mut config = SyncConfig::load()?;
//! config.server_url = Some("https://sync.diaryx.org".into());
//! config.save()?;
//!
//! let ws = config.sync_websocket_url(); // wss://sync.diaryx.org/sync
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiaryxError, Result};
use crate::store::LocalStore;

/// User-configurable parts of the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sync server URL (e.g., "https://sync.diaryx.org")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    /// Bearer token for authenticated requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// How long bootstrap waits for the initial metadata sync
    pub metadata_sync_timeout_ms: u64,

    /// Overall timeout for the proactive body push after bootstrap
    pub body_sync_timeout_ms: u64,

    /// Concurrent body subscriptions during backfill
    pub body_sync_concurrency: usize,

    /// Reconnect attempts before the session gives up
    pub max_reconnect_attempts: u32,

    /// Keepalive ping interval
    pub ping_interval_secs: u64,

    /// Location of the workspace registry database
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,

    /// Directory holding one storage directory per workspace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspaces_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            auth_token: None,
            metadata_sync_timeout_ms: 30_000,
            body_sync_timeout_ms: 120_000,
            body_sync_concurrency: 5,
            max_reconnect_attempts: 10,
            ping_interval_secs: 30,
            registry_path: None,
            workspaces_dir: None,
        }
    }
}

impl SyncConfig {
    /// Create a config pointing at `server_url`, defaults elsewhere.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: Some(server_url.into()),
            ..Self::default()
        }
    }

    /// [`Self::metadata_sync_timeout_ms`] as a `Duration`.
    pub fn metadata_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_sync_timeout_ms)
    }

    /// [`Self::body_sync_timeout_ms`] as a `Duration`.
    pub fn body_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.body_sync_timeout_ms)
    }

    /// [`Self::ping_interval_secs`] as a `Duration`.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// The configured server URL with any trailing slash removed.
    pub fn server_base(&self) -> Option<&str> {
        self.server_url.as_deref().map(|s| s.trim_end_matches('/'))
    }

    /// WebSocket endpoint derived from `server_url`.
    ///
    /// `http://host` becomes `ws://host/sync`, `https://host` becomes
    /// `wss://host/sync`. A URL that is already `ws(s)://` keeps its scheme.
    pub fn sync_websocket_url(&self) -> Option<String> {
        let base = self.server_base()?;
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        if ws.ends_with("/sync") {
            Some(ws)
        } else {
            Some(format!("{}/sync", ws))
        }
    }

    /// Load config from a path inside a [`LocalStore`].
    pub async fn load_from(store: &dyn LocalStore, path: &str) -> Result<Self> {
        let contents = store.read_text(path).await?;
        let config: SyncConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to a path inside a [`LocalStore`].
    pub async fn save_to(&self, store: &dyn LocalStore, path: &str) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        store.write_text(path, &contents).await
    }

    /// Load config from a store, returning defaults if absent or unreadable.
    pub async fn load_from_or_default(store: &dyn LocalStore, path: &str) -> Self {
        match Self::load_from(store, path).await {
            Ok(config) => config,
            Err(e) => {
                if !matches!(e, DiaryxError::NotFound(_)) {
                    log::warn!("[Config] Ignoring unreadable config at {}: {}", path, e);
                }
                Self::default()
            }
        }
    }

    /// Get the config file path (~/.config/diaryx/sync.toml)
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("diaryx").join("sync.toml"))
    }

    /// Default registry location (~/.local/share/diaryx/workspaces.db)
    pub fn default_registry_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("diaryx").join("workspaces.db"))
    }

    /// Default parent directory for workspace storage
    pub fn default_workspaces_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("diaryx").join("workspaces"))
    }

    /// Registry location, falling back to the platform default.
    pub fn resolved_registry_path(&self) -> Result<PathBuf> {
        self.registry_path
            .clone()
            .or_else(Self::default_registry_path)
            .ok_or(DiaryxError::NoConfigDir)
    }

    /// Workspaces directory, falling back to the platform default.
    pub fn resolved_workspaces_dir(&self) -> Result<PathBuf> {
        self.workspaces_dir
            .clone()
            .or_else(Self::default_workspaces_dir)
            .ok_or(DiaryxError::NoConfigDir)
    }

    /// Load config from the default location, or defaults if the file doesn't exist.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from an explicit file, or defaults if it doesn't exist.
    pub fn load_path(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DiaryxError::from_io(path, e, false))?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or(DiaryxError::NoConfigDir)?;
        self.save_path(&path)
    }

    /// Save config to an explicit file, creating parent directories.
    pub fn save_path(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|e| DiaryxError::from_io(path, e, true))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: SyncConfig = toml::from_str("server_url = \"https://x.org\"").unwrap();
        assert_eq!(config.server_url.as_deref(), Some("https://x.org"));
        assert_eq!(config.metadata_sync_timeout_ms, 30_000);
        assert_eq!(config.body_sync_timeout_ms, 120_000);
        assert_eq!(config.body_sync_concurrency, 5);
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let text = toml::to_string_pretty(&SyncConfig::default()).unwrap();
        assert!(!text.contains("server_url"));
        assert!(!text.contains("auth_token"));
        assert!(text.contains("body_sync_concurrency = 5"));
    }

    #[test]
    fn test_sync_websocket_url() {
        assert_eq!(
            SyncConfig::new("https://sync.diaryx.org/").sync_websocket_url(),
            Some("wss://sync.diaryx.org/sync".to_string())
        );
        assert_eq!(
            SyncConfig::new("http://localhost:3030").sync_websocket_url(),
            Some("ws://localhost:3030/sync".to_string())
        );
        assert_eq!(SyncConfig::default().sync_websocket_url(), None);
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let store = MemoryStore::new();
        let mut config = SyncConfig::new("https://example.com");
        config.auth_token = Some("secret".into());
        config.body_sync_concurrency = 2;
        config.save_to(&store, ".diaryx/sync.toml").await.unwrap();

        let loaded = SyncConfig::load_from(&store, ".diaryx/sync.toml").await.unwrap();
        assert_eq!(loaded, config);

        let missing = SyncConfig::load_from_or_default(&store, "nope.toml").await;
        assert_eq!(missing, SyncConfig::default());
    }

    #[test]
    fn test_native_save_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");
        assert_eq!(SyncConfig::load_path(&path).unwrap(), SyncConfig::default());

        let config = SyncConfig::new("https://example.com");
        config.save_path(&path).unwrap();
        assert_eq!(SyncConfig::load_path(&path).unwrap(), config);
    }
}
