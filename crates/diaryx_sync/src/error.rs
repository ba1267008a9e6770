use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Unified error type for sync engine operations
#[derive(Debug, Error)]
pub enum DiaryxError {
    // IO errors
    /// Unclassified I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading a store file failed
    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Writing a store file failed
    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        /// File being written
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    // Store errors
    /// The entry does not exist
    #[error("Not found: '{0}'")]
    NotFound(PathBuf),

    /// The store refused access to the entry
    #[error("Permission denied for '{0}'")]
    PermissionDenied(PathBuf),

    /// The device ran out of space or quota
    #[error("Storage quota exceeded while writing '{0}'")]
    QuotaExceeded(PathBuf),

    // Sync errors
    /// A wait ended before the awaited event
    #[error("Timed out after {after_ms}ms waiting for {operation}")]
    Timeout {
        /// What was awaited
        operation: String,
        /// Deadline that passed
        after_ms: u64,
    },

    /// Both sides edited an entry since its last common version
    #[error(
        "Conflicting edits on '{path}' (local modified at {local_modified_at}, remote at {remote_modified_at})"
    )]
    Conflict {
        /// Workspace path of the entry
        path: String,
        /// Local `modified_at`, in milliseconds since the epoch
        local_modified_at: i64,
        /// Remote `modified_at`, in milliseconds since the epoch
        remote_modified_at: i64,
    },

    /// The server already has a workspace with this name
    #[error("A remote workspace named '{name}' already exists")]
    NameCollision {
        /// Requested name
        name: String,
        /// Id of the workspace holding the name, when the server reports it
        existing_id: Option<String>,
    },

    /// No registry entry has this id
    #[error("Workspace '{0}' is not in the registry")]
    WorkspaceNotFound(String),

    /// The operation does not apply to the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Serialization errors
    /// Frontmatter is not valid YAML
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON payload could not be read or written
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    /// The config file is not valid TOML
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The config could not be written as TOML
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// The platform has no config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    // Storage backends
    /// A replica update could not be decoded or applied
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// SQLite failure in the registry or a SQLite-backed store
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A snapshot archive could not be read or written
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    // Remote errors
    /// The HTTP request itself failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error status
    #[error("Server returned {status}: {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// The sync channel failed or closed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server URL does not parse
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Result type alias for sync engine operations
pub type Result<T> = std::result::Result<T, DiaryxError>;

/// ENOSPC on Linux and macOS.
const OUT_OF_SPACE: i32 = 28;
/// EDQUOT on Linux.
const QUOTA_LINUX: i32 = 122;
/// EDQUOT on macOS.
const QUOTA_DARWIN: i32 = 69;

impl DiaryxError {
    /// Classify an I/O error raised by a store backend for `path`.
    ///
    /// Missing files, revoked permissions and exhausted storage get their own
    /// variants so callers can treat them per the error policy; anything else
    /// is wrapped as a read or write failure.
    pub fn from_io(path: impl AsRef<Path>, err: std::io::Error, writing: bool) -> Self {
        let path = path.as_ref().to_path_buf();
        match err.kind() {
            std::io::ErrorKind::NotFound => DiaryxError::NotFound(path),
            std::io::ErrorKind::PermissionDenied => DiaryxError::PermissionDenied(path),
            _ if matches!(
                err.raw_os_error(),
                Some(OUT_OF_SPACE) | Some(QUOTA_LINUX) | Some(QUOTA_DARWIN)
            ) =>
            {
                DiaryxError::QuotaExceeded(path)
            }
            _ if writing => DiaryxError::FileWrite { path, source: err },
            _ => DiaryxError::FileRead { path, source: err },
        }
    }

    /// Whether the caller may treat this error as a soft outcome.
    ///
    /// `NotFound` means "absent", `Timeout` means "continuing in background"
    /// and `NameCollision` can be retried against the existing workspace.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DiaryxError::NotFound(_) | DiaryxError::Timeout { .. } | DiaryxError::NameCollision { .. }
        )
    }

    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of DiaryxError for IPC (e.g., Tauri)
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated path (if applicable)
    pub path: Option<PathBuf>,
}

impl From<&DiaryxError> for SerializableError {
    fn from(err: &DiaryxError) -> Self {
        let kind = match err {
            DiaryxError::Io(_) => "Io",
            DiaryxError::FileRead { .. } => "FileRead",
            DiaryxError::FileWrite { .. } => "FileWrite",
            DiaryxError::NotFound(_) => "NotFound",
            DiaryxError::PermissionDenied(_) => "PermissionDenied",
            DiaryxError::QuotaExceeded(_) => "QuotaExceeded",
            DiaryxError::Timeout { .. } => "Timeout",
            DiaryxError::Conflict { .. } => "Conflict",
            DiaryxError::NameCollision { .. } => "NameCollision",
            DiaryxError::WorkspaceNotFound(_) => "WorkspaceNotFound",
            DiaryxError::InvalidState(_) => "InvalidState",
            DiaryxError::Yaml(_) => "Yaml",
            DiaryxError::Json(_) => "Json",
            DiaryxError::ConfigParse(_) => "ConfigParse",
            DiaryxError::ConfigSerialize(_) => "ConfigSerialize",
            DiaryxError::NoConfigDir => "NoConfigDir",
            DiaryxError::Crdt(_) => "Crdt",
            DiaryxError::Database(_) => "Database",
            DiaryxError::Archive(_) => "Archive",
            DiaryxError::Http(_) => "Http",
            DiaryxError::Server { .. } => "Server",
            DiaryxError::Transport(_) => "Transport",
            DiaryxError::InvalidUrl(_) => "InvalidUrl",
        }
        .to_string();

        let path = match err {
            DiaryxError::FileRead { path, .. } => Some(path.clone()),
            DiaryxError::FileWrite { path, .. } => Some(path.clone()),
            DiaryxError::NotFound(path) => Some(path.clone()),
            DiaryxError::PermissionDenied(path) => Some(path.clone()),
            DiaryxError::QuotaExceeded(path) => Some(path.clone()),
            DiaryxError::Conflict { path, .. } => Some(PathBuf::from(path)),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<DiaryxError> for SerializableError {
    fn from(err: DiaryxError) -> Self {
        SerializableError::from(&err)
    }
}
