//! Core types stored in and produced by the CRDT replicas.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use ts_rs::TS;

/// Deserializes a value that should be a string, but may be an integer or other type.
/// Converts non-string values to their string representation.
fn deserialize_string_lenient<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_json::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number, got {:?}",
            other
        ))),
    }
}

/// Metadata for one entry in the workspace replica.
///
/// Stored as JSON in the `files` Y.Map, keyed by the entry's workspace-relative
/// path. `part_of` and `contents` are workspace-relative paths too.
///
/// `audience` has three states: `None` inherits from the nearest tagged
/// ancestor, `Some(vec![])` is explicitly untagged, anything else is an
/// explicit tag set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(default)]
#[ts(export, export_to = "bindings/")]
pub struct FileMetadata {
    /// Display title from frontmatter
    #[serde(deserialize_with = "deserialize_string_lenient")]
    pub title: Option<String>,

    /// Path of the parent index entry
    pub part_of: Option<String>,

    /// Paths of child entries (index entries only)
    pub contents: Option<Vec<String>>,

    /// Visibility tags
    pub audience: Option<Vec<String>>,

    /// File description from frontmatter
    #[serde(deserialize_with = "deserialize_string_lenient")]
    pub description: Option<String>,

    /// Paths of binary attachments referenced by this entry
    pub attachments: Vec<String>,

    /// Tombstone: the entry was deleted and must not be resurrected by merge
    pub deleted: bool,

    /// Additional frontmatter properties not covered by other fields
    #[ts(type = "Record<string, unknown>")]
    pub extra: HashMap<String, serde_json::Value>,

    /// Unix timestamp of last modification (milliseconds)
    pub modified_at: i64,
}

impl FileMetadata {
    /// Create new FileMetadata with the given title
    pub fn new(title: Option<String>) -> Self {
        Self {
            title,
            modified_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Mark this file as deleted (soft delete)
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.modified_at = chrono::Utc::now().timestamp_millis();
    }

    /// Compare everything except `modified_at`.
    pub fn same_content(&self, other: &FileMetadata) -> bool {
        FileMetadata {
            modified_at: 0,
            ..self.clone()
        } == FileMetadata {
            modified_at: 0,
            ..other.clone()
        }
    }
}

/// A CRDT update record, stored for persistence and replay.
#[derive(Debug, Clone)]
pub struct CrdtUpdate {
    /// Unique identifier for this update
    pub update_id: i64,

    /// Name of the document this update belongs to
    pub doc_name: String,

    /// Binary yrs update data
    pub data: Vec<u8>,

    /// Unix timestamp when this update was created (milliseconds)
    pub timestamp: i64,

    /// Origin of this update (local edit, remote sync, etc.)
    pub origin: UpdateOrigin,
}

/// Origin of a CRDT update, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Update originated from local user action
    Local,

    /// Update received from a remote peer
    Remote,

    /// Update from initial sync handshake
    Sync,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "sync" => Ok(UpdateOrigin::Sync),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}
