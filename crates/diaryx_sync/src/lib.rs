#![doc = include_str!(concat!(env!("OUT_DIR"), "/README.md"))]
#![warn(missing_docs)]

/// Bootstrap flows (download, upload, create, import, resume)
pub mod bootstrap;

/// Configuration options
pub mod config;

/// Conflict detection and resolution
pub mod conflict;

/// CRDT replicas and the sync wire protocol
pub mod crdt;

/// Per-workspace replicated state
pub mod document_state;

/// Entry files (frontmatter <-> metadata)
pub mod entry;

/// Error (common error types)
pub mod error;

/// Frontmatter parsing
pub mod frontmatter;

/// Path utilities for relative path calculations
pub mod path_utils;

/// Staged progress reporting
pub mod progress;

/// Workspace registry
pub mod registry;

/// HTTP API of the sync server
pub mod remote;

/// Snapshot archives (export and import)
pub mod snapshot;

/// Local Store Adapter and its backends
pub mod store;

/// Live connection to the sync server
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bootstrap::{BootstrapOptions, BootstrapOrchestrator, BootstrapOutcome, StorageRoot};
pub use config::SyncConfig;
pub use conflict::{ConflictRecord, ConflictTracker, Resolution};
pub use document_state::DocumentState;
pub use error::{DiaryxError, Result};
pub use progress::{BootstrapStage, Progress, ProgressReporter};
pub use registry::{Workspace, WorkspaceRegistry};
pub use store::{LocalStore, StoreKind};
pub use transport::{SessionState, TransportSession};
