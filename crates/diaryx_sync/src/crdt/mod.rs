#![doc = include_str!(concat!(env!("OUT_DIR"), "/crdt_README.md"))]

mod body_doc;
mod body_doc_manager;
mod memory_storage;
mod sqlite_storage;
mod storage;
mod sync;
mod types;
mod workspace_doc;

pub use body_doc::{BodyDoc, body_doc_name};
pub use body_doc_manager::BodyDocManager;
pub use memory_storage::MemoryStorage;
pub use sqlite_storage::SqliteStorage;
pub use storage::CrdtStorage;
pub use sync::{SyncMessage, frame_body_message, unframe_body_message};
pub use types::{CrdtUpdate, FileMetadata, UpdateOrigin};
pub use workspace_doc::{WORKSPACE_DOC_NAME, WorkspaceCrdt};
