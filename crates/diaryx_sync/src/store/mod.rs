//! Local store abstraction.
//!
//! This module provides the [`LocalStore`] trait, a uniform async interface over
//! whichever durable medium a device offers. The orchestrator, the snapshot
//! codec and document state only ever talk to `dyn LocalStore`.
//!
//! Variants:
//! - [`MemoryStore`]: in-memory tree (tests, ephemeral workspaces)
//! - [`NativeStore`]: a directory on the local filesystem
//! - [`SqliteStore`]: an embedded key-value database, one row per path
//!
//! Paths are workspace-relative and `/`-separated; `""` is the root.
//!
//! ## Object safety
//!
//! `LocalStore` is designed to be object-safe so it can be shared as
//! `Arc<dyn LocalStore>`. To enable this, all methods return boxed futures.

mod memory;
mod native;
mod sqlite;

pub use memory::MemoryStore;
pub use native::NativeStore;
pub use sqlite::SqliteStore;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{DiaryxError, Result};

/// A boxed future for object-safe async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Directory for engine bookkeeping (manifest, CRDT database). Hidden, so it
/// never ends up in snapshots or the metadata replica.
pub const META_DIR: &str = ".diaryx";

/// The durable medium behind a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum StoreKind {
    /// Process memory, lost on exit
    Memory,
    /// A directory on the local filesystem
    Native,
    /// Embedded SQLite key-value table
    Sqlite,
}

impl StoreKind {
    /// Stable identifier used in the registry table.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Native => "native",
            StoreKind::Sqlite => "sqlite",
        }
    }
}

impl std::str::FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StoreKind::Memory),
            "native" => Ok(StoreKind::Native),
            "sqlite" => Ok(StoreKind::Sqlite),
            other => Err(format!("unknown store kind: {}", other)),
        }
    }
}

/// A node of a listed tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    /// Last path component (empty for the root)
    pub name: String,
    /// Workspace-relative path
    pub path: String,
    /// Whether this node is a directory
    pub is_dir: bool,
    /// Children, files first then directories, each group sorted by name
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn dir(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            is_dir: true,
            children: Vec::new(),
        }
    }

    /// Build a tree rooted at `root` from a flat list of file paths.
    ///
    /// Paths outside `root` are ignored.
    pub fn from_paths<I, S>(root: &str, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let root = normalize_path(root);
        let name = root.rsplit('/').next().unwrap_or_default();
        let mut tree = TreeNode::dir(name, &root);

        for path in paths {
            let path = normalize_path(path.as_ref());
            let Some(rel) = strip_root(&root, &path) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            tree.insert(rel.split('/').collect::<Vec<_>>().as_slice());
        }

        tree.sort();
        tree
    }

    fn insert(&mut self, parts: &[&str]) {
        let Some((first, rest)) = parts.split_first() else {
            return;
        };
        let child_path = join_path(&self.path, first);

        if rest.is_empty() {
            if !self.children.iter().any(|c| c.path == child_path) {
                self.children.push(TreeNode {
                    name: first.to_string(),
                    path: child_path,
                    is_dir: false,
                    children: Vec::new(),
                });
            }
            return;
        }

        let idx = match self
            .children
            .iter()
            .position(|c| c.is_dir && c.path == child_path)
        {
            Some(idx) => idx,
            None => {
                self.children.push(TreeNode::dir(first, &child_path));
                self.children.len() - 1
            }
        };
        self.children[idx].insert(rest);
    }

    fn sort(&mut self) {
        self.children
            .sort_by(|a, b| a.is_dir.cmp(&b.is_dir).then_with(|| a.name.cmp(&b.name)));
        for child in &mut self.children {
            child.sort();
        }
    }

    /// All file paths below this node, depth-first, files before subdirectories.
    pub fn files(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_files(&mut out);
        out
    }

    fn collect_files(&self, out: &mut Vec<String>) {
        if !self.is_dir {
            out.push(self.path.clone());
            return;
        }
        for child in &self.children {
            child.collect_files(out);
        }
    }
}

/// Normalize a workspace-relative path: forward slashes, no leading `./` or
/// `/`, no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a directory and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Whether any component of `path` is hidden (starts with `.`).
pub fn is_hidden(path: &str) -> bool {
    path.split('/').any(|c| c.starts_with('.'))
}

/// Lowercased extension of the last path component, if any.
pub fn extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Whether `path` is a markdown entry.
pub fn is_markdown(path: &str) -> bool {
    matches!(extension(path).as_deref(), Some("md") | Some("markdown"))
}

/// `path` relative to `root`, or `None` when it lies outside.
fn strip_root<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    if root.is_empty() {
        return Some(path);
    }
    if path == root {
        return Some("");
    }
    path.strip_prefix(root)?.strip_prefix('/')
}

/// Async abstraction over a durable store.
///
/// Side effects are confined to the store instance. `NotFound` is the only
/// error callers are expected to recover from; `PermissionDenied` and
/// `QuotaExceeded` are surfaced as-is and never retried here.
pub trait LocalStore: Send + Sync {
    /// The medium behind this store.
    fn kind(&self) -> StoreKind;

    /// Read a text file.
    fn read_text<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Create or overwrite a text file, creating parent directories.
    fn write_text<'a>(&'a self, path: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Read a binary file.
    fn read_binary<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Create or overwrite a binary file, creating parent directories.
    fn write_binary<'a>(&'a self, path: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Delete a file, or a directory when `recursive` is set.
    ///
    /// Deleting a non-empty directory without `recursive` is an error.
    fn delete_entry<'a>(&'a self, path: &'a str, recursive: bool) -> BoxFuture<'a, Result<()>>;

    /// List everything below `root` (hidden entries included).
    fn list_tree<'a>(&'a self, root: &'a str) -> BoxFuture<'a, Result<TreeNode>>;

    /// Checks if a file exists.
    fn exists<'a>(&'a self, path: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.read_binary(path).await.is_ok() })
    }

    /// Read a text file, treating `NotFound` as absent.
    fn read_text_opt<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            match self.read_text(path).await {
                Ok(text) => Ok(Some(text)),
                Err(DiaryxError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    /// Flat list of every file below `root`.
    fn list_files<'a>(&'a self, root: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move { Ok(self.list_tree(root).await?.files()) })
    }
}
