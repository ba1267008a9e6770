//! In-memory store, available everywhere.
//!
//! Useful for tests and for workspaces that never touch disk. Directories are
//! implicit: a directory exists while some file lives below it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{BoxFuture, LocalStore, StoreKind, TreeNode, normalize_path};
use crate::error::{DiaryxError, Result};

/// An in-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    files: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    /// Maximum total bytes, if any
    quota: Option<usize>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses writes past `bytes` total.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            files: Arc::default(),
            quota: Some(bytes),
        }
    }

    /// Create a store pre-populated with text files.
    pub fn with_files<I, P, C>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: AsRef<[u8]>,
    {
        let store = Self::new();
        {
            let mut files = store.files.write();
            for (path, content) in entries {
                files.insert(normalize_path(path.as_ref()), content.as_ref().to_vec());
            }
        }
        store
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    /// Total bytes currently stored.
    pub fn used_bytes(&self) -> usize {
        self.files.read().values().map(Vec::len).sum()
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path);
        self.files
            .read()
            .get(&path)
            .cloned()
            .ok_or_else(|| DiaryxError::NotFound(PathBuf::from(path)))
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let path = normalize_path(path);
        let mut files = self.files.write();

        if let Some(quota) = self.quota {
            let existing = files.get(&path).map(Vec::len).unwrap_or(0);
            let used: usize = files.values().map(Vec::len).sum();
            if used - existing + bytes.len() > quota {
                return Err(DiaryxError::QuotaExceeded(PathBuf::from(path)));
            }
        }

        files.insert(path, bytes.to_vec());
        Ok(())
    }

    fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        let path = normalize_path(path);
        let mut files = self.files.write();

        if files.remove(&path).is_some() {
            return Ok(());
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let children: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();

        if children.is_empty() {
            return Err(DiaryxError::NotFound(PathBuf::from(path)));
        }
        if !recursive {
            return Err(DiaryxError::InvalidState(format!(
                "directory '{}' is not empty",
                path
            )));
        }
        for child in children {
            files.remove(&child);
        }
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    fn read_text<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let bytes = self.get(path)?;
            String::from_utf8(bytes).map_err(|e| DiaryxError::FileRead {
                path: PathBuf::from(path),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })
        })
    }

    fn write_text<'a>(&'a self, path: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.put(path, text.as_bytes()) })
    }

    fn read_binary<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.get(path) })
    }

    fn write_binary<'a>(&'a self, path: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.put(path, bytes) })
    }

    fn delete_entry<'a>(&'a self, path: &'a str, recursive: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.remove(path, recursive) })
    }

    fn list_tree<'a>(&'a self, root: &'a str) -> BoxFuture<'a, Result<TreeNode>> {
        Box::pin(async move {
            let files = self.files.read();
            Ok(TreeNode::from_paths(root, files.keys()))
        })
    }

    fn exists<'a>(&'a self, path: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.files.read().contains_key(&normalize_path(path)) })
    }
}
