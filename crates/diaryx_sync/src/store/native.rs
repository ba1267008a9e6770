//! Native filesystem store rooted at a directory.

use std::path::{Path, PathBuf};

use super::{BoxFuture, LocalStore, StoreKind, TreeNode, join_path, normalize_path};
use crate::error::{DiaryxError, Result};

/// A store that maps workspace paths onto a directory via `tokio::fs`.
#[derive(Debug, Clone)]
pub struct NativeStore {
    root: PathBuf,
}

impl NativeStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory backing this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = normalize_path(path);
        if path.is_empty() {
            return self.root.clone();
        }
        path.split('/')
            .filter(|c| *c != "..")
            .fold(self.root.clone(), |acc, c| acc.join(c))
    }

    async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DiaryxError::from_io(parent, e, true))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| DiaryxError::from_io(&full, e, true))
    }

    /// Walk `dir`, collecting workspace-relative file paths.
    async fn walk(&self, rel: String, out: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![rel];
        while let Some(rel) = pending.pop() {
            let full = self.resolve(&rel);
            let mut entries = tokio::fs::read_dir(&full)
                .await
                .map_err(|e| DiaryxError::from_io(&full, e, false))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| DiaryxError::from_io(&full, e, false))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                let child = join_path(&rel, &name);
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| DiaryxError::from_io(entry.path(), e, false))?;
                if file_type.is_dir() {
                    pending.push(child);
                } else if file_type.is_file() {
                    out.push(child);
                }
            }
        }
        Ok(())
    }
}

impl LocalStore for NativeStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Native
    }

    fn read_text<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let full = self.resolve(path);
            tokio::fs::read_to_string(&full)
                .await
                .map_err(|e| DiaryxError::from_io(&full, e, false))
        })
    }

    fn write_text<'a>(&'a self, path: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write_bytes(path, text.as_bytes()).await })
    }

    fn read_binary<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let full = self.resolve(path);
            tokio::fs::read(&full)
                .await
                .map_err(|e| DiaryxError::from_io(&full, e, false))
        })
    }

    fn write_binary<'a>(&'a self, path: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write_bytes(path, bytes).await })
    }

    fn delete_entry<'a>(&'a self, path: &'a str, recursive: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let full = self.resolve(path);
            let meta = tokio::fs::metadata(&full)
                .await
                .map_err(|e| DiaryxError::from_io(&full, e, true))?;

            let result = if !meta.is_dir() {
                tokio::fs::remove_file(&full).await
            } else if recursive {
                tokio::fs::remove_dir_all(&full).await
            } else {
                let mut entries = tokio::fs::read_dir(&full)
                    .await
                    .map_err(|e| DiaryxError::from_io(&full, e, false))?;
                let has_children = entries
                    .next_entry()
                    .await
                    .map_err(|e| DiaryxError::from_io(&full, e, false))?
                    .is_some();
                if has_children {
                    return Err(DiaryxError::InvalidState(format!(
                        "directory '{}' is not empty",
                        full.display()
                    )));
                }
                tokio::fs::remove_dir(&full).await
            };
            result.map_err(|e| DiaryxError::from_io(&full, e, true))
        })
    }

    fn list_tree<'a>(&'a self, root: &'a str) -> BoxFuture<'a, Result<TreeNode>> {
        Box::pin(async move {
            let root = normalize_path(root);
            let mut files = Vec::new();
            match self.walk(root.clone(), &mut files).await {
                Ok(()) => {}
                // A store that has never been written to is an empty tree
                Err(DiaryxError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            Ok(TreeNode::from_paths(&root, files))
        })
    }

    fn exists<'a>(&'a self, path: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { tokio::fs::try_exists(self.resolve(path)).await.unwrap_or(false) })
    }
}
