//! Workspace snapshot archives.
//!
//! A snapshot is a zip of every non-hidden file of a workspace: markdown
//! entries as UTF-8 text and attachments as raw bytes. It is built on demand
//! for bulk transfer and expanded straight into a [`LocalStore`]; it is never
//! the system of record.
//!
//! Every file is stored below a single [`ARCHIVE_ROOT`] folder. Import strips
//! a folder shared by all entries, so a snapshot lands at the paths it was
//! taken from even when the workspace itself keeps everything in one folder.
//!
//! Entries are written directory by directory. Within a directory, index
//! entries (files with `contents`) come first, then the other files, then
//! subdirectories, so an importer sees a parent before its children.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Write};

use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::crdt::FileMetadata;
use crate::entry::{effective_audience, parse_entry};
use crate::error::{DiaryxError, Result};
use crate::progress::{BootstrapStage, ProgressReporter};
use crate::store::{LocalStore, TreeNode, extension, is_hidden, is_markdown, join_path, normalize_path};

/// Extensions imported as attachments (binary).
pub const ATTACHMENT_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "heic", "avif", "pdf", "mp3", "m4a", "wav",
    "ogg", "mp4", "mov", "webm", "txt", "csv", "json",
];

/// Folder wrapping every file of an exported snapshot.
pub const ARCHIVE_ROOT: &str = "workspace";

/// Names that archivers add and that are never workspace content.
const SYSTEM_NAMES: &[&str] = &["__MACOSX", "Thumbs.db", "desktop.ini"];

/// Which entries go into an exported snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportFilter {
    /// Only entries whose effective audience contains this tag, plus the
    /// attachments they reference
    pub audience: Option<String>,
}

impl ExportFilter {
    /// Export everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Export entries visible to `audience`.
    pub fn audience(audience: impl Into<String>) -> Self {
        Self {
            audience: Some(audience.into()),
        }
    }
}

/// An exported snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    /// Zip bytes
    pub bytes: Vec<u8>,
    /// Workspace paths of the archived files, in write order
    pub entries: Vec<String>,
}

/// Outcome of importing a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Number of files written
    pub imported: usize,
    /// Number of archive entries ignored
    pub skipped: usize,
    /// Store paths written, in archive order
    pub files: Vec<String>,
}

fn is_system(name: &str) -> bool {
    name.split('/').any(|c| SYSTEM_NAMES.contains(&c))
}

fn is_attachment(path: &str) -> bool {
    extension(path).is_some_and(|ext| ATTACHMENT_EXTENSIONS.contains(&ext.as_str()))
}

fn task_failed(e: tokio::task::JoinError) -> DiaryxError {
    DiaryxError::InvalidState(format!("archive task failed: {}", e))
}

/// Name of a store path inside an archive rooted at `root`.
fn archive_name(root: &str, path: &str) -> String {
    if root.is_empty() {
        return path.to_string();
    }
    path.strip_prefix(root)
        .and_then(|p| p.strip_prefix('/'))
        .unwrap_or(path)
        .to_string()
}

/// Files of `node` in archive order (see module docs).
fn ordered_files(node: &TreeNode, index_paths: &HashSet<String>, out: &mut Vec<String>) {
    let mut files: Vec<&TreeNode> = node.children.iter().filter(|c| !c.is_dir).collect();
    files.sort_by_key(|f| !index_paths.contains(&f.path));
    out.extend(files.into_iter().map(|f| f.path.clone()));

    for dir in node.children.iter().filter(|c| c.is_dir) {
        ordered_files(dir, index_paths, out);
    }
}

/// Build a snapshot of every non-hidden file under `root`.
///
/// A node is exported when its name carries an extension. Unreadable files are
/// skipped with a warning; store errors other than `NotFound` abort the export.
pub async fn export_snapshot(
    store: &dyn LocalStore,
    root: &str,
    filter: &ExportFilter,
    progress: &ProgressReporter,
) -> Result<SnapshotArchive> {
    let root = normalize_path(root);
    let tree = store.list_tree(&root).await?;
    let candidates: Vec<String> = tree
        .files()
        .into_iter()
        .filter(|p| !is_hidden(&archive_name(&root, p)) && extension(p).is_some())
        .collect();

    progress.report(BootstrapStage::Exporting, 0, candidates.len() as u64, None);

    let mut contents: HashMap<String, Vec<u8>> = HashMap::new();
    let mut entries: HashMap<String, FileMetadata> = HashMap::new();
    for path in &candidates {
        let bytes = match store.read_binary(path).await {
            Ok(bytes) => bytes,
            Err(DiaryxError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        if is_markdown(path) {
            match std::str::from_utf8(&bytes).map(|text| parse_entry(path, text)) {
                Ok(Ok((metadata, _))) => {
                    entries.insert(path.clone(), metadata);
                }
                _ => log::warn!("[Snapshot] Exporting {} without reading its metadata", path),
            }
        }
        contents.insert(path.clone(), bytes);
    }

    let index_paths: HashSet<String> = entries
        .iter()
        .filter(|(_, m)| m.contents.is_some())
        .map(|(p, _)| p.clone())
        .collect();
    let mut order = Vec::with_capacity(contents.len());
    ordered_files(&tree, &index_paths, &mut order);
    order.retain(|p| contents.contains_key(p));

    if let Some(tag) = &filter.audience {
        let lookup = |p: &str| {
            entries
                .get(p)
                .map(|m| (m.audience.clone(), m.part_of.clone()))
        };
        let visible: HashSet<&String> = entries
            .keys()
            .filter(|p| effective_audience(p, lookup).contains(tag))
            .collect();
        let referenced: HashSet<&String> = visible
            .iter()
            .filter_map(|p| entries.get(*p))
            .flat_map(|m| m.attachments.iter())
            .collect();
        order.retain(|p| visible.contains(p) || referenced.contains(p));
        log::info!(
            "[Snapshot] Audience '{}': {} of {} files visible",
            tag,
            order.len(),
            contents.len()
        );
    }

    let files: Vec<(String, Vec<u8>)> = order
        .iter()
        .filter_map(|p| contents.remove(p).map(|bytes| (archive_name(&root, p), bytes)))
        .collect();
    let names: Vec<String> = files.iter().map(|(name, _)| name.clone()).collect();
    let total = files.len() as u64;

    let reporter = progress.clone();
    let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (i, (name, bytes)) in files.iter().enumerate() {
            zip.start_file(format!("{}/{}", ARCHIVE_ROOT, name), options)?;
            zip.write_all(bytes)?;
            reporter.report(BootstrapStage::Exporting, i as u64 + 1, total, Some(name.clone()));
        }
        Ok(zip.finish()?.into_inner())
    })
    .await
    .map_err(task_failed)??;

    log::info!(
        "[Snapshot] Exported {} files ({} bytes) from '{}'",
        names.len(),
        bytes.len(),
        root
    );
    Ok(SnapshotArchive {
        bytes,
        entries: names,
    })
}

/// Read every file entry of a zip, in archive order.
fn read_archive(bytes: Vec<u8>) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut files = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        files.push((name, contents));
    }
    Ok(files)
}

/// The single top-level folder shared by every name, if there is one.
fn common_folder(names: &[String]) -> Option<String> {
    let mut first: Option<&str> = None;
    for name in names {
        let (folder, rest) = name.split_once('/')?;
        if rest.is_empty() {
            return None;
        }
        match first {
            None => first = Some(folder),
            Some(f) if f == folder => {}
            Some(_) => return None,
        }
    }
    first.map(String::from)
}

/// Expand a snapshot into `store` below `dest_prefix`.
///
/// Hidden and system entries are skipped, as are extensions that are neither
/// markdown nor a known attachment type. A folder shared by every remaining
/// entry is stripped so re-exported archives re-root cleanly.
pub async fn import_snapshot(
    store: &dyn LocalStore,
    archive: &[u8],
    dest_prefix: &str,
    progress: &ProgressReporter,
) -> Result<ImportSummary> {
    let bytes = archive.to_vec();
    let files = tokio::task::spawn_blocking(move || read_archive(bytes))
        .await
        .map_err(task_failed)??;

    let mut summary = ImportSummary::default();
    let mut kept: Vec<(String, Vec<u8>)> = Vec::with_capacity(files.len());
    for (name, contents) in files {
        let name = normalize_path(&name);
        if name.is_empty() || is_hidden(&name) || is_system(&name) {
            log::debug!("[Snapshot] Skipping hidden entry {}", name);
            summary.skipped += 1;
            continue;
        }
        kept.push((name, contents));
    }

    let names: Vec<String> = kept.iter().map(|(n, _)| n.clone()).collect();
    let strip = common_folder(&names);
    if let Some(folder) = &strip {
        log::info!("[Snapshot] Stripping shared folder '{}'", folder);
    }

    let dest_prefix = normalize_path(dest_prefix);
    let total = kept.len() as u64;
    progress.report(BootstrapStage::ImportingFiles, 0, total, None);

    for (i, (name, contents)) in kept.into_iter().enumerate() {
        let rel = match &strip {
            Some(folder) => name[folder.len() + 1..].to_string(),
            None => name,
        };
        let path = join_path(&dest_prefix, &rel);

        if is_markdown(&path) {
            match String::from_utf8(contents) {
                Ok(text) => store.write_text(&path, &text).await?,
                Err(_) => {
                    log::warn!("[Snapshot] Skipping {}: not valid UTF-8", path);
                    summary.skipped += 1;
                    continue;
                }
            }
        } else if is_attachment(&path) {
            store.write_binary(&path, &contents).await?;
        } else {
            log::warn!("[Snapshot] Skipping {}: unsupported file type", path);
            summary.skipped += 1;
            continue;
        }

        summary.imported += 1;
        progress.report(
            BootstrapStage::ImportingFiles,
            i as u64 + 1,
            total,
            Some(path.clone()),
        );
        summary.files.push(path);
    }

    log::info!(
        "[Snapshot] Imported {} files, skipped {}",
        summary.imported,
        summary.skipped
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn test_export_orders_index_first_and_skips_hidden() {
        let store = MemoryStore::with_files([
            ("a.md", "---\npart_of: index.md\n---\nA"),
            ("index.md", "---\ncontents:\n- a.md\n- sub/b.md\n---\n"),
            ("sub/b.md", "B"),
            (".diaryx/crdt.db", "x"),
            ("README", "no extension"),
        ]);
        let archive = export_snapshot(&store, "", &ExportFilter::all(), &ProgressReporter::noop())
            .await
            .unwrap();
        assert_eq!(archive.entries, vec!["index.md", "a.md", "sub/b.md"]);
    }

    #[tokio::test]
    async fn test_export_wraps_files_in_archive_root() {
        let store = MemoryStore::with_files([("Journal/index.md", "# Home"), ("Journal/a.md", "A")]);
        let archive = export_snapshot(&store, "", &ExportFilter::all(), &ProgressReporter::noop())
            .await
            .unwrap();
        let names: Vec<String> = read_archive(archive.bytes)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["workspace/Journal/a.md", "workspace/Journal/index.md"]);
    }

    #[tokio::test]
    async fn test_export_audience_filter_keeps_referenced_attachments() {
        let store = MemoryStore::with_files([
            (
                "index.md",
                "---\naudience:\n- family\ncontents:\n- trip.md\n- secret.md\n---\n",
            ),
            (
                "trip.md",
                "---\npart_of: index.md\nattachments:\n- img/beach.png\n---\n",
            ),
            ("secret.md", "---\npart_of: index.md\naudience: []\n---\n"),
            ("img/beach.png", "png"),
            ("img/other.png", "png"),
        ]);
        let archive = export_snapshot(
            &store,
            "",
            &ExportFilter::audience("family"),
            &ProgressReporter::noop(),
        )
        .await
        .unwrap();
        assert_eq!(archive.entries, vec!["index.md", "trip.md", "img/beach.png"]);
    }

    #[tokio::test]
    async fn test_import_strips_shared_folder_and_skips_junk() {
        let archive = zip_of(&[
            ("Journal/index.md", b"# Home"),
            ("Journal/img/a.png", &[0x89, 0x50, 0x4e, 0x47]),
            ("Journal/.DS_Store", b"junk"),
            ("__MACOSX/Journal/._index.md", b"junk"),
            ("Journal/tool.exe", b"MZ"),
        ]);
        let store = MemoryStore::new();
        let (reporter, mut rx) = ProgressReporter::channel();
        let summary = import_snapshot(&store, &archive, "", &reporter).await.unwrap();

        assert_eq!(summary.imported, 2);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.files, vec!["index.md", "img/a.png"]);
        assert_eq!(store.paths(), vec!["img/a.png", "index.md"]);
        assert_eq!(
            store.read_binary("img/a.png").await.unwrap(),
            vec![0x89, 0x50, 0x4e, 0x47]
        );

        let updates = rx.drain();
        assert!(updates.windows(2).all(|w| w[0].completed <= w[1].completed));
    }

    #[tokio::test]
    async fn test_import_without_shared_folder_uses_prefix() {
        let archive = zip_of(&[("a.md", b"A"), ("notes/b.md", b"B")]);
        let store = MemoryStore::new();
        let summary = import_snapshot(&store, &archive, "restored", &ProgressReporter::noop())
            .await
            .unwrap();
        assert_eq!(summary.files, vec!["restored/a.md", "restored/notes/b.md"]);
    }

    #[test]
    fn test_common_folder() {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            common_folder(&names(&["w/a.md", "w/b/c.md"])),
            Some("w".to_string())
        );
        assert_eq!(common_folder(&names(&["w/a.md", "x/b.md"])), None);
        assert_eq!(common_folder(&names(&["a.md", "w/b.md"])), None);
        assert_eq!(common_folder(&names(&[])), None);
    }
}
