//! Snapshot export/import against real stores.

use diaryx_sync::progress::{BootstrapStage, ProgressReporter};
use diaryx_sync::snapshot::{ExportFilter, export_snapshot, import_snapshot};
use diaryx_sync::store::{LocalStore, MemoryStore, NativeStore};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0xff, 0xfe];

const INDEX: &str = "---\ntitle: Journal\ncontents:\n- day1.md\n---\n\nWelcome.\n";
const DAY1: &str = "---\ntitle: Day 1\npart_of: index.md\nattachments:\n- photo.png\n---\n\nSunny.\n";

async fn seed(store: &dyn LocalStore) {
    store.write_text("index.md", INDEX).await.unwrap();
    store.write_text("day1.md", DAY1).await.unwrap();
    store.write_binary("photo.png", PNG).await.unwrap();
}

#[tokio::test]
async fn test_round_trip_between_directories() {
    let source_dir = tempfile::tempdir().unwrap();
    let dest_dir = tempfile::tempdir().unwrap();
    let source = NativeStore::new(source_dir.path());
    let dest = NativeStore::new(dest_dir.path());
    seed(&source).await;
    source.write_text(".diaryx/sync-manifest.json", "{}").await.unwrap();

    let archive = export_snapshot(&source, "", &ExportFilter::all(), &ProgressReporter::noop())
        .await
        .unwrap();
    assert_eq!(archive.entries.len(), 3);
    assert_eq!(archive.entries[0], "index.md");

    let (progress, mut updates) = ProgressReporter::channel();
    let summary = import_snapshot(&dest, &archive.bytes, "", &progress)
        .await
        .unwrap();
    assert_eq!(summary.imported, 3);

    let mut files = dest.list_files("").await.unwrap();
    files.sort();
    assert_eq!(files, vec!["day1.md", "index.md", "photo.png"]);
    assert_eq!(dest.read_binary("photo.png").await.unwrap(), PNG);
    assert_eq!(dest.read_text("index.md").await.unwrap(), INDEX);
    assert_eq!(dest.read_text("day1.md").await.unwrap(), DAY1);

    let last = updates.drain().pop().unwrap();
    assert_eq!(last.stage, BootstrapStage::ImportingFiles);
    assert_eq!((last.completed, last.total), (3, 3));
}

#[tokio::test]
async fn test_single_folder_workspace_keeps_its_folder() {
    let source = MemoryStore::new();
    for (path, text) in [("Journal/index.md", INDEX), ("Journal/day1.md", DAY1)] {
        source.write_text(path, text).await.unwrap();
    }
    source.write_binary("Journal/photo.png", PNG).await.unwrap();
    let archive = export_snapshot(&source, "", &ExportFilter::all(), &ProgressReporter::noop())
        .await
        .unwrap();

    let dest = MemoryStore::new();
    import_snapshot(&dest, &archive.bytes, "", &ProgressReporter::noop())
        .await
        .unwrap();
    assert_eq!(dest.paths(), source.paths());
    assert_eq!(dest.read_text("Journal/day1.md").await.unwrap(), DAY1);
}

#[tokio::test]
async fn test_reexported_archive_lands_under_prefix() {
    let source = MemoryStore::new();
    seed(&source).await;
    let first = export_snapshot(&source, "", &ExportFilter::all(), &ProgressReporter::noop())
        .await
        .unwrap();
    let middle = MemoryStore::new();
    import_snapshot(&middle, &first.bytes, "", &ProgressReporter::noop())
        .await
        .unwrap();
    let second = export_snapshot(&middle, "", &ExportFilter::all(), &ProgressReporter::noop())
        .await
        .unwrap();

    let dest = MemoryStore::new();
    import_snapshot(&dest, &second.bytes, "restored", &ProgressReporter::noop())
        .await
        .unwrap();
    assert_eq!(
        dest.paths(),
        vec!["restored/day1.md", "restored/index.md", "restored/photo.png"]
    );
}

#[tokio::test]
async fn test_audience_export_keeps_referenced_attachments() {
    let store = MemoryStore::new();
    store
        .write_text("index.md", "---\ntitle: Root\naudience:\n- family\ncontents:\n- day1.md\n- work.md\n---\n")
        .await
        .unwrap();
    store.write_text("day1.md", DAY1).await.unwrap();
    store
        .write_text("work.md", "---\ntitle: Work\npart_of: index.md\naudience:\n- work\n---\nMeetings")
        .await
        .unwrap();
    store.write_binary("photo.png", PNG).await.unwrap();

    let archive = export_snapshot(
        &store,
        "",
        &ExportFilter::audience("family"),
        &ProgressReporter::noop(),
    )
    .await
    .unwrap();
    let mut entries = archive.entries.clone();
    entries.sort();
    assert_eq!(entries, vec!["day1.md", "index.md", "photo.png"]);
}
