//! Document State seeding, tombstones and replica exchange.

use std::sync::Arc;

use diaryx_sync::crdt::{MemoryStorage, UpdateOrigin};
use diaryx_sync::progress::ProgressReporter;
use diaryx_sync::snapshot::{ExportFilter, export_snapshot, import_snapshot};
use diaryx_sync::store::{LocalStore, MemoryStore};
use diaryx_sync::{DiaryxError, DocumentState};

fn state_over(store: Arc<MemoryStore>) -> DocumentState {
    DocumentState::new(store, Arc::new(MemoryStorage::new())).unwrap()
}

#[tokio::test]
async fn test_tombstoned_entries_are_not_resurrected_by_import() {
    let store = Arc::new(MemoryStore::with_files([
        ("keep.md", "---\ntitle: Keep\n---\nkeep"),
        ("gone.md", "---\ntitle: Gone\n---\ngone"),
    ]));
    let state = state_over(store.clone());
    state.initialize_from_files("").await.unwrap();

    let snapshot = {
        let server = MemoryStore::with_files([("keep.md", "---\ntitle: Keep\n---\nkeep v2")]);
        export_snapshot(&server, "", &ExportFilter::all(), &ProgressReporter::noop())
            .await
            .unwrap()
    };

    for path in store.paths() {
        store.delete_entry(&path, false).await.unwrap();
    }
    assert_eq!(state.mark_all_deleted().unwrap(), 2);
    import_snapshot(store.as_ref(), &snapshot.bytes, "", &ProgressReporter::noop())
        .await
        .unwrap();
    state.initialize_from_files("").await.unwrap();

    let files: Vec<String> = state.get_all_files().into_keys().collect();
    assert_eq!(files, vec!["keep.md"]);
    assert!(state.workspace().get_file("gone.md").unwrap().deleted);
    assert_eq!(
        state.bodies().get("keep.md").unwrap().get_body(),
        "keep v2"
    );
    assert!(!state.materialize("gone.md").await.unwrap());
    assert!(!store.exists("gone.md").await);
}

#[tokio::test]
async fn test_initialize_twice_does_not_clobber() {
    let store = Arc::new(MemoryStore::with_files([("a.md", "---\ntitle: A\n---\nAlpha")]));
    let state = state_over(store);

    assert_eq!(state.initialize_from_files("").await.unwrap(), 1);
    let first = state.workspace().get_file("a.md").unwrap();
    assert_eq!(state.initialize_from_files("").await.unwrap(), 0);
    assert_eq!(state.workspace().get_file("a.md").unwrap(), first);
}

#[tokio::test]
async fn test_discard_only_before_first_flush() {
    let store = Arc::new(MemoryStore::with_files([("a.md", "---\ntitle: A\n---\nAlpha")]));
    let state = state_over(store);
    state.initialize_from_files("").await.unwrap();

    state.hold_outbox();
    assert!(state.take_outbox().is_empty());
    assert_eq!(state.discard_queued_local_updates("test").unwrap(), 2);
    assert!(state.bodies().get("a.md").is_none_or(|doc| doc.is_empty()));

    state.set_body("a.md", "Beta").await.unwrap();
    assert_eq!(state.take_outbox().len(), 1);
    assert!(matches!(
        state.discard_queued_local_updates("too late"),
        Err(DiaryxError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_remote_changes_materialize_into_the_store() {
    let origin_store = Arc::new(MemoryStore::with_files([(
        "notes.md",
        "---\ntitle: Notes\n---\nShared text",
    )]));
    let origin = state_over(origin_store);
    origin.initialize_from_files("").await.unwrap();

    let replica_store = Arc::new(MemoryStore::new());
    let replica = state_over(replica_store.clone());
    replica
        .apply_remote_metadata(&origin.workspace().encode_state_as_update(), UpdateOrigin::Sync)
        .await
        .unwrap();
    let body = origin.bodies().get("notes.md").unwrap().encode_state_as_update();
    assert!(
        replica
            .apply_remote_body("notes.md", &body, UpdateOrigin::Sync)
            .await
            .unwrap()
    );

    let text = replica_store.read_text("notes.md").await.unwrap();
    assert!(text.contains("title: Notes"));
    assert!(text.ends_with("Shared text"));

    // Deleting on the origin removes the file on the replica
    origin.delete_entry("notes.md").await.unwrap();
    let sv = replica.workspace().encode_state_vector();
    let diff = origin.workspace().encode_diff(&sv).unwrap();
    replica
        .apply_remote_metadata(&diff, UpdateOrigin::Remote)
        .await
        .unwrap();
    assert!(!replica_store.exists("notes.md").await);
}
