//! Workspace registry persisted on disk.

use diaryx_sync::registry::{LOCAL_ID_PREFIX, WorkspaceRegistry};
use diaryx_sync::{DiaryxError, StoreKind};

#[test]
fn test_promote_twice_matches_promote_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("workspaces.db");
    let registry = WorkspaceRegistry::open(&path).unwrap();

    let local = registry.create("Journal", StoreKind::Native).unwrap();
    assert!(local.id.starts_with(LOCAL_ID_PREFIX));
    registry.set_active(&local.id).unwrap();

    let once = registry.promote(&local.id, "server-1").unwrap();
    let after_once = registry.list().unwrap();
    let twice = registry.promote(&local.id, "server-1").unwrap();
    assert_eq!(once, twice);
    assert_eq!(registry.list().unwrap(), after_once);

    assert!(!once.is_local);
    assert_eq!(once.storage_dir, local.storage_dir);
    assert_eq!(registry.active().unwrap().map(|w| w.id).as_deref(), Some("server-1"));

    drop(registry);
    let reopened = WorkspaceRegistry::open(&path).unwrap();
    assert_eq!(reopened.list().unwrap(), after_once);
}

#[test]
fn test_active_pointer_follows_registry() {
    let registry = WorkspaceRegistry::in_memory().unwrap();
    let a = registry.create("A", StoreKind::Memory).unwrap();
    let b = registry.create("B", StoreKind::Memory).unwrap();

    let opened = registry.set_active(&a.id).unwrap();
    assert!(opened.last_opened_at.is_some());
    registry.set_active(&b.id).unwrap();
    assert_eq!(registry.active().unwrap().map(|w| w.id), Some(b.id.clone()));

    registry.remove(&b.id).unwrap();
    assert_eq!(registry.active().unwrap(), None);

    assert!(matches!(
        registry.set_active(&b.id),
        Err(DiaryxError::WorkspaceNotFound(_))
    ));
}
