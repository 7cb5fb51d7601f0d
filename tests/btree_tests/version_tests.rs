//! Tests for versions, snapshots and rollback
//!
//! These tests verify:
//! - commit numbering and idempotence
//! - rollback to the last committed root
//! - open_version round-trips and read-only snapshots
//! - retention: too-old versions resolve to the oldest retained one
//! - time-window retention keeps only versions committed inside the window
//! - VersionUnavailable once a version's pages are gone

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use aostore::{AoError, BTreeMap, Config, RetentionPolicy, Storage};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn in_memory_storage() -> Storage {
    Config::builder()
        .in_memory()
        .auto_commit_disabled()
        .open_storage()
        .unwrap()
}

fn open_storage(path: &Path) -> Storage {
    Config::builder()
        .storage_name(path)
        .auto_commit_disabled()
        .open_storage()
        .unwrap()
}

// =============================================================================
// Commit Tests
// =============================================================================

#[test]
fn test_new_map_starts_at_version_zero() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();

    assert_eq!(map.version(), 0);
    assert!(map.is_empty());
    assert!(!map.has_uncommitted_changes());
}

#[test]
fn test_commit_increments_version() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();

    map.put(1, 1).unwrap();
    assert!(map.has_uncommitted_changes());
    assert_eq!(map.commit().unwrap(), 1);

    map.put(2, 2).unwrap();
    assert_eq!(map.commit().unwrap(), 2);
    assert!(!map.has_uncommitted_changes());
}

#[test]
fn test_commit_without_changes_is_idempotent() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    map.put(1, 10).unwrap();
    let v = map.commit().unwrap();
    let chunks = storage.chunks().unwrap().len();

    assert_eq!(map.commit().unwrap(), v);
    assert_eq!(storage.chunks().unwrap().len(), chunks);
    assert_eq!(map.get(&1).unwrap(), Some(10));
}

// =============================================================================
// Rollback Tests
// =============================================================================

#[test]
fn test_rollback_restores_committed_value() {
    let storage = in_memory_storage();
    let map: BTreeMap<String, String> = storage.open_btree_map("test").unwrap();
    map.put("k".into(), "v1".into()).unwrap();
    map.commit().unwrap();

    map.put("k".into(), "v2".into()).unwrap();
    map.put("new".into(), "x".into()).unwrap();
    map.rollback().unwrap();

    assert_eq!(map.get(&"k".to_string()).unwrap(), Some("v1".to_string()));
    assert_eq!(map.get(&"new".to_string()).unwrap(), None);
    assert_eq!(map.size(), 1);
    assert!(!map.has_uncommitted_changes());
}

#[test]
fn test_rollback_of_never_committed_map() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    map.put(1, 1).unwrap();
    map.rollback().unwrap();

    assert_eq!(map.get(&1).unwrap(), None);
    assert!(map.is_empty());
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_open_version_matches_commit() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, String> = storage.open_btree_map("test").unwrap();

    for i in 0..50 {
        map.put(i, format!("a{}", i)).unwrap();
    }
    let v1 = map.commit().unwrap();

    for i in 0..50 {
        map.put(i, format!("b{}", i)).unwrap();
    }
    map.remove(&0).unwrap();
    let v2 = map.commit().unwrap();

    let old = map.open_version(v1).unwrap();
    assert_eq!(old.version(), v1);
    assert_eq!(old.size(), 50);
    for i in 0..50 {
        assert_eq!(old.get(&i).unwrap(), Some(format!("a{}", i)));
    }

    let new = map.open_version(v2).unwrap();
    assert_eq!(new.get(&0).unwrap(), None);
    assert_eq!(new.get(&1).unwrap(), Some("b1".to_string()));

    let empty = map.open_version(0).unwrap();
    assert!(empty.is_empty());
}

#[test]
fn test_snapshot_ignores_later_writes() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    map.put(1, 1).unwrap();
    let v = map.commit().unwrap();

    let snapshot = map.open_version(v).unwrap();
    map.put(1, 100).unwrap();
    map.put(2, 200).unwrap();
    map.commit().unwrap();

    assert_eq!(snapshot.get(&1).unwrap(), Some(1));
    assert_eq!(snapshot.get(&2).unwrap(), None);
}

#[test]
fn test_snapshot_is_read_only() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    map.put(1, 1).unwrap();
    let v = map.commit().unwrap();

    let snapshot = map.open_version(v).unwrap();
    assert!(snapshot.is_read_only());
    assert!(matches!(snapshot.put(2, 2), Err(AoError::UnsupportedOperation(_))));
    assert!(matches!(snapshot.remove(&1), Err(AoError::UnsupportedOperation(_))));
    assert!(matches!(snapshot.clear(), Err(AoError::UnsupportedOperation(_))));
    assert!(matches!(snapshot.commit(), Err(AoError::UnsupportedOperation(_))));
    assert_eq!(map.get(&1).unwrap(), Some(1));
}

#[test]
fn test_future_version_resolves_to_latest() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    map.put(1, 1).unwrap();
    let v = map.commit().unwrap();

    let snapshot = map.open_version(v + 100).unwrap();
    assert_eq!(snapshot.version(), v);
}

// =============================================================================
// Retention Tests
// =============================================================================

#[test]
fn test_too_old_version_resolves_to_oldest_retained() {
    let storage = Config::builder()
        .in_memory()
        .auto_commit_disabled()
        .retention(RetentionPolicy::Versions(2))
        .open_storage()
        .unwrap();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();

    for v in 1..=5u32 {
        map.put(1, v).unwrap();
        map.commit().unwrap();
    }
    assert_eq!(map.retained_versions(), vec![4, 5]);

    let snapshot = map.open_version(1).unwrap();
    assert_eq!(snapshot.version(), 4);
    assert_eq!(snapshot.get(&1).unwrap(), Some(4));
}

#[test]
fn test_time_window_retention() {
    let storage = Config::builder()
        .in_memory()
        .auto_commit_disabled()
        .retention(RetentionPolicy::Duration(Duration::from_millis(500)))
        .open_storage()
        .unwrap();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();

    for v in 1..=2u32 {
        map.put(1, v).unwrap();
        map.commit().unwrap();
    }
    // Everything so far is inside the window
    assert_eq!(map.retained_versions(), vec![0, 1, 2]);
    assert!(storage.find_unused_chunks().unwrap().is_empty());

    thread::sleep(Duration::from_millis(700));
    map.put(1, 3).unwrap();
    map.commit().unwrap();

    assert_eq!(map.retained_versions(), vec![3]);
    let snapshot = map.open_version(1).unwrap();
    assert_eq!(snapshot.version(), 3);
    assert_eq!(snapshot.get(&1).unwrap(), Some(3));

    let unused: Vec<u32> = storage
        .find_unused_chunks()
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(unused, vec![1, 2]);
}

#[test]
fn test_missing_pages_are_version_unavailable() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = open_storage(temp_dir.path());
        let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
        map.put(1, 1).unwrap();
        assert_eq!(map.commit().unwrap(), 1);
        map.put(1, 2).unwrap();
        assert_eq!(map.commit().unwrap(), 2);
        storage.close().unwrap();
    }

    // Version 1 lives entirely in the first chunk
    fs::remove_file(temp_dir.path().join("c_000001.db")).unwrap();

    let storage = open_storage(temp_dir.path());
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(2));

    match map.open_version(1) {
        Err(AoError::VersionUnavailable { map, version, .. }) => {
            assert_eq!(map, "test");
            assert_eq!(version, 1);
        }
        other => panic!("expected VersionUnavailable, got {:?}", other.map(|m| m.version())),
    }
}

#[test]
fn test_versions_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = open_storage(temp_dir.path());
        let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
        map.put(1, 1).unwrap();
        map.commit().unwrap();
        map.put(1, 2).unwrap();
        map.commit().unwrap();
    }

    let storage = open_storage(temp_dir.path());
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    assert_eq!(map.version(), 2);
    assert_eq!(map.open_version(1).unwrap().get(&1).unwrap(), Some(1));
    assert_eq!(map.get(&1).unwrap(), Some(2));
}
