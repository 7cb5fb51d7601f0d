//! Tests for Storage
//!
//! These tests verify:
//! - Maps persist across reopen and are found by name
//! - Type and kind conflicts are configuration errors
//! - Directory locking and read-only access
//! - Encrypted storages and key checks
//! - Close semantics, auto-commit and stats

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use aostore::config::MAX_PAGE_SPLIT_SIZE;
use aostore::{AoError, BTreeMap, Config, Storage};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_storage(path: &Path) -> Storage {
    Config::builder()
        .storage_name(path)
        .auto_commit_disabled()
        .open_storage()
        .unwrap()
}

fn open_read_only(path: &Path) -> aostore::Result<Storage> {
    Config::builder()
        .storage_name(path)
        .auto_commit_disabled()
        .read_only()
        .open_storage()
}

fn open_encrypted(path: &Path, key: &str) -> aostore::Result<Storage> {
    Config::builder()
        .storage_name(path)
        .auto_commit_disabled()
        .encryption_key(key)
        .open_storage()
}

fn populate(path: &Path) {
    let storage = open_storage(path);
    let map: BTreeMap<String, String> = storage.open_btree_map("data").unwrap();
    for i in 0..100 {
        map.put(format!("key{:03}", i), format!("value{}", i)).unwrap();
    }
    map.commit().unwrap();
    storage.close().unwrap();
}

fn assert_config_error<T>(result: aostore::Result<T>) {
    match result {
        Err(AoError::Config(_)) => {}
        Err(other) => panic!("expected Config error, got {:?}", other),
        Ok(_) => panic!("expected Config error, got Ok"),
    }
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_reopen_restores_maps() {
    let temp_dir = TempDir::new().unwrap();
    populate(temp_dir.path());

    let storage = open_storage(temp_dir.path());
    let map: BTreeMap<String, String> = storage.open_btree_map("data").unwrap();
    assert_eq!(map.size(), 100);
    assert_eq!(map.version(), 1);
    assert_eq!(
        map.get(&"key042".to_string()).unwrap(),
        Some("value42".to_string())
    );
}

#[test]
fn test_map_names_and_has_map() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open_storage(temp_dir.path());

    let b: BTreeMap<u32, u32> = storage.open_btree_map("beta").unwrap();
    let a: BTreeMap<u32, u32> = storage.open_btree_map("alpha").unwrap();
    a.put(1, 1).unwrap();
    b.put(1, 1).unwrap();
    storage.commit_all().unwrap();

    assert_eq!(storage.map_names().unwrap(), vec!["alpha", "beta"]);
    assert!(storage.has_map("alpha").unwrap());
    assert!(!storage.has_map("gamma").unwrap());
    storage.close().unwrap();

    let storage = open_storage(temp_dir.path());
    assert_eq!(storage.map_names().unwrap(), vec!["alpha", "beta"]);
}

#[test]
fn test_remove_map() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open_storage(temp_dir.path());
    let map: BTreeMap<u32, u32> = storage.open_btree_map("gone").unwrap();
    map.put(1, 1).unwrap();
    map.commit().unwrap();

    assert!(storage.remove_map("gone").unwrap());
    assert!(!storage.remove_map("gone").unwrap());
    assert!(!storage.has_map("gone").unwrap());
    assert!(map.is_closed());
    assert!(matches!(map.get(&1), Err(AoError::StoreClosed(_))));
    storage.close().unwrap();

    let storage = open_storage(temp_dir.path());
    assert!(!storage.has_map("gone").unwrap());

    // A map with the same name starts over
    let map: BTreeMap<u32, u32> = storage.open_btree_map("gone").unwrap();
    assert!(map.is_empty());
    assert_eq!(map.version(), 0);
}

#[test]
fn test_reopening_a_map_shares_state() {
    let storage = Config::builder()
        .in_memory()
        .auto_commit_disabled()
        .open_storage()
        .unwrap();
    let first: BTreeMap<u32, String> = storage.open_btree_map("shared").unwrap();
    first.put(1, "one".into()).unwrap();

    let second: BTreeMap<u32, String> = storage.open_btree_map("shared").unwrap();
    assert_eq!(second.get(&1).unwrap(), Some("one".to_string()));
    assert!(second.has_uncommitted_changes());
}

#[test]
fn test_conflicting_map_types() {
    let storage = Config::builder()
        .in_memory()
        .auto_commit_disabled()
        .open_storage()
        .unwrap();
    let _map: BTreeMap<u32, u32> = storage.open_btree_map("typed").unwrap();

    assert_config_error(storage.open_btree_map::<String, String>("typed"));
    assert_config_error(storage.open_rtree_map::<u32>("typed", 2));
    assert_config_error(storage.open_btree_map::<u32, u32>(""));
}

// =============================================================================
// Locking Tests
// =============================================================================

#[test]
fn test_second_open_is_locked_out() {
    let temp_dir = TempDir::new().unwrap();
    let _storage = open_storage(temp_dir.path());

    let second = Config::builder()
        .storage_name(temp_dir.path())
        .open_storage();
    assert!(matches!(second, Err(AoError::FileLocked(_))));
}

#[test]
fn test_lock_released_on_close() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open_storage(temp_dir.path());
    storage.close().unwrap();

    let again = Config::builder()
        .storage_name(temp_dir.path())
        .auto_commit_disabled()
        .open_storage();
    assert!(again.is_ok());
}

#[test]
fn test_read_only_open() {
    let temp_dir = TempDir::new().unwrap();
    populate(temp_dir.path());

    let storage = open_read_only(temp_dir.path()).unwrap();
    let other = open_read_only(temp_dir.path()).unwrap();
    assert!(storage.is_read_only());

    let map: BTreeMap<String, String> = storage.open_btree_map("data").unwrap();
    assert!(map.is_read_only());
    assert_eq!(map.size(), 100);
    assert!(matches!(
        map.put("x".into(), "y".into()),
        Err(AoError::UnsupportedOperation(_))
    ));
    assert!(matches!(
        storage.free_unused_chunks(),
        Err(AoError::UnsupportedOperation(_))
    ));
    assert!(matches!(
        storage.compact_rewrite_fully(),
        Err(AoError::UnsupportedOperation(_))
    ));

    let map: BTreeMap<String, String> = other.open_btree_map("data").unwrap();
    assert_eq!(
        map.get(&"key000".to_string()).unwrap(),
        Some("value0".to_string())
    );
}

#[test]
fn test_read_only_needs_existing_storage() {
    let temp_dir = TempDir::new().unwrap();

    let missing = temp_dir.path().join("missing");
    assert!(matches!(
        open_read_only(&missing),
        Err(AoError::InvalidPath(_))
    ));

    assert_config_error(open_read_only(temp_dir.path()));
}

// =============================================================================
// Encryption Tests
// =============================================================================

#[test]
fn test_encrypted_storage() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = open_encrypted(temp_dir.path(), "s3cret").unwrap();
        let map: BTreeMap<String, String> = storage.open_btree_map("vault").unwrap();
        map.put("account".into(), "topsecretvalue".into()).unwrap();
        map.commit().unwrap();
        storage.close().unwrap();
    }

    for entry in fs::read_dir(temp_dir.path()).unwrap() {
        let bytes = fs::read(entry.unwrap().path()).unwrap();
        assert!(!bytes.windows(9).any(|w| w == b"topsecret"));
        assert!(!bytes.windows(5).any(|w| w == b"vault"));
    }

    let storage = open_encrypted(temp_dir.path(), "s3cret").unwrap();
    let map: BTreeMap<String, String> = storage.open_btree_map("vault").unwrap();
    assert_eq!(
        map.get(&"account".to_string()).unwrap(),
        Some("topsecretvalue".to_string())
    );
}

#[test]
fn test_encryption_key_mismatches() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = open_encrypted(temp_dir.path(), "right").unwrap();
        let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();
        map.put(1, 1).unwrap();
        map.commit().unwrap();
    }

    assert_config_error(open_encrypted(temp_dir.path(), "wrong"));
    assert_config_error(
        Config::builder()
            .storage_name(temp_dir.path())
            .auto_commit_disabled()
            .open_storage(),
    );

    // A failed open leaves the chunks alone
    let storage = open_encrypted(temp_dir.path(), "right").unwrap();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(1));
}

#[test]
fn test_key_for_plain_storage_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    populate(temp_dir.path());

    assert_config_error(open_encrypted(temp_dir.path(), "unexpected"));
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_in_memory_touches_no_files() {
    let temp_dir = TempDir::new().unwrap();
    let storage = Config::builder()
        .storage_name(temp_dir.path().join("never"))
        .in_memory()
        .open_storage()
        .unwrap();
    assert!(storage.is_in_memory());

    let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();
    map.put(1, 1).unwrap();
    map.commit().unwrap();
    storage.close().unwrap();

    assert!(!temp_dir.path().join("never").exists());
}

#[test]
fn test_close_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open_storage(temp_dir.path());
    let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();

    storage.close().unwrap();
    storage.close().unwrap();

    assert!(storage.is_closed());
    assert!(map.is_closed());
    assert!(matches!(storage.map_names(), Err(AoError::StoreClosed(_))));
    assert!(matches!(
        storage.open_btree_map::<u32, u32>("m"),
        Err(AoError::StoreClosed(_))
    ));
    assert!(matches!(map.get(&1), Err(AoError::StoreClosed(_))));
    assert!(matches!(map.put(1, 1), Err(AoError::StoreClosed(_))));
}

#[test]
fn test_close_commits_when_auto_commit_enabled() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = Config::builder()
            .storage_name(temp_dir.path())
            .auto_commit_delay(Duration::from_secs(3600))
            .open_storage()
            .unwrap();
        let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();
        map.put(1, 10).unwrap();
    }

    let storage = open_storage(temp_dir.path());
    let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(10));
}

#[test]
fn test_close_discards_without_auto_commit() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = open_storage(temp_dir.path());
        let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();
        map.put(1, 10).unwrap();
        map.commit().unwrap();
        map.put(2, 20).unwrap();
    }

    let storage = open_storage(temp_dir.path());
    let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(10));
    assert_eq!(map.get(&2).unwrap(), None);
}

#[test]
fn test_auto_commit_runs_in_background() {
    let temp_dir = TempDir::new().unwrap();
    let storage = Config::builder()
        .storage_name(temp_dir.path())
        .auto_commit_delay(Duration::from_millis(20))
        .open_storage()
        .unwrap();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();
    map.put(1, 1).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while map.has_uncommitted_changes() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!map.has_uncommitted_changes());
    assert!(map.version() >= 1);
}

#[test]
fn test_commit_all() {
    let storage = Config::builder()
        .in_memory()
        .auto_commit_disabled()
        .open_storage()
        .unwrap();
    let a: BTreeMap<u32, u32> = storage.open_btree_map("a").unwrap();
    let b: BTreeMap<u32, u32> = storage.open_btree_map("b").unwrap();
    let _c: BTreeMap<u32, u32> = storage.open_btree_map("c").unwrap();
    a.put(1, 1).unwrap();
    b.put(1, 1).unwrap();

    assert_eq!(storage.commit_all().unwrap(), 2);
    assert_eq!(storage.commit_all().unwrap(), 0);
    assert_eq!(a.version(), 1);
    assert_eq!(b.version(), 1);
}

#[test]
fn test_stats() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open_storage(temp_dir.path());
    let map: BTreeMap<u32, u32> = storage.open_btree_map("m").unwrap();
    for i in 0..10 {
        map.put(i, i).unwrap();
    }
    map.commit().unwrap();

    let stats = storage.stats().unwrap();
    assert_eq!(stats.chunk_count, 1);
    assert_eq!(stats.map_count, 1);
    assert_eq!(stats.open_map_count, 1);
    assert_eq!(stats.page_count, 1);
    assert_eq!(stats.page_count_live, 1);
    assert_eq!(stats.fill_rate(), 100);
    assert!(stats.chunk_bytes > 0);
    assert!(stats.io.write_bytes >= stats.chunk_bytes);
}

#[test]
fn test_invalid_config_is_rejected() {
    assert_config_error(
        Config::builder()
            .in_memory()
            .page_split_size(8)
            .open_storage(),
    );
    assert_config_error(Config::builder().in_memory().read_only().open_storage());
    assert_config_error(
        Config::builder()
            .in_memory()
            .page_cache_size(0)
            .open_storage(),
    );
    // Pages this large could not be addressed once written
    assert_config_error(
        Config::builder()
            .in_memory()
            .page_split_size(4 << 20)
            .open_storage(),
    );
    assert_config_error(
        Config::builder()
            .in_memory()
            .page_split_size(MAX_PAGE_SPLIT_SIZE + 1)
            .open_storage(),
    );
}

#[test]
fn test_largest_split_size_commits() {
    let storage = Config::builder()
        .in_memory()
        .auto_commit_disabled()
        .page_split_size(MAX_PAGE_SPLIT_SIZE)
        .open_storage()
        .unwrap();
    let map: BTreeMap<u32, Vec<u8>> = storage.open_btree_map("big").unwrap();

    for i in 0..1200u32 {
        map.put(i, vec![(i % 251) as u8; 1000]).unwrap();
    }
    assert_eq!(map.commit().unwrap(), 1);
    assert_eq!(map.get(&1199).unwrap(), Some(vec![(1199 % 251) as u8; 1000]));
}
