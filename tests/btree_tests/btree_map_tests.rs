//! Tests for BTreeMap
//!
//! These tests verify:
//! - put / get / remove / replace family semantics
//! - Rank and select (get_key, get_key_index)
//! - Ordered navigation (ceiling, higher, floor, lower)
//! - Splits and removals across multi-level trees
//! - Read-only key lists

use aostore::{AoError, BTreeMap, Config, Storage};
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

/// Small pages so a few hundred keys build a multi-level tree
fn small_page_storage() -> Storage {
    Config::builder()
        .in_memory()
        .auto_commit_disabled()
        .page_split_size(256)
        .open_storage()
        .unwrap()
}

fn fill_hundreds(map: &BTreeMap<String, String>) {
    for i in 100..300 {
        map.put(i.to_string(), format!("value{}", i)).unwrap();
    }
}

fn collect_keys(map: &BTreeMap<u32, u32>) -> Vec<u32> {
    map.iter().unwrap().map(|e| e.unwrap().0).collect()
}

// =============================================================================
// Basic Operation Tests
// =============================================================================

#[test]
fn test_put_if_absent() {
    let storage = in_memory_storage();
    let map: BTreeMap<String, String> = storage.open_btree_map("test").unwrap();

    map.put("10".into(), "a".into()).unwrap();
    assert_eq!(
        map.put_if_absent("10".into(), "a1".into()).unwrap(),
        Some("a".to_string())
    );
    assert_eq!(map.get(&"10".to_string()).unwrap(), Some("a".to_string()));

    assert_eq!(map.put_if_absent("20".into(), "b".into()).unwrap(), None);
    assert_eq!(map.get(&"20".to_string()).unwrap(), Some("b".to_string()));
}

#[test]
fn test_put_returns_previous() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, String> = storage.open_btree_map("test").unwrap();

    assert_eq!(map.put(1, "one".into()).unwrap(), None);
    assert_eq!(map.put(1, "uno".into()).unwrap(), Some("one".to_string()));
    assert_eq!(map.size(), 1);
    assert!(map.contains_key(&1).unwrap());
    assert!(!map.contains_key(&2).unwrap());
}

#[test]
fn test_replace_if() {
    let storage = in_memory_storage();
    let map: BTreeMap<String, String> = storage.open_btree_map("test").unwrap();
    fill_hundreds(&map);

    let key = "100".to_string();
    assert!(!map
        .replace_if(key.clone(), &"wrong".to_string(), "value100".into())
        .unwrap());
    assert_eq!(map.get(&key).unwrap(), Some("value100".to_string()));

    assert!(map
        .replace_if(key.clone(), &"value100".to_string(), "value100a".into())
        .unwrap());
    assert_eq!(map.get(&key).unwrap(), Some("value100a".to_string()));

    assert!(!map
        .replace_if("missing".into(), &"value100".to_string(), "x".into())
        .unwrap());
    assert_eq!(map.size(), 200);
}

#[test]
fn test_replace_never_inserts() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, String> = storage.open_btree_map("test").unwrap();

    assert_eq!(map.replace(5, "five".into()).unwrap(), None);
    assert_eq!(map.get(&5).unwrap(), None);
    assert!(map.is_empty());

    map.put(5, "five".into()).unwrap();
    assert_eq!(map.replace(5, "FIVE".into()).unwrap(), Some("five".to_string()));
    assert_eq!(map.get(&5).unwrap(), Some("FIVE".to_string()));
}

#[test]
fn test_remove_and_clear() {
    let storage = small_page_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    for i in 0..500 {
        map.put(i, i * 2).unwrap();
    }

    assert_eq!(map.remove(&7).unwrap(), Some(14));
    assert_eq!(map.remove(&7).unwrap(), None);
    assert_eq!(map.size(), 499);

    map.clear().unwrap();
    assert!(map.is_empty());
    assert_eq!(map.get(&1).unwrap(), None);
    assert_eq!(map.first_key().unwrap(), None);
}

// =============================================================================
// Rank / Select Tests
// =============================================================================

#[test]
fn test_get_key_index() {
    let storage = in_memory_storage();
    let map: BTreeMap<String, String> = storage.open_btree_map("test").unwrap();
    fill_hundreds(&map);

    assert_eq!(map.get_key_index(&"100".to_string()).unwrap(), 0);
    assert_eq!(map.get_key_index(&"299".to_string()).unwrap(), 199);
    assert_eq!(map.get_key_index(&"100a".to_string()).unwrap(), -2);
    assert_eq!(map.get_key_index(&"103a".to_string()).unwrap(), -5);
}

#[test]
fn test_rank_select_multi_level() {
    let storage = small_page_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    // Insert out of order
    for i in (0..1000u32).rev() {
        map.put(i * 3, i).unwrap();
    }

    for rank in [0i64, 1, 2, 99, 500, 998, 999] {
        let key = map.get_key(rank).unwrap().unwrap();
        assert_eq!(key, rank as u32 * 3);
        assert_eq!(map.get_key_index(&key).unwrap(), rank);
    }

    // 4 falls between 3 (rank 1) and 6 (rank 2)
    assert_eq!(map.get_key_index(&4).unwrap(), -3);
    assert_eq!(map.get_key_index(&5000).unwrap(), -1001);
}

#[test]
fn test_get_key_out_of_range() {
    let storage = in_memory_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    assert_eq!(map.get_key(0).unwrap(), None);

    map.put(1, 1).unwrap();
    assert_eq!(map.get_key(-1).unwrap(), None);
    assert_eq!(map.get_key(1).unwrap(), None);
    assert_eq!(map.get_key(0).unwrap(), Some(1));
}

// =============================================================================
// Navigation Tests
// =============================================================================

#[test]
fn test_navigation() {
    let storage = small_page_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    for i in 0..100 {
        map.put(i * 10, i).unwrap();
    }

    assert_eq!(map.first_key().unwrap(), Some(0));
    assert_eq!(map.last_key().unwrap(), Some(990));

    assert_eq!(map.ceiling_key(&15).unwrap(), Some(20));
    assert_eq!(map.ceiling_key(&20).unwrap(), Some(20));
    assert_eq!(map.ceiling_key(&991).unwrap(), None);

    assert_eq!(map.higher_key(&20).unwrap(), Some(30));
    assert_eq!(map.higher_key(&25).unwrap(), Some(30));
    assert_eq!(map.higher_key(&990).unwrap(), None);

    assert_eq!(map.floor_key(&15).unwrap(), Some(10));
    assert_eq!(map.floor_key(&10).unwrap(), Some(10));

    assert_eq!(map.lower_key(&10).unwrap(), Some(0));
    assert_eq!(map.lower_key(&0).unwrap(), None);
    assert_eq!(map.lower_key(&5000).unwrap(), Some(990));
}

#[test]
fn test_iteration_is_ordered() {
    let storage = small_page_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    for i in [50u32, 10, 40, 30, 20] {
        map.put(i, i).unwrap();
    }
    for i in 100..400 {
        map.put(i, i).unwrap();
    }

    let keys = collect_keys(&map);
    assert_eq!(keys.len(), 305);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));

    let from_35: Vec<u32> = map
        .cursor(&35)
        .unwrap()
        .take(3)
        .map(|e| e.unwrap().0)
        .collect();
    assert_eq!(from_35, vec![40, 50, 100]);
}

// =============================================================================
// Split / Merge Tests
// =============================================================================

#[test]
fn test_many_keys_survive_commit() {
    let storage = small_page_storage();
    let map: BTreeMap<u32, String> = storage.open_btree_map("test").unwrap();
    for i in 0..2000 {
        map.put(i, format!("v{}", i)).unwrap();
    }
    map.commit().unwrap();

    for i in (0..2000).step_by(2) {
        assert_eq!(map.remove(&i).unwrap(), Some(format!("v{}", i)));
    }
    map.commit().unwrap();

    assert_eq!(map.size(), 1000);
    assert_eq!(map.get(&1).unwrap(), Some("v1".to_string()));
    assert_eq!(map.get(&2).unwrap(), None);
    assert_eq!(map.get_key(0).unwrap(), Some(1));
    assert_eq!(map.get_key(999).unwrap(), Some(1999));
    assert!(map.describe().unwrap().contains("node"));
}

#[test]
fn test_remove_everything_collapses_tree() {
    let storage = small_page_storage();
    let map: BTreeMap<u32, u32> = storage.open_btree_map("test").unwrap();
    for i in 0..300 {
        map.put(i, i).unwrap();
    }
    map.commit().unwrap();

    for i in 0..300 {
        assert_eq!(map.remove(&i).unwrap(), Some(i));
    }
    assert!(map.is_empty());
    assert!(collect_keys(&map).is_empty());

    map.put(42, 42).unwrap();
    assert_eq!(collect_keys(&map), vec![42]);
}

#[test]
fn test_compressed_pages() {
    let temp_dir = TempDir::new().unwrap();
    let storage = Config::builder()
        .storage_name(temp_dir.path())
        .auto_commit_disabled()
        .compress()
        .open_storage()
        .unwrap();
    let map: BTreeMap<u32, String> = storage.open_btree_map("test").unwrap();
    for i in 0..500 {
        map.put(i, "repetitive ".repeat(10)).unwrap();
    }
    map.commit().unwrap();
    storage.close().unwrap();

    let storage = Config::builder()
        .storage_name(temp_dir.path())
        .auto_commit_disabled()
        .open_storage()
        .unwrap();
    let map: BTreeMap<u32, String> = storage.open_btree_map("test").unwrap();
    assert_eq!(map.size(), 500);
    assert_eq!(map.get(&499).unwrap(), Some("repetitive ".repeat(10)));
}

// =============================================================================
// Key List Tests
// =============================================================================

#[test]
fn test_key_list_reads() {
    let storage = in_memory_storage();
    let map: BTreeMap<String, String> = storage.open_btree_map("test").unwrap();
    fill_hundreds(&map);

    let keys = map.key_list();
    assert_eq!(keys.len(), 200);
    assert_eq!(keys.get(0).unwrap(), Some("100".to_string()));
    assert_eq!(keys.get(199).unwrap(), Some("299".to_string()));
    assert_eq!(keys.get(200).unwrap(), None);
    assert_eq!(keys.index_of(&"150".to_string()).unwrap(), 50);
    assert_eq!(keys.iter().unwrap().count(), 200);
}

#[test]
fn test_key_list_rejects_mutation() {
    let storage = in_memory_storage();
    let map: BTreeMap<String, String> = storage.open_btree_map("test").unwrap();
    fill_hundreds(&map);
    let keys = map.key_list();

    assert!(matches!(keys.push("x".into()), Err(AoError::UnsupportedOperation(_))));
    assert!(matches!(keys.insert(0, "x".into()), Err(AoError::UnsupportedOperation(_))));
    assert!(matches!(keys.set(0, "x".into()), Err(AoError::UnsupportedOperation(_))));
    assert!(matches!(keys.remove(0), Err(AoError::UnsupportedOperation(_))));
    assert!(matches!(keys.clear(), Err(AoError::UnsupportedOperation(_))));
    assert_eq!(map.size(), 200);
}
