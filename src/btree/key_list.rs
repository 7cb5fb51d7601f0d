//! Read-only list view over a map's keys

use crate::error::{AoError, Result};

use super::{BTreeMap, MapKey, MapValue};

/// Keys of a map addressed by rank
///
/// Reads go through the map's rank index. Every mutation fails with
/// `UnsupportedOperation`.
pub struct KeyList<K, V> {
    map: BTreeMap<K, V>,
}

impl<K: MapKey, V: MapValue> KeyList<K, V> {
    pub(crate) fn new(map: BTreeMap<K, V>) -> Self {
        Self { map }
    }

    pub fn get(&self, index: i64) -> Result<Option<K>> {
        self.map.get_key(index)
    }

    /// Rank of `key`, or `-(insertion_rank + 1)`
    pub fn index_of(&self, key: &K) -> Result<i64> {
        self.map.get_key_index(key)
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.index_of(key)? >= 0)
    }

    pub fn len(&self) -> u64 {
        self.map.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Result<impl Iterator<Item = Result<K>>> {
        Ok(self.map.iter()?.map(|entry| entry.map(|(k, _)| k)))
    }

    pub fn push(&self, _key: K) -> Result<()> {
        Err(Self::read_only("push"))
    }

    pub fn insert(&self, _index: i64, _key: K) -> Result<()> {
        Err(Self::read_only("insert"))
    }

    pub fn set(&self, _index: i64, _key: K) -> Result<K> {
        Err(Self::read_only("set"))
    }

    pub fn remove(&self, _index: i64) -> Result<K> {
        Err(Self::read_only("remove"))
    }

    pub fn clear(&self) -> Result<()> {
        Err(Self::read_only("clear"))
    }

    fn read_only(op: &str) -> AoError {
        AoError::UnsupportedOperation(format!("key list is read-only ({})", op))
    }
}
