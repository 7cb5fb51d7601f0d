//! Spatial Map
//!
//! Bounding-box keyed map layered on the versioned B-tree. Entries are
//! ordered by key id; the pages carry the R-tree map kind so a storage can
//! tell both kinds apart. Spatial queries scan the map in id order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::btree::{BTreeMap, Cursor, MapValue};
use crate::error::{AoError, Result};

/// Bounding box with an identity
///
/// Equality and ordering only consider `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialKey {
    pub id: u64,
    pub min: Vec<f32>,
    pub max: Vec<f32>,
}

impl SpatialKey {
    /// Build from interleaved bounds: `min0, max0, min1, max1, ...`
    ///
    /// An odd trailing bound is kept as a `min` without a `max`; spatial maps
    /// reject such a key instead of silently dropping the bound.
    pub fn new(id: u64, bounds: &[f32]) -> Self {
        let mut min = Vec::with_capacity(bounds.len().div_ceil(2));
        let mut max = Vec::with_capacity(bounds.len() / 2);
        for pair in bounds.chunks(2) {
            min.push(pair[0]);
            if let Some(&upper) = pair.get(1) {
                max.push(upper);
            }
        }
        Self { id, min, max }
    }

    /// Every dimension has both bounds
    pub fn is_well_formed(&self) -> bool {
        self.min.len() == self.max.len()
    }

    fn same_shape(&self, other: &SpatialKey) -> bool {
        self.is_well_formed() && other.is_well_formed() && self.dimensions() == other.dimensions()
    }

    pub fn dimensions(&self) -> usize {
        self.min.len()
    }

    /// Boxes overlap in every dimension (touching counts)
    pub fn intersects(&self, other: &SpatialKey) -> bool {
        self.same_shape(other)
            && (0..self.dimensions())
                .all(|d| self.min[d] <= other.max[d] && other.min[d] <= self.max[d])
    }

    /// `other` lies entirely inside this box
    pub fn contains(&self, other: &SpatialKey) -> bool {
        self.same_shape(other)
            && (0..self.dimensions())
                .all(|d| self.min[d] <= other.min[d] && other.max[d] <= self.max[d])
    }
}

impl PartialEq for SpatialKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SpatialKey {}

impl PartialOrd for SpatialKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpatialKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// Map keyed by bounding boxes of a fixed dimension count
pub struct RTreeMap<V> {
    map: BTreeMap<SpatialKey, V>,
    dimensions: u32,
}

impl<V> Clone for RTreeMap<V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            dimensions: self.dimensions,
        }
    }
}

impl<V: MapValue> RTreeMap<V> {
    pub(crate) fn new(map: BTreeMap<SpatialKey, V>, dimensions: u32) -> Self {
        Self { map, dimensions }
    }

    pub fn name(&self) -> &str {
        self.map.name()
    }

    pub fn dimensions(&self) -> u32 {
        self.dimensions
    }

    pub fn size(&self) -> u64 {
        self.map.size()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.map.version()
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.map.has_uncommitted_changes()
    }

    pub fn put(&self, key: SpatialKey, value: V) -> Result<Option<V>> {
        self.check_dimensions(&key)?;
        self.map.put(key, value)
    }

    /// Value stored under `key.id`
    pub fn get(&self, key: &SpatialKey) -> Result<Option<V>> {
        self.map.get(key)
    }

    pub fn remove(&self, key: &SpatialKey) -> Result<Option<V>> {
        self.map.remove(key)
    }

    pub fn commit(&self) -> Result<u64> {
        self.map.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.map.rollback()
    }

    pub fn iter(&self) -> Result<Cursor<SpatialKey, V>> {
        self.map.iter()
    }

    /// Entries whose box overlaps `query`
    pub fn find_intersecting(&self, query: &SpatialKey) -> Result<Vec<(SpatialKey, V)>> {
        self.check_dimensions(query)?;
        self.scan(|key| key.intersects(query))
    }

    /// Entries whose box lies inside `query`
    pub fn find_contained_in(&self, query: &SpatialKey) -> Result<Vec<(SpatialKey, V)>> {
        self.check_dimensions(query)?;
        self.scan(|key| query.contains(key))
    }

    fn scan(&self, mut keep: impl FnMut(&SpatialKey) -> bool) -> Result<Vec<(SpatialKey, V)>> {
        let mut found = Vec::new();
        for entry in self.map.iter()? {
            let (key, value) = entry?;
            if keep(&key) {
                found.push((key, value));
            }
        }
        Ok(found)
    }

    fn check_dimensions(&self, key: &SpatialKey) -> Result<()> {
        if !key.is_well_formed() {
            return Err(AoError::UnsupportedOperation(format!(
                "key {} has {} lower but {} upper bounds",
                key.id,
                key.min.len(),
                key.max.len()
            )));
        }
        if key.dimensions() != self.dimensions as usize {
            return Err(AoError::UnsupportedOperation(format!(
                "key {} has {} dimensions, map {} expects {}",
                key.id,
                key.dimensions(),
                self.map.name(),
                self.dimensions
            )));
        }
        Ok(())
    }
}
