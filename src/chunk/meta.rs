//! Chunk metadata and the persisted state snapshot

use serde::{Deserialize, Serialize};

use crate::page_pos::{MapKind, PagePosition};

/// An append-only storage segment holding one batch of pages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Monotonic id, never reused
    pub id: u32,

    /// Pages written into this chunk
    pub page_count: u32,

    /// Pages still reachable from some retained version
    pub page_count_live: u32,

    /// Sum of the pages' bucketed lengths
    pub max_len: u64,

    /// Bucketed length of the live pages
    pub max_len_live: u64,

    /// Size of the chunk file in bytes (header, pages and footer)
    pub length: u64,

    /// Unix millis when the chunk was sealed
    pub created_at: u64,
}

impl Chunk {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            page_count: 0,
            page_count_live: 0,
            max_len: 0,
            max_len_live: 0,
            length: 0,
            created_at: 0,
        }
    }

    /// Account for one page appended to this chunk
    pub fn record_page_write(&mut self, max_length: u32) {
        self.page_count += 1;
        self.page_count_live += 1;
        self.max_len += u64::from(max_length);
        self.max_len_live += u64::from(max_length);
    }

    /// Account for one page no retained version can reach anymore
    ///
    /// Returns false (and changes nothing) if the chunk has no live page left.
    pub fn record_page_death(&mut self, max_length: u32) -> bool {
        if self.page_count_live == 0 {
            return false;
        }
        self.page_count_live -= 1;
        self.max_len_live = self.max_len_live.saturating_sub(u64::from(max_length));
        true
    }

    /// No live pages: the whole chunk can be dropped
    pub fn is_unused(&self) -> bool {
        self.page_count_live == 0
    }

    /// Percentage of the page bytes that are still live
    pub fn fill_rate(&self) -> u8 {
        if self.max_len == 0 {
            return 0;
        }
        (self.max_len_live * 100 / self.max_len) as u8
    }
}

/// One committed root of a map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: u64,

    /// Root page, `None` for a map that was never committed
    pub root: Option<PagePosition>,

    /// Number of keys in the tree
    pub size: u64,

    /// Unix millis of the commit
    pub committed_at: u64,
}

impl VersionRecord {
    pub(crate) fn empty(committed_at: u64) -> Self {
        Self {
            version: 0,
            root: None,
            size: 0,
            committed_at,
        }
    }
}

/// Registry entry for a named map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRecord {
    pub id: u32,
    pub name: String,
    pub kind: MapKind,

    /// Bounding-box dimensions for spatial maps, 0 otherwise
    pub dimensions: u32,

    /// Retained versions, oldest first
    pub versions: Vec<VersionRecord>,
}

impl MapRecord {
    pub fn latest(&self) -> Option<&VersionRecord> {
        self.versions.last()
    }

    pub fn oldest(&self) -> Option<&VersionRecord> {
        self.versions.first()
    }

    /// Newest retained version committed at or before `version`
    pub fn at_or_before(&self, version: u64) -> Option<&VersionRecord> {
        self.versions.iter().rev().find(|v| v.version <= version)
    }
}

/// A page superseded by version `version` of map `map_id`
///
/// It stays live while any retained version older than `version` exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PendingDeath {
    pub map_id: u32,
    pub version: u64,
    pub pos: PagePosition,
}

/// Full bookkeeping snapshot written into every chunk footer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ChunkFooter {
    pub chunk_id: u32,
    pub next_map_id: u32,
    pub chunks: Vec<Chunk>,
    pub maps: Vec<MapRecord>,
    pub pending: Vec<PendingDeath>,
}
