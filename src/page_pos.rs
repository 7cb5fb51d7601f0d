//! Page Position Codec
//!
//! Every page is addressed by a single `u64` that packs the chunk holding
//! it, its offset inside the chunk's page area, a quantized length and the
//! page type.
//!
//! ## Bit Layout
//! ```text
//! ┌──────────────────┬──────────────────────┬─────────────┬──────────┐
//! │ chunk id (24)    │ offset (32)          │ len code (5)│ type (3) │
//! └──────────────────┴──────────────────────┴─────────────┴──────────┘
//!  63              40 39                   8 7           3 2        0
//! ```
//!
//! The length is not stored verbatim: the code selects the smallest bucket
//! `(2 + (code & 1)) << ((code >> 1) + 4)` that holds the page, so buckets
//! go 32, 48, 64, 96, 128, ... up to 1.5 MiB.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AoError, Result};

/// Largest chunk id that fits the 24-bit field
pub const MAX_CHUNK_ID: u32 = (1 << 24) - 1;

/// Largest offset that fits the 32-bit field
pub const MAX_OFFSET: u64 = u32::MAX as u64;

/// Smallest length bucket
pub const MIN_PAGE_LENGTH: u32 = 32;

/// Largest length bucket (code 31)
pub const MAX_PAGE_LENGTH: u32 = bucket_length(31);

const CHUNK_SHIFT: u32 = 40;
const OFFSET_SHIFT: u32 = 8;
const LENGTH_SHIFT: u32 = 3;
const LENGTH_MASK: u64 = 0x1f;
const TYPE_MASK: u64 = 0x7;

/// Map kind recorded in a page's type bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapKind {
    BTree,
    RTree,
}

impl MapKind {
    fn tag(self) -> u8 {
        match self {
            MapKind::BTree => 0,
            MapKind::RTree => 1,
        }
    }
}

/// Page type tag: bit 0 is the node flag, bits 1-2 the map kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageType(u8);

impl PageType {
    pub const LEAF: PageType = PageType(0);
    pub const NODE: PageType = PageType(1);

    /// Wrap a raw tag; values above 7 are rejected by `PagePosition::encode`
    pub const fn from_raw(raw: u8) -> PageType {
        PageType(raw)
    }

    pub fn leaf(kind: MapKind) -> PageType {
        PageType(kind.tag() << 1)
    }

    pub fn node(kind: MapKind) -> PageType {
        PageType((kind.tag() << 1) | 1)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn is_node(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn map_kind(self) -> Option<MapKind> {
        match self.0 >> 1 {
            0 => Some(MapKind::BTree),
            1 => Some(MapKind::RTree),
            _ => None,
        }
    }
}

/// Bucket size for a length code
pub const fn bucket_length(code: u8) -> u32 {
    (2 + (code as u32 & 1)) << ((code as u32 >> 1) + 4)
}

/// Smallest length code whose bucket holds `len` bytes
pub fn length_code(len: u64) -> Option<u8> {
    (0u8..32).find(|&code| u64::from(bucket_length(code)) >= len)
}

/// Packed page address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PagePosition(u64);

impl PagePosition {
    /// Pack a page address, quantizing `length` up to its bucket
    pub fn encode(chunk_id: u32, offset: u64, length: u64, page_type: PageType) -> Result<Self> {
        if chunk_id == 0 || chunk_id > MAX_CHUNK_ID {
            return Err(AoError::InvalidAddress(format!(
                "chunk id {} outside 1..={}",
                chunk_id, MAX_CHUNK_ID
            )));
        }
        if offset > MAX_OFFSET {
            return Err(AoError::InvalidAddress(format!(
                "offset {} exceeds {}",
                offset, MAX_OFFSET
            )));
        }
        let code = length_code(length).ok_or_else(|| {
            AoError::InvalidAddress(format!(
                "page length {} exceeds {}",
                length, MAX_PAGE_LENGTH
            ))
        })?;
        if u64::from(page_type.raw()) > TYPE_MASK {
            return Err(AoError::InvalidAddress(format!(
                "page type {} does not fit 3 bits",
                page_type.raw()
            )));
        }

        Ok(PagePosition(
            (u64::from(chunk_id) << CHUNK_SHIFT)
                | (offset << OFFSET_SHIFT)
                | (u64::from(code) << LENGTH_SHIFT)
                | u64::from(page_type.raw()),
        ))
    }

    /// Rebuild from a stored value; `0` means "no page"
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(PagePosition(raw))
        }
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn chunk_id(self) -> u32 {
        (self.0 >> CHUNK_SHIFT) as u32
    }

    pub fn offset(self) -> u64 {
        (self.0 >> OFFSET_SHIFT) & MAX_OFFSET
    }

    pub fn length_code(self) -> u8 {
        ((self.0 >> LENGTH_SHIFT) & LENGTH_MASK) as u8
    }

    /// Upper bound of the page's serialized length
    pub fn max_length(self) -> u32 {
        bucket_length(self.length_code())
    }

    pub fn page_type(self) -> PageType {
        PageType((self.0 & TYPE_MASK) as u8)
    }

    pub fn is_leaf(self) -> bool {
        !self.page_type().is_node()
    }
}

impl fmt::Debug for PagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PagePosition(chunk={}, offset={}, max_len={}, type={})",
            self.chunk_id(),
            self.offset(),
            self.max_length(),
            self.page_type().raw()
        )
    }
}
