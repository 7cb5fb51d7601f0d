//! # AOStore
//!
//! An embedded, append-oriented key-value storage engine with:
//! - Copy-on-write B-tree maps: every commit is a new, readable version
//! - Chunk files: one append-only segment per commit, reclaimed whole
//! - Compact page addressing (chunk, offset, length bucket, type in a `u64`)
//! - Advisory file locking and optional transparent encryption
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Storage                              │
//! │        (named maps, auto-commit, GC and compaction)          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  BTreeMap   │          │  RTreeMap   │
//!   │ (COW pages) │          │ (box keys)  │
//!   └──────┬──────┘          └──────┬──────┘
//!          └────────────┬───────────┘
//!                       ▼
//!               ┌───────────────┐
//!               │ ChunkManager  │
//!               │ (live pages)  │
//!               └───────┬───────┘
//!                       ▼
//!               ┌───────────────┐
//!               │   FileStore   │
//!               │ (lock, crypt) │
//!               └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod page_pos;
pub mod file;
pub mod chunk;
pub mod btree;
pub mod rtree;
pub mod storage;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use btree::{BTreeMap, Cursor, KeyList, MapKey, MapValue};
pub use chunk::Chunk;
pub use config::{Config, ConfigBuilder, RetentionPolicy};
pub use error::{AoError, Result};
pub use page_pos::{MapKind, PagePosition, PageType};
pub use rtree::{RTreeMap, SpatialKey};
pub use storage::{Storage, StorageStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AOStore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
