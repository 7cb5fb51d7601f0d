//! Chunk Module
//!
//! Append-only segments holding the pages of every map.
//!
//! ## Responsibilities
//! - Seal one chunk per commit (header, pages, state footer)
//! - Track live pages per chunk as versions fall out of retention
//! - Reclaim chunks without live pages, or rewrite everything into one chunk
//! - Recover the bookkeeping from the newest valid chunk
//!
//! ## File Format (`c_<id>.db`)
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ Header (32)                                │
//! │ ┌──────┬──────┬─────┬────┬───────────────┐ │
//! │ │Magic │Format│Flags│ Id │ PageCount ... │ │
//! │ └──────┴──────┴─────┴────┴───────────────┘ │
//! ├────────────────────────────────────────────┤
//! │ Page Area                                  │
//! │ ┌─────┬─────┬──────┬──────────┬─────────┐  │
//! │ │ Len │ CRC │ Type │ Children │ Payload │  │
//! │ └─────┴─────┴──────┴──────────┴─────────┘  │
//! │ ... (repeated for each page)               │
//! ├────────────────────────────────────────────┤
//! │ Footer: chunk table, map registry,         │
//! │         pending deaths (bincode)           │
//! └────────────────────────────────────────────┘
//! ```

pub(crate) mod format;
mod manager;
mod meta;

pub use manager::{ChunkManager, ChunkWriter, IoStats};
pub use meta::{Chunk, MapRecord, VersionRecord};

pub(crate) use manager::{ChunkReader, CommitRequest};
