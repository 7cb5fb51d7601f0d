//! Error types for AOStore
//!
//! Provides a unified error type for all operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using AoError
pub type Result<T> = std::result::Result<T, AoError>;

/// Unified error type for AOStore operations
#[derive(Debug, Error)]
pub enum AoError {
    // -------------------------------------------------------------------------
    // Addressing Errors
    // -------------------------------------------------------------------------
    #[error("Invalid page address: {0}")]
    InvalidAddress(String),

    // -------------------------------------------------------------------------
    // File Errors
    // -------------------------------------------------------------------------
    #[error("The file is locked: {}", .0.display())]
    FileLocked(PathBuf),

    #[error("Directory does not exist: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("Store is closed: {0}")]
    StoreClosed(String),

    #[error("Reading {} at position {pos} failed: {source}", .file.display())]
    ReadFailure {
        file: PathBuf,
        pos: u64,
        #[source]
        source: io::Error,
    },

    #[error("Writing {} at position {pos} failed: {source}", .file.display())]
    WriteFailure {
        file: PathBuf,
        pos: u64,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // -------------------------------------------------------------------------
    // Chunk / Version Errors
    // -------------------------------------------------------------------------
    #[error("Chunk {0} not found")]
    ChunkNotFound(u32),

    #[error("Version {version} of map {map} is unavailable: {reason}")]
    VersionUnavailable {
        map: String,
        version: u64,
        reason: String,
    },

    #[error("Compaction would drop version {version} of map {map}, which is still retained")]
    CompactionRetentionViolation { map: String, version: u64 },

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for AoError {
    fn from(err: bincode::Error) -> Self {
        AoError::Serialization(err.to_string())
    }
}
