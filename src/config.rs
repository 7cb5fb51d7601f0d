//! Configuration for AOStore
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AoError, Result};
use crate::page_pos::MAX_PAGE_LENGTH;
use crate::storage::Storage;

/// Largest accepted `page_split_size`
///
/// A page grows past the threshold by one entry before it splits, and the
/// record must still fit the largest length bucket. Half of it leaves that room.
pub const MAX_PAGE_SPLIT_SIZE: usize = MAX_PAGE_LENGTH as usize / 2;

/// Main configuration for a storage instance
#[derive(Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the storage files
    /// Internal structure:
    ///   {storage_name}/
    ///     ├── aostore.lock     (exclusive lock, encryption salt)
    ///     └── c_000001.db ...  (one file per chunk)
    pub storage_name: PathBuf,

    /// Keep all chunks resident in memory, never touching the file system
    pub in_memory: bool,

    /// Open existing files with shared locks and reject every mutation
    pub read_only: bool,

    // -------------------------------------------------------------------------
    // Page Configuration
    // -------------------------------------------------------------------------
    /// Split a page once its estimated serialized size exceeds this (bytes,
    /// at most `MAX_PAGE_SPLIT_SIZE`)
    pub page_split_size: usize,

    /// Compress page payloads with zstd
    pub compress: bool,

    /// zstd level used when `compress` is set
    pub compression_level: i32,

    /// Max number of decoded pages cached per map
    pub page_cache_size: usize,

    // -------------------------------------------------------------------------
    // Commit Configuration
    // -------------------------------------------------------------------------
    /// Commit dirty maps periodically from a background thread
    pub auto_commit: bool,

    /// Interval between implicit commits
    pub auto_commit_delay: Duration,

    /// How many historical versions stay readable
    pub retention: RetentionPolicy,

    // -------------------------------------------------------------------------
    // Encryption Configuration
    // -------------------------------------------------------------------------
    /// Password the file cipher key is derived from
    pub encryption_key: Option<String>,
}

/// Which historical versions of a map are kept readable
///
/// Pages superseded by a commit stay live until no retained version
/// references them; only then can their chunk become unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the newest `n` committed versions of every map
    Versions(usize),

    /// Keep every version committed within the window (the newest always stays)
    Duration(Duration),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Versions(10)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_name: PathBuf::from("./aostore_data"),
            in_memory: false,
            read_only: false,
            page_split_size: 16 * 1024, // 16 KB
            compress: false,
            compression_level: 3,
            page_cache_size: 1024,
            auto_commit: true,
            auto_commit_delay: Duration::from_secs(1),
            retention: RetentionPolicy::default(),
            encryption_key: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("storage_name", &self.storage_name)
            .field("in_memory", &self.in_memory)
            .field("read_only", &self.read_only)
            .field("page_split_size", &self.page_split_size)
            .field("compress", &self.compress)
            .field("compression_level", &self.compression_level)
            .field("page_cache_size", &self.page_cache_size)
            .field("auto_commit", &self.auto_commit)
            .field("auto_commit_delay", &self.auto_commit_delay)
            .field("retention", &self.retention)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject combinations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if !(64..=MAX_PAGE_SPLIT_SIZE).contains(&self.page_split_size) {
            return Err(AoError::Config(format!(
                "page_split_size must be within 64..={} bytes, got {}",
                MAX_PAGE_SPLIT_SIZE, self.page_split_size
            )));
        }
        if self.page_cache_size == 0 {
            return Err(AoError::Config("page_cache_size must be non-zero".into()));
        }
        if let RetentionPolicy::Versions(0) = self.retention {
            return Err(AoError::Config(
                "retention must keep at least one version".into(),
            ));
        }
        if self.auto_commit && self.auto_commit_delay.is_zero() {
            return Err(AoError::Config("auto_commit_delay must be non-zero".into()));
        }
        if matches!(&self.encryption_key, Some(key) if key.is_empty()) {
            return Err(AoError::Config("encryption key must not be empty".into()));
        }
        if self.in_memory && self.read_only {
            return Err(AoError::Config(
                "an in-memory storage cannot be read-only".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the storage directory
    pub fn storage_name(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_name = path.into();
        self
    }

    /// Enable page compression
    pub fn compress(mut self) -> Self {
        self.config.compress = true;
        self
    }

    /// Set the zstd compression level (implies `compress`)
    pub fn compression_level(mut self, level: i32) -> Self {
        self.config.compress = true;
        self.config.compression_level = level;
        self
    }

    /// Suppress implicit periodic commits
    pub fn auto_commit_disabled(mut self) -> Self {
        self.config.auto_commit = false;
        self
    }

    /// Set the interval between implicit commits
    pub fn auto_commit_delay(mut self, delay: Duration) -> Self {
        self.config.auto_commit_delay = delay;
        self
    }

    /// Set the page split threshold (in bytes)
    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.config.page_split_size = bytes;
        self
    }

    /// Set the password the file cipher key is derived from
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.config.encryption_key = Some(key.into());
        self
    }

    /// Keep everything in memory
    pub fn in_memory(mut self) -> Self {
        self.config.in_memory = true;
        self
    }

    /// Open without write access
    pub fn read_only(mut self) -> Self {
        self.config.read_only = true;
        self
    }

    /// Set the version retention policy
    pub fn retention(mut self, policy: RetentionPolicy) -> Self {
        self.config.retention = policy;
        self
    }

    /// Set the per-map page cache capacity
    pub fn page_cache_size(mut self, pages: usize) -> Self {
        self.config.page_cache_size = pages;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }

    /// Build the config and open a storage with it
    pub fn open_storage(self) -> Result<Storage> {
        Storage::open(self.build())
    }
}
