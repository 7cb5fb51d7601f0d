//! Storage Module
//!
//! Entry point of the engine: opens named maps over one shared
//! ChunkManager and runs whole-storage maintenance.
//!
//! ## Responsibilities
//! - Validate the config, lock the directory, derive the cipher key
//! - Open B-tree and spatial maps by name (reattaching to the last commit)
//! - Commit dirty maps (on demand, periodically, on close)
//! - Free unused chunks and compact on request
//!
//! ## Directory Layout
//! ```text
//! <storage_name>/
//! ├── aostore.lock     Magic "AOST" | Format | Flags | Salt (16) | Key check (16)
//! ├── c_000001.db      one file per chunk
//! ├── c_000002.db
//! └── ...
//! ```
//!
//! ## Lock Order
//! maintenance → map writer → map state → chunk book → chunk table
//!
//! Readers only take a map's state lock, briefly, to capture a root and the
//! chunk table it lives in.

mod committer;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::btree::{BTreeMap, MapContext, MapInner, MapKey, MapValue, OpenMap};
use crate::chunk::{Chunk, ChunkManager, IoStats};
use crate::config::Config;
use crate::error::{AoError, Result};
use crate::file::{CipherKey, FileOptions, FileStore, CHECK_LEN, SALT_LEN};
use crate::page_pos::MapKind;
use crate::rtree::{RTreeMap, SpatialKey};

use committer::AutoCommitter;

const LOCK_FILE: &str = "aostore.lock";
const LOCK_MAGIC: &[u8; 4] = b"AOST";
const LOCK_FORMAT: u16 = 1;
const FLAG_ENCRYPTED: u16 = 1;

/// Magic (4) + Format (2) + Flags (2) + Salt (16) + Key check (16) = 40 bytes
const LOCK_FILE_SIZE: usize = 8 + SALT_LEN + CHECK_LEN;

/// Whole-storage counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub chunk_count: usize,
    pub page_count: u64,
    pub page_count_live: u64,
    pub max_len: u64,
    pub max_len_live: u64,
    /// Bytes held by chunk files (or chunk buffers in memory)
    pub chunk_bytes: u64,
    pub map_count: usize,
    pub open_map_count: usize,
    pub io: IoStats,
}

impl StorageStats {
    /// Percentage of page bytes still live across all chunks
    pub fn fill_rate(&self) -> u8 {
        if self.max_len == 0 {
            return 100;
        }
        (self.max_len_live * 100 / self.max_len) as u8
    }
}

/// State shared with the auto-commit thread
pub(crate) struct StorageShared {
    config: Config,
    chunks: Arc<ChunkManager>,
    maintenance: Arc<RwLock<()>>,
    maps: RwLock<HashMap<String, Arc<dyn OpenMap>>>,
    closed: AtomicBool,
    lock_file: Option<FileStore>,
}

impl StorageShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn open_maps(&self) -> Vec<Arc<dyn OpenMap>> {
        self.maps.read().values().cloned().collect()
    }

    /// Commit every dirty map; returns how many committed
    pub(crate) fn commit_dirty(&self) -> Result<usize> {
        let mut committed = 0;
        for map in self.open_maps() {
            if map.commit_if_dirty()?.is_some() {
                committed += 1;
            }
        }
        Ok(committed)
    }
}

/// An open storage
///
/// ## Concurrency:
/// - Maps are independent: one writer per map, any number of readers
/// - Commits share the maintenance lock; GC and compaction hold it exclusively
/// - Dropping the storage closes it
pub struct Storage {
    shared: Arc<StorageShared>,
    committer: Option<AutoCommitter>,
}

impl Storage {
    /// Open or create the storage described by `config`
    ///
    /// On startup:
    /// 1. Validate the config
    /// 2. Create the directory and take the lock file
    /// 3. Check (or record) the encryption settings
    /// 4. Recover the chunk bookkeeping
    /// 5. Start the auto-commit thread
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let (chunks, lock_file) = if config.in_memory {
            (ChunkManager::in_memory(config.retention), None)
        } else {
            let dir = config.storage_name.as_path();
            if config.read_only {
                if !dir.is_dir() {
                    return Err(AoError::InvalidPath(dir.to_path_buf()));
                }
            } else {
                fs::create_dir_all(dir)?;
            }

            let (lock, cipher) = Self::open_lock_file(dir, &config)?;
            let file_options = FileOptions {
                read_only: config.read_only,
                require_write: !config.read_only,
                cipher,
            };
            let chunks = ChunkManager::open(dir, file_options, config.retention)?;
            (chunks, Some(lock))
        };

        let shared = Arc::new(StorageShared {
            chunks: Arc::new(chunks),
            maintenance: Arc::new(RwLock::new(())),
            maps: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            lock_file,
            config,
        });

        let committer = if shared.config.auto_commit && !shared.config.read_only && !shared.config.in_memory {
            Some(AutoCommitter::spawn(
                Arc::downgrade(&shared),
                shared.config.auto_commit_delay,
            )?)
        } else {
            None
        };

        info!(
            storage = %shared.config.storage_name.display(),
            in_memory = shared.config.in_memory,
            read_only = shared.config.read_only,
            encrypted = shared.config.encryption_key.is_some(),
            "storage opened"
        );

        Ok(Self { shared, committer })
    }

    // =========================================================================
    // Maps
    // =========================================================================

    /// Open (or create) an ordered map
    pub fn open_btree_map<K: MapKey, V: MapValue>(&self, name: &str) -> Result<BTreeMap<K, V>> {
        self.open_map(name, MapKind::BTree, 0)
    }

    /// Open (or create) a spatial map with `dimensions` per key
    pub fn open_rtree_map<V: MapValue>(&self, name: &str, dimensions: u32) -> Result<RTreeMap<V>> {
        if dimensions == 0 {
            return Err(AoError::Config(format!(
                "spatial map {} needs at least one dimension",
                name
            )));
        }
        let map = self.open_map::<SpatialKey, V>(name, MapKind::RTree, dimensions)?;
        Ok(RTreeMap::new(map, dimensions))
    }

    fn open_map<K: MapKey, V: MapValue>(
        &self,
        name: &str,
        kind: MapKind,
        dimensions: u32,
    ) -> Result<BTreeMap<K, V>> {
        self.check_open()?;
        if name.is_empty() {
            return Err(AoError::Config("map name must not be empty".into()));
        }

        let mut maps = self.shared.maps.write();
        let record = self.shared.chunks.register_map(name, kind, dimensions)?;

        if let Some(existing) = maps.get(name) {
            return Arc::clone(existing)
                .into_any()
                .downcast::<MapInner<K, V>>()
                .map(BTreeMap::from_inner)
                .map_err(|_| {
                    AoError::Config(format!("map {} is open with different key or value types", name))
                });
        }

        let latest = record.latest().copied().ok_or_else(|| {
            AoError::Corrupted(format!("map {} has no retained version", name))
        })?;
        let map = BTreeMap::open(
            self.map_context(),
            record.id,
            name,
            kind,
            latest.version,
            latest.root,
            latest.size,
        );
        maps.insert(name.to_string(), map.handle());

        debug!(map = name, id = record.id, version = latest.version, size = latest.size, "map opened");
        Ok(map)
    }

    /// Names of all registered maps, sorted
    pub fn map_names(&self) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self.shared.chunks.map_names())
    }

    pub fn has_map(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.shared.chunks.map_record_by_name(name).is_some())
    }

    /// Drop a map with all its versions; open handles become closed
    ///
    /// Returns false if no such map exists.
    pub fn remove_map(&self, name: &str) -> Result<bool> {
        self.check_writable()?;
        let _maintenance = self.shared.maintenance.write();

        let Some(record) = self.shared.chunks.map_record_by_name(name) else {
            return Ok(false);
        };
        if let Some(map) = self.shared.maps.write().remove(name) {
            map.mark_closed();
        }
        self.shared.chunks.drop_map(record.id)?;
        Ok(true)
    }

    /// Commit every open map with pending changes; returns how many committed
    pub fn commit_all(&self) -> Result<usize> {
        self.check_open()?;
        self.shared.commit_dirty()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Chunks without live pages
    pub fn find_unused_chunks(&self) -> Result<Vec<Chunk>> {
        self.check_open()?;
        Ok(self.shared.chunks.find_unused_chunks())
    }

    /// Delete every chunk without live pages; returns the freed chunks
    pub fn free_unused_chunks(&self) -> Result<Vec<Chunk>> {
        self.check_writable()?;
        let _maintenance = self.shared.maintenance.write();
        self.shared.chunks.free_unused_chunks()
    }

    /// Rewrite every retained page into one new chunk and drop the rest
    ///
    /// Returns the new chunk, or `None` if the storage had no chunks.
    /// Snapshots opened earlier with `open_version` cannot be read afterwards.
    /// Reads and cursors already under way keep the old chunks until they finish.
    pub fn compact_rewrite_fully(&self) -> Result<Option<Chunk>> {
        self.check_writable()?;
        let _maintenance = self.shared.maintenance.write();

        let compaction = self.shared.chunks.compact_rewrite_fully()?;
        if compaction.chunk.is_none() {
            return Ok(None);
        }

        for map in self.shared.open_maps() {
            map.remap(&compaction.relocated)?;
        }
        self.shared.chunks.release_chunks(compaction.obsolete);
        Ok(compaction.chunk)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Tracked chunks, ordered by id
    pub fn chunks(&self) -> Result<Vec<Chunk>> {
        self.check_open()?;
        Ok(self.shared.chunks.chunks())
    }

    pub fn stats(&self) -> Result<StorageStats> {
        self.check_open()?;
        let chunks = self.shared.chunks.chunks();
        let mut stats = StorageStats {
            chunk_count: chunks.len(),
            map_count: self.shared.chunks.map_names().len(),
            open_map_count: self.shared.maps.read().len(),
            io: self.shared.chunks.io_stats(),
            ..StorageStats::default()
        };
        for chunk in &chunks {
            stats.page_count += u64::from(chunk.page_count);
            stats.page_count_live += u64::from(chunk.page_count_live);
            stats.max_len += chunk.max_len;
            stats.max_len_live += chunk.max_len_live;
            stats.chunk_bytes += chunk.length;
        }
        Ok(stats)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.config.read_only
    }

    pub fn is_in_memory(&self) -> bool {
        self.shared.config.in_memory
    }

    /// Close the storage
    ///
    /// Idempotent. Dirty maps are committed when auto-commit is enabled and
    /// rolled back otherwise. Every map handle becomes closed. All files are
    /// released even if one fails; the first failure is returned.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(committer) = &self.committer {
            committer.stop();
        }

        let config = &self.shared.config;
        let commit_on_close = config.auto_commit && !config.read_only && !config.in_memory;
        let maps: Vec<Arc<dyn OpenMap>> = self.shared.maps.write().drain().map(|(_, m)| m).collect();

        let mut first_err = None;
        for map in &maps {
            if commit_on_close {
                if let Err(e) = map.commit_if_dirty() {
                    warn!(map = map.name(), error = %e, "commit on close failed");
                    first_err.get_or_insert(e);
                }
            } else {
                map.discard();
            }
            map.mark_closed();
        }

        let _maintenance = self.shared.maintenance.write();
        if let Err(e) = self.shared.chunks.close() {
            warn!(error = %e, "closing chunk files failed");
            first_err.get_or_insert(e);
        }
        if let Some(lock) = &self.shared.lock_file {
            if let Err(e) = lock.close() {
                first_err.get_or_insert(e);
            }
        }

        info!(storage = %config.storage_name.display(), maps = maps.len(), "storage closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn map_context(&self) -> MapContext {
        let config = &self.shared.config;
        MapContext {
            chunks: Arc::clone(&self.shared.chunks),
            maintenance: Arc::clone(&self.shared.maintenance),
            page_split_size: config.page_split_size,
            compression: config.compress.then_some(config.compression_level),
            read_only: config.read_only,
            page_cache_size: config.page_cache_size,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(AoError::StoreClosed(
                self.shared.config.storage_name.display().to_string(),
            ));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.shared.config.read_only {
            return Err(AoError::UnsupportedOperation(
                "storage is opened read-only".into(),
            ));
        }
        Ok(())
    }

    /// Lock the directory and settle the encryption key
    fn open_lock_file(dir: &Path, config: &Config) -> Result<(FileStore, Option<CipherKey>)> {
        let path = dir.join(LOCK_FILE);
        if config.read_only && !path.exists() {
            return Err(AoError::Config(format!(
                "no storage found at {}",
                dir.display()
            )));
        }

        let lock = FileStore::open(
            &path,
            &FileOptions {
                read_only: config.read_only,
                require_write: !config.read_only,
                cipher: None,
            },
        )?;

        let key = if lock.size() == 0 {
            Self::init_lock_file(&lock, config)?
        } else {
            Self::check_lock_file(&lock, config)?
        };
        Ok((lock, key))
    }

    fn init_lock_file(lock: &FileStore, config: &Config) -> Result<Option<CipherKey>> {
        let (flags, salt, check, key) = match &config.encryption_key {
            Some(password) => {
                let salt = CipherKey::random_salt();
                let key = CipherKey::derive(password.as_bytes(), &salt)?;
                (FLAG_ENCRYPTED, salt, key.check_value()?, Some(key))
            }
            None => (0, [0u8; SALT_LEN], [0u8; CHECK_LEN], None),
        };

        let mut buf = BytesMut::with_capacity(LOCK_FILE_SIZE);
        buf.put_slice(LOCK_MAGIC);
        buf.put_u16_le(LOCK_FORMAT);
        buf.put_u16_le(flags);
        buf.put_slice(&salt);
        buf.put_slice(&check);
        lock.write_fully(0, &buf)?;
        lock.sync()?;
        Ok(key)
    }

    fn check_lock_file(lock: &FileStore, config: &Config) -> Result<Option<CipherKey>> {
        if lock.size() < LOCK_FILE_SIZE as u64 {
            return Err(AoError::Corrupted(format!(
                "{} is truncated",
                lock.path().display()
            )));
        }
        let bytes = lock.read_fully(0, LOCK_FILE_SIZE)?;
        if &bytes[0..4] != LOCK_MAGIC {
            return Err(AoError::Corrupted(format!(
                "{} is not a storage lock file",
                lock.path().display()
            )));
        }

        let mut buf = &bytes[4..];
        let format = buf.get_u16_le();
        if format != LOCK_FORMAT {
            return Err(AoError::Corrupted(format!("unsupported storage format: {}", format)));
        }
        let flags = buf.get_u16_le();
        let mut salt = [0u8; SALT_LEN];
        buf.copy_to_slice(&mut salt);
        let mut check = [0u8; CHECK_LEN];
        buf.copy_to_slice(&mut check);

        match (flags & FLAG_ENCRYPTED != 0, &config.encryption_key) {
            (false, None) => Ok(None),
            (true, None) => Err(AoError::Config(
                "storage is encrypted, an encryption key is required".into(),
            )),
            (false, Some(_)) => Err(AoError::Config(
                "storage is not encrypted, but an encryption key was given".into(),
            )),
            (true, Some(password)) => {
                let key = CipherKey::derive(password.as_bytes(), &salt)?;
                if key.check_value()? != check {
                    return Err(AoError::Config("wrong encryption key".into()));
                }
                Ok(Some(key))
            }
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error while closing storage on drop");
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("config", &self.shared.config)
            .field("closed", &self.shared.is_closed())
            .field("open_maps", &self.shared.maps.read().len())
            .finish()
    }
}
