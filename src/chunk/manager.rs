//! Chunk Manager
//!
//! Tracks every chunk written for a storage and the version registry that
//! decides which pages are still live.
//!
//! ## Responsibilities
//! - Allocate chunk ids (monotonic, never reused) and seal new chunks
//! - Per-chunk live page accounting, driven by the retention policy
//! - Find and free unused chunks (fast path GC)
//! - Rewrite all live pages into one chunk (compaction)
//! - Rebuild the bookkeeping from the newest valid chunk on open

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::RetentionPolicy;
use crate::error::{AoError, Result};
use crate::file::{FileOptions, FileStore};
use crate::page_pos::{MapKind, PagePosition, PageType, MAX_CHUNK_ID};

use super::format::{self, ChunkHeader, RawPage, CHUNK_HEADER_SIZE};
use super::meta::{Chunk, ChunkFooter, MapRecord, PendingDeath, VersionRecord};

/// Aggregated FileStore counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub read_count: u64,
    pub read_bytes: u64,
    pub write_count: u64,
    pub write_bytes: u64,
}

/// Where a sealed chunk's bytes live
enum Backing {
    File(FileStore),
    Memory(Vec<u8>),
}

/// A sealed, readable chunk
struct ChunkData {
    id: u32,
    page_area_len: u64,
    backing: Backing,
    /// Set once the chunk left the readable set; the file goes with the last reader
    retired: AtomicBool,
}

impl Drop for ChunkData {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::Acquire) {
            return;
        }
        if let Backing::File(store) = &self.backing {
            match store.delete() {
                Ok(()) => debug!(chunk = self.id, "deleted retired chunk file"),
                Err(e) => warn!(chunk = self.id, error = %e, "could not delete chunk file"),
            }
        }
    }
}

type ChunkTable = HashMap<u32, Arc<ChunkData>>;

/// The chunks readable at one moment
///
/// Held by in-flight reads, so chunks released meanwhile stay readable
/// until the last such read is done.
#[derive(Clone)]
pub(crate) struct ChunkReader {
    table: Arc<ChunkTable>,
}

impl ChunkReader {
    /// Read and verify the page record at `pos`
    pub(crate) fn read_page(&self, pos: PagePosition) -> Result<RawPage> {
        let bytes = self.read_page_bytes(pos)?;
        format::decode_page(&bytes)
    }

    fn read_page_bytes(&self, pos: PagePosition) -> Result<Vec<u8>> {
        self.table
            .get(&pos.chunk_id())
            .ok_or(AoError::ChunkNotFound(pos.chunk_id()))?
            .read_page_bytes(pos)
    }
}

impl ChunkData {
    /// Read the page record at `pos` (one record, checksum not yet verified)
    fn read_page_bytes(&self, pos: PagePosition) -> Result<Vec<u8>> {
        let offset = pos.offset();
        if offset >= self.page_area_len {
            return Err(AoError::Corrupted(format!(
                "{:?} points past the page area of chunk {} ({} bytes)",
                pos, self.id, self.page_area_len
            )));
        }

        let len = u64::from(pos.max_length()).min(self.page_area_len - offset) as usize;
        let start = CHUNK_HEADER_SIZE + offset;
        let mut bytes = match &self.backing {
            Backing::File(store) => store.read_fully(start, len)?,
            Backing::Memory(buf) => buf[start as usize..start as usize + len].to_vec(),
        };

        let actual = format::page_len(&bytes)?;
        bytes.truncate(actual);
        Ok(bytes)
    }
}

/// Pages being appended to a chunk that is not sealed yet
pub struct ChunkWriter {
    chunk: Chunk,
    pages: BytesMut,
}

impl ChunkWriter {
    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            pages: BytesMut::new(),
        }
    }

    pub fn chunk_id(&self) -> u32 {
        self.chunk.id
    }

    pub fn page_count(&self) -> u32 {
        self.chunk.page_count
    }

    /// Append one encoded page record and return its address
    pub fn write_page(&mut self, page: &[u8], page_type: PageType) -> Result<PagePosition> {
        let offset = self.pages.len() as u64;
        let pos = PagePosition::encode(self.chunk.id, offset, page.len() as u64, page_type)?;
        self.pages.put_slice(page);
        self.chunk.record_page_write(pos.max_length());
        Ok(pos)
    }
}

/// What a map publishes when it commits
#[derive(Debug)]
pub(crate) struct CommitRequest {
    pub map_id: u32,
    pub version: u64,
    pub root: Option<PagePosition>,
    pub size: u64,
    /// Committed pages the new version no longer references
    pub removed: Vec<PagePosition>,
}

/// Result of a full rewrite
#[derive(Debug, Default)]
pub(crate) struct Compaction {
    pub relocated: HashMap<PagePosition, PagePosition>,
    /// Chunks superseded by the rewrite, still readable until released
    pub obsolete: Vec<u32>,
    pub chunk: Option<Chunk>,
}

/// Bookkeeping guarded by the manager's mutex
#[derive(Debug, Clone)]
struct ChunkBook {
    next_chunk_id: u32,
    /// Newest sealed chunk; its footer is the authoritative state
    last_chunk_id: u32,
    next_map_id: u32,
    chunks: BTreeMap<u32, Chunk>,
    maps: BTreeMap<u32, MapRecord>,
    pending: Vec<PendingDeath>,
}

impl ChunkBook {
    fn empty() -> Self {
        Self {
            next_chunk_id: 1,
            last_chunk_id: 0,
            next_map_id: 1,
            chunks: BTreeMap::new(),
            maps: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    fn allocate_chunk(&mut self) -> Result<Chunk> {
        let id = self.next_chunk_id;
        if id > MAX_CHUNK_ID {
            return Err(AoError::InvalidAddress(format!(
                "chunk ids exhausted (max {})",
                MAX_CHUNK_ID
            )));
        }
        self.next_chunk_id += 1;
        Ok(Chunk::new(id))
    }

    fn record_page_death(&mut self, pos: PagePosition) -> Result<()> {
        match self.chunks.get_mut(&pos.chunk_id()) {
            Some(chunk) => {
                if !chunk.record_page_death(pos.max_length()) {
                    return Err(AoError::Corrupted(format!(
                        "chunk {} has no live page left for {:?}",
                        chunk.id, pos
                    )));
                }
                Ok(())
            }
            None => {
                warn!(chunk = pos.chunk_id(), "page death for a chunk that is gone");
                Ok(())
            }
        }
    }

    /// Publish a new version and let the retention window advance
    fn apply_commit(
        &mut self,
        request: &CommitRequest,
        retention: RetentionPolicy,
        now: u64,
    ) -> Result<VersionRecord> {
        let map = self.maps.get_mut(&request.map_id).ok_or_else(|| {
            AoError::Corrupted(format!("commit for unknown map id {}", request.map_id))
        })?;
        if let Some(latest) = map.latest() {
            if request.version <= latest.version {
                return Err(AoError::Corrupted(format!(
                    "map {} committed version {} after {}",
                    map.name, request.version, latest.version
                )));
            }
        }

        let record = VersionRecord {
            version: request.version,
            root: request.root,
            size: request.size,
            committed_at: now,
        };
        map.versions.push(record);

        self.pending.extend(request.removed.iter().map(|&pos| PendingDeath {
            map_id: request.map_id,
            version: request.version,
            pos,
        }));

        self.apply_retention(request.map_id, retention, now)?;
        Ok(record)
    }

    /// Drop versions outside the window; pages only they needed die
    fn apply_retention(&mut self, map_id: u32, retention: RetentionPolicy, now: u64) -> Result<()> {
        let Some(map) = self.maps.get_mut(&map_id) else {
            return Ok(());
        };
        if map.versions.is_empty() {
            return Ok(());
        }

        let latest = map.versions.len() - 1;
        let keep_from = match retention {
            RetentionPolicy::Versions(n) => map.versions.len().saturating_sub(n),
            RetentionPolicy::Duration(window) => {
                let cutoff = now.saturating_sub(window.as_millis() as u64);
                map.versions
                    .iter()
                    .position(|v| v.committed_at >= cutoff)
                    .unwrap_or(latest)
                    .min(latest)
            }
        };
        map.versions.drain(..keep_from);
        let oldest = map.versions[0].version;

        let (dead, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.map_id == map_id && p.version <= oldest);
        self.pending = pending;

        for death in dead {
            self.record_page_death(death.pos)?;
        }
        Ok(())
    }

    fn footer(&self) -> ChunkFooter {
        ChunkFooter {
            chunk_id: self.last_chunk_id,
            next_map_id: self.next_map_id,
            chunks: self.chunks.values().cloned().collect(),
            maps: self.maps.values().cloned().collect(),
            pending: self.pending.clone(),
        }
    }

    fn unused_chunks(&self) -> Vec<Chunk> {
        self.chunks
            .values()
            .filter(|c| c.is_unused() && c.id != self.last_chunk_id)
            .cloned()
            .collect()
    }
}

/// Manages the chunks of one storage
///
/// ## Concurrency:
/// - `book`: one Mutex serializes commits, GC and compaction bookkeeping
/// - `data`: copy-on-write table of sealed chunks; reads take a snapshot and
///   never wait on a commit
/// - Lock order: book → data
pub struct ChunkManager {
    /// Directory holding the chunk files, `None` when kept in memory
    dir: Option<PathBuf>,
    file_options: FileOptions,
    retention: RetentionPolicy,
    book: Mutex<ChunkBook>,
    data: RwLock<Arc<ChunkTable>>,
}

impl ChunkManager {
    /// A manager that keeps every chunk resident
    pub fn in_memory(retention: RetentionPolicy) -> Self {
        Self {
            dir: None,
            file_options: FileOptions::default(),
            retention,
            book: Mutex::new(ChunkBook::empty()),
            data: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Open the chunk files in `dir` and rebuild the bookkeeping
    ///
    /// On startup:
    /// 1. Discover `c_<id>.db` files and lock them
    /// 2. Take the state from the newest chunk whose header and footer check out
    /// 3. Remove chunk files that state does not know (torn or abandoned writes)
    /// 4. Drop chunks the state lists but whose files are gone
    pub fn open(dir: &Path, file_options: FileOptions, retention: RetentionPolicy) -> Result<Self> {
        let mut ids: Vec<u32> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(id) = Self::parse_chunk_id(&path) {
                    ids.push(id);
                }
            }
        }

        // Newest first
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut stores: BTreeMap<u32, (FileStore, Option<ChunkHeader>)> = BTreeMap::new();
        for &id in &ids {
            let path = Self::chunk_path_with_dir(dir, id);
            match FileStore::open(&path, &file_options) {
                Ok(store) => {
                    stores.insert(id, (store, None));
                }
                Err(AoError::Corrupted(reason)) => {
                    warn!(chunk = id, reason = %reason, "chunk file has no usable header");
                    if !file_options.read_only {
                        fs::remove_file(&path)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let mut book = ChunkBook::empty();
        book.next_chunk_id = ids.first().map(|&id| id + 1).unwrap_or(1);

        let mut state: Option<ChunkFooter> = None;
        for &id in &ids {
            let Some((store, header)) = stores.get_mut(&id) else {
                continue;
            };
            match Self::read_sealed(store, id) {
                Ok((h, footer)) => {
                    *header = Some(h);
                    state = Some(footer);
                    break;
                }
                Err(e) if is_torn(&e) => warn!(chunk = id, error = %e, "skipping torn chunk"),
                Err(e) => return Err(e),
            }
        }

        if let Some(footer) = state {
            book.last_chunk_id = footer.chunk_id;
            book.next_map_id = footer.next_map_id;
            book.maps = footer.maps.into_iter().map(|m| (m.id, m)).collect();
            book.pending = footer.pending;

            for chunk in footer.chunks {
                if stores.contains_key(&chunk.id) {
                    book.chunks.insert(chunk.id, chunk);
                } else if chunk.is_unused() {
                    debug!(chunk = chunk.id, "freed chunk no longer on disk");
                } else {
                    warn!(
                        chunk = chunk.id,
                        live = chunk.page_count_live,
                        "chunk with live pages is missing"
                    );
                }
            }
        } else if !ids.is_empty() {
            warn!(files = ids.len(), "no valid chunk found, starting empty");
        }

        let mut data = HashMap::new();
        for (id, (store, header)) in stores {
            if !book.chunks.contains_key(&id) {
                Self::discard_store(store, file_options.read_only);
                continue;
            }

            let header = match header {
                Some(h) => h,
                None => match Self::read_header(&store, id) {
                    Ok(h) => h,
                    Err(e) if is_torn(&e) => {
                        warn!(chunk = id, error = %e, "dropping chunk with a bad header");
                        book.chunks.remove(&id);
                        Self::discard_store(store, file_options.read_only);
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            data.insert(
                id,
                Arc::new(ChunkData {
                    id,
                    page_area_len: header.page_area_len,
                    backing: Backing::File(store),
                    retired: AtomicBool::new(false),
                }),
            );
        }

        info!(
            dir = %dir.display(),
            chunks = book.chunks.len(),
            maps = book.maps.len(),
            next_chunk_id = book.next_chunk_id,
            "chunk manager opened"
        );

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            file_options,
            retention,
            book: Mutex::new(book),
            data: RwLock::new(Arc::new(data)),
        })
    }

    // =========================================================================
    // Map Registry
    // =========================================================================

    /// Find or create the registry entry for `name`
    ///
    /// A new map starts at version 0 with no root; it is persisted with the
    /// next sealed chunk.
    pub(crate) fn register_map(&self, name: &str, kind: MapKind, dimensions: u32) -> Result<MapRecord> {
        let mut book = self.book.lock();

        if let Some(existing) = book.maps.values().find(|m| m.name == name) {
            if existing.kind != kind || existing.dimensions != dimensions {
                return Err(AoError::Config(format!(
                    "map {} exists as {:?} with {} dimensions",
                    name, existing.kind, existing.dimensions
                )));
            }
            return Ok(existing.clone());
        }

        let id = book.next_map_id;
        book.next_map_id += 1;
        let record = MapRecord {
            id,
            name: name.to_string(),
            kind,
            dimensions,
            versions: vec![VersionRecord::empty(now_millis())],
        };
        book.maps.insert(id, record.clone());
        debug!(map = name, id, "registered map");
        Ok(record)
    }

    pub fn map_record(&self, map_id: u32) -> Option<MapRecord> {
        self.book.lock().maps.get(&map_id).cloned()
    }

    pub fn map_record_by_name(&self, name: &str) -> Option<MapRecord> {
        self.book.lock().maps.values().find(|m| m.name == name).cloned()
    }

    pub fn map_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.book.lock().maps.values().map(|m| m.name.clone()).collect();
        names.sort();
        names
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Snapshot of the readable chunks
    pub(crate) fn reader(&self) -> ChunkReader {
        ChunkReader {
            table: Arc::clone(&self.data.read()),
        }
    }

    /// Read and verify the page record at `pos`
    pub(crate) fn read_page(&self, pos: PagePosition) -> Result<RawPage> {
        self.reader().read_page(pos)
    }

    fn read_page_bytes(&self, pos: PagePosition) -> Result<Vec<u8>> {
        self.reader().read_page_bytes(pos)
    }

    /// Whether chunk `id` is still readable
    pub fn contains_chunk(&self, id: u32) -> bool {
        self.data.read().contains_key(&id)
    }

    /// Every page position reachable from `root`, root included
    pub(crate) fn collect_tree(&self, root: PagePosition, out: &mut Vec<PagePosition>) -> Result<()> {
        out.push(root);
        if root.page_type().is_node() {
            let page = self.read_page(root)?;
            for child in page.children {
                self.collect_tree(child.pos, out)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Seal one new chunk holding the pages `build` writes
    ///
    /// Steps:
    /// 1. Allocate the chunk id (burned even if anything below fails)
    /// 2. Let the caller append its pages and describe the new version
    /// 3. Apply the version and retention to a copy of the bookkeeping
    /// 4. Write header + pages + footer durably
    /// 5. Swap in the new bookkeeping
    pub(crate) fn commit<F>(&self, build: F) -> Result<(Chunk, VersionRecord)>
    where
        F: FnOnce(&mut ChunkWriter) -> Result<CommitRequest>,
    {
        self.check_writable()?;
        let mut book = self.book.lock();

        let chunk = book.allocate_chunk()?;
        let mut writer = ChunkWriter::new(chunk);
        let request = build(&mut writer)?;

        let mut next = book.clone();
        let record = next.apply_commit(&request, self.retention, now_millis())?;
        let chunk = self.seal(&mut next, writer)?;
        *book = next;

        debug!(
            chunk = chunk.id,
            pages = chunk.page_count,
            map_id = request.map_id,
            version = record.version,
            removed = request.removed.len(),
            "chunk sealed"
        );
        Ok((chunk, record))
    }

    /// Write a chunk and register it in `next`
    fn seal(&self, next: &mut ChunkBook, writer: ChunkWriter) -> Result<Chunk> {
        let ChunkWriter { mut chunk, pages } = writer;
        let id = chunk.id;
        let page_area_len = pages.len() as u64;

        chunk.created_at = now_millis();
        next.last_chunk_id = id;
        next.chunks.insert(id, chunk.clone());

        // The footer describes this chunk's own length; bincode's fixed-width
        // integers keep the size identical between both passes.
        let sizing = bincode::serialize(&next.footer())?;
        chunk.length = CHUNK_HEADER_SIZE + page_area_len + sizing.len() as u64;
        next.chunks.insert(id, chunk.clone());
        let footer = bincode::serialize(&next.footer())?;

        let header = ChunkHeader {
            id,
            page_count: chunk.page_count,
            page_area_len,
            footer_len: footer.len() as u32,
            footer_crc: crc32fast::hash(&footer),
        };
        let mut buf = BytesMut::with_capacity(chunk.length as usize);
        header.encode(&mut buf);
        buf.put_slice(&pages);
        buf.put_slice(&footer);

        let backing = match &self.dir {
            Some(dir) => {
                let store = FileStore::open(self.chunk_path(dir, id), &self.file_options)?;
                if let Err(e) = store.write_fully(0, &buf).and_then(|_| store.sync()) {
                    if let Err(cleanup) = store.delete() {
                        warn!(chunk = id, error = %cleanup, "could not remove partial chunk");
                    }
                    return Err(e);
                }
                Backing::File(store)
            }
            None => Backing::Memory(buf.to_vec()),
        };

        let chunk_data = Arc::new(ChunkData {
            id,
            page_area_len,
            backing,
            retired: AtomicBool::new(false),
        });
        Arc::make_mut(&mut *self.data.write()).insert(id, chunk_data);
        Ok(chunk)
    }

    /// Forget a map; every page only its versions referenced dies
    pub(crate) fn drop_map(&self, map_id: u32) -> Result<()> {
        self.check_writable()?;
        let mut book = self.book.lock();
        let mut next = book.clone();

        let Some(map) = next.maps.remove(&map_id) else {
            return Ok(());
        };

        let mut reachable = Vec::new();
        for version in &map.versions {
            if let Some(root) = version.root {
                self.collect_tree(root, &mut reachable)?;
            }
        }
        let unique: HashSet<PagePosition> = reachable.into_iter().collect();
        for pos in unique {
            next.record_page_death(pos)?;
        }
        next.pending.retain(|p| p.map_id != map_id);

        let chunk = next.allocate_chunk()?;
        book.next_chunk_id = next.next_chunk_id;
        self.seal(&mut next, ChunkWriter::new(chunk))?;
        *book = next;

        info!(map = %map.name, "map removed");
        Ok(())
    }

    // =========================================================================
    // Garbage Collection
    // =========================================================================

    /// Chunks without live pages (the newest chunk is never included)
    pub fn find_unused_chunks(&self) -> Vec<Chunk> {
        self.book.lock().unused_chunks()
    }

    /// Delete every unused chunk; returns what was freed
    pub(crate) fn free_unused_chunks(&self) -> Result<Vec<Chunk>> {
        self.check_writable()?;
        let mut book = self.book.lock();
        let unused = book.unused_chunks();
        if unused.is_empty() {
            return Ok(unused);
        }

        for chunk in &unused {
            book.chunks.remove(&chunk.id);
        }
        self.release_chunks(unused.iter().map(|c| c.id));

        info!(
            count = unused.len(),
            ids = ?unused.iter().map(|c| c.id).collect::<Vec<_>>(),
            "freed unused chunks"
        );
        Ok(unused)
    }

    /// Copy every page reachable from a retained version into one new chunk
    ///
    /// The old chunks leave the bookkeeping but stay readable until
    /// `release_chunks` is called with `Compaction::obsolete`, so open maps
    /// can be remapped first.
    pub(crate) fn compact_rewrite_fully(&self) -> Result<Compaction> {
        self.check_writable()?;
        let mut book = self.book.lock();
        if book.chunks.is_empty() {
            return Ok(Compaction::default());
        }

        let obsolete: Vec<u32> = book.chunks.keys().copied().collect();
        let chunk = book.allocate_chunk()?;
        let mut writer = ChunkWriter::new(chunk);
        let mut relocated = HashMap::new();
        let mut next = book.clone();

        for map in next.maps.values_mut() {
            for version in map.versions.iter_mut() {
                let Some(root) = version.root else {
                    continue;
                };
                let moved = self
                    .relocate(root, &mut writer, &mut relocated)
                    .map_err(|e| match e {
                        AoError::ChunkNotFound(_) => AoError::CompactionRetentionViolation {
                            map: map.name.clone(),
                            version: version.version,
                        },
                        other => other,
                    })?;
                version.root = Some(moved);
            }
        }

        next.pending = next
            .pending
            .iter()
            .filter_map(|p| {
                relocated.get(&p.pos).map(|&pos| PendingDeath { pos, ..*p })
            })
            .collect();
        next.chunks.clear();

        let chunk = self.seal(&mut next, writer)?;
        *book = next;

        info!(
            chunk = chunk.id,
            pages = chunk.page_count,
            replaced = obsolete.len(),
            "compaction rewrote live pages"
        );
        Ok(Compaction {
            relocated,
            obsolete,
            chunk: Some(chunk),
        })
    }

    /// Copy the subtree at `pos` (children first) into `writer`
    fn relocate(
        &self,
        pos: PagePosition,
        writer: &mut ChunkWriter,
        relocated: &mut HashMap<PagePosition, PagePosition>,
    ) -> Result<PagePosition> {
        if let Some(&moved) = relocated.get(&pos) {
            return Ok(moved);
        }

        let bytes = self.read_page_bytes(pos)?;
        let page = format::decode_page(&bytes)?;

        let bytes = if page.children.is_empty() {
            bytes
        } else {
            for child in &page.children {
                self.relocate(child.pos, writer, relocated)?;
            }
            format::relocate_children(&bytes, |old| {
                relocated.get(&old).copied().ok_or_else(|| {
                    AoError::Corrupted(format!("child {:?} was not relocated", old))
                })
            })?
        };

        let moved = writer.write_page(&bytes, pos.page_type())?;
        relocated.insert(pos, moved);
        Ok(moved)
    }

    /// Drop chunks from the readable set
    ///
    /// A file is deleted as soon as no in-flight read still holds its chunk.
    pub(crate) fn release_chunks(&self, ids: impl IntoIterator<Item = u32>) {
        let released: Vec<Arc<ChunkData>> = {
            let mut data = self.data.write();
            let table = Arc::make_mut(&mut *data);
            ids.into_iter().filter_map(|id| table.remove(&id)).collect()
        };

        for chunk in released {
            chunk.retired.store(true, Ordering::Release);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Snapshot of all tracked chunks, ordered by id
    pub fn chunks(&self) -> Vec<Chunk> {
        self.book.lock().chunks.values().cloned().collect()
    }

    pub fn chunk(&self, id: u32) -> Option<Chunk> {
        self.book.lock().chunks.get(&id).cloned()
    }

    /// Next id `allocate_chunk` will hand out
    pub fn next_chunk_id(&self) -> u32 {
        self.book.lock().next_chunk_id
    }

    pub fn is_in_memory(&self) -> bool {
        self.dir.is_none()
    }

    pub fn io_stats(&self) -> IoStats {
        let mut stats = IoStats::default();
        for chunk in self.data.read().values() {
            if let Backing::File(store) = &chunk.backing {
                stats.read_count += store.read_count();
                stats.read_bytes += store.read_bytes();
                stats.write_count += store.write_count();
                stats.write_bytes += store.write_bytes();
            }
        }
        stats
    }

    /// Close every chunk file; the first failure is reported after all closed
    pub fn close(&self) -> Result<()> {
        let table = std::mem::take(&mut *self.data.write());
        let mut first_err = None;
        for chunk in table.values() {
            if let Backing::File(store) = &chunk.backing {
                if let Err(e) = store.close() {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_writable(&self) -> Result<()> {
        if self.file_options.read_only {
            return Err(AoError::UnsupportedOperation(
                "storage is opened read-only".into(),
            ));
        }
        Ok(())
    }

    fn chunk_path(&self, dir: &Path, id: u32) -> PathBuf {
        Self::chunk_path_with_dir(dir, id)
    }

    /// Generate chunk path given a directory and ID
    fn chunk_path_with_dir(dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("c_{:06}.db", id))
    }

    /// Parse chunk ID from filename
    /// "c_000042.db" → Some(42)
    fn parse_chunk_id(path: &Path) -> Option<u32> {
        if path.extension()? != "db" {
            return None;
        }
        let name = path.file_stem()?.to_string_lossy();
        let id_str = name.strip_prefix("c_")?;
        id_str.parse().ok()
    }

    fn read_header(store: &FileStore, id: u32) -> Result<ChunkHeader> {
        if store.size() < CHUNK_HEADER_SIZE {
            return Err(AoError::Corrupted(format!("chunk {} is truncated", id)));
        }
        let header = ChunkHeader::decode(&store.read_fully(0, CHUNK_HEADER_SIZE as usize)?)?;
        if header.id != id {
            return Err(AoError::Corrupted(format!(
                "file for chunk {} holds chunk {}",
                id, header.id
            )));
        }
        Ok(header)
    }

    /// Header plus verified footer of a sealed chunk
    fn read_sealed(store: &FileStore, id: u32) -> Result<(ChunkHeader, ChunkFooter)> {
        let header = Self::read_header(store, id)?;
        let footer_at = CHUNK_HEADER_SIZE + header.page_area_len;
        if footer_at + u64::from(header.footer_len) > store.size() {
            return Err(AoError::Corrupted(format!("chunk {} footer is truncated", id)));
        }

        let bytes = store.read_fully(footer_at, header.footer_len as usize)?;
        if crc32fast::hash(&bytes) != header.footer_crc {
            return Err(AoError::Corrupted(format!("chunk {} footer checksum mismatch", id)));
        }
        let footer: ChunkFooter = bincode::deserialize(&bytes)?;
        if footer.chunk_id != id {
            return Err(AoError::Corrupted(format!(
                "chunk {} footer claims id {}",
                id, footer.chunk_id
            )));
        }
        Ok((header, footer))
    }

    fn discard_store(store: FileStore, read_only: bool) {
        if read_only {
            let _ = store.close();
            return;
        }
        warn!(path = %store.path().display(), "removing chunk file not referenced by state");
        if let Err(e) = store.delete() {
            warn!(path = %store.path().display(), error = %e, "could not remove chunk file");
        }
    }
}

impl std::fmt::Debug for ChunkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let book = self.book.lock();
        f.debug_struct("ChunkManager")
            .field("dir", &self.dir)
            .field("chunks", &book.chunks.len())
            .field("maps", &book.maps.len())
            .field("next_chunk_id", &book.next_chunk_id)
            .finish()
    }
}

/// Whether a recovery error means the chunk itself is damaged
///
/// Anything else (a failed read, a closed handle) is passed up instead of
/// letting recovery throw the chunk away.
fn is_torn(err: &AoError) -> bool {
    matches!(err, AoError::Corrupted(_) | AoError::Serialization(_))
}

/// Unix time in milliseconds
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
