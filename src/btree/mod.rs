//! Versioned B-tree Map
//!
//! An ordered map whose committed pages never change. Every mutation copies
//! the pages on the path from the root to the affected leaf; untouched
//! subtrees stay shared with the committed tree.
//!
//! ## Responsibilities
//! - Point lookups, ordered navigation and rank/select
//! - Copy-on-write put / remove with median splits
//! - Commit (one chunk per commit), rollback, read-only snapshots by version
//!
//! ## Version Flow
//! ```text
//!   committed root (v)          working root
//!        │                          │
//!        ▼                          ▼
//!   ┌─────────┐   put / remove  ┌─────────┐
//!   │ Stored  │ ──────────────▶ │ Memory  │ ── commit ──▶ Stored (v + 1)
//!   └─────────┘   (path copy)   └─────────┘
//!        ▲                          │
//!        └──────── rollback ────────┘
//! ```

mod cursor;
mod key_list;
mod page;

pub use cursor::Cursor;
pub use key_list::KeyList;

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::chunk::format::RawChild;
use crate::chunk::format::CHILD_REF_SIZE;
use crate::chunk::{ChunkManager, ChunkReader, ChunkWriter, CommitRequest};
use crate::error::{AoError, Result};
use crate::page_pos::{MapKind, PagePosition};

use page::{child_index, item_size, ChildRef, Page, PageCache, PageRef};

/// Requirements for map keys
pub trait MapKey: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapKey for T where T: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Requirements for map values
pub trait MapValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

// =============================================================================
// Shared Map Plumbing
// =============================================================================

/// Storage-wide handles every map needs
#[derive(Clone)]
pub(crate) struct MapContext {
    pub chunks: Arc<ChunkManager>,
    /// Held shared while committing, exclusively by GC and compaction
    pub maintenance: Arc<RwLock<()>>,
    pub page_split_size: usize,
    pub compression: Option<i32>,
    pub read_only: bool,
    pub page_cache_size: usize,
}

/// Type-erased handle the storage keeps for each open map
pub(crate) trait OpenMap: Send + Sync {
    fn name(&self) -> &str;

    /// Commit pending changes; `None` if there were none
    fn commit_if_dirty(&self) -> Result<Option<u64>>;

    /// Drop uncommitted changes
    fn discard(&self);

    /// Rewrite stored references after compaction moved pages
    fn remap(&self, relocated: &HashMap<PagePosition, PagePosition>) -> Result<()>;

    fn mark_closed(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Working state of a map
struct MapState<K, V> {
    /// Working root, `None` for an empty tree
    root: Option<PageRef<K, V>>,
    size: u64,

    committed_root: Option<PagePosition>,
    committed_size: u64,
    version: u64,

    /// Committed pages the working tree no longer references
    removed: Vec<PagePosition>,
    dirty: bool,
}

pub(crate) struct MapInner<K, V> {
    id: u32,
    name: String,
    kind: MapKind,
    ctx: MapContext,
    /// Serializes mutations, commit and rollback; readers never take it
    writer: Mutex<()>,
    state: RwLock<MapState<K, V>>,
    cache: Arc<PageCache<K, V>>,
    /// Shared with snapshots so closing the map closes its views too
    closed: Arc<AtomicBool>,
    /// Version a read-only view was opened at
    snapshot_of: Option<u64>,
}

/// Consistent read view: a root, its size and the chunks holding its pages
struct Tree<K, V> {
    root: Option<PageRef<K, V>>,
    size: u64,
    chunks: ChunkReader,
}

/// Exclusive access for one mutation
type WriteGuard<'a, K, V> = (MutexGuard<'a, ()>, RwLockWriteGuard<'a, MapState<K, V>>);

// =============================================================================
// BTreeMap
// =============================================================================

/// Handle to a named, versioned map
///
/// Cloning the handle is cheap; all clones see the same map.
pub struct BTreeMap<K, V> {
    inner: Arc<MapInner<K, V>>,
}

impl<K, V> Clone for BTreeMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: MapKey, V: MapValue> BTreeMap<K, V> {
    /// Attach to the latest committed version of a registered map
    pub(crate) fn open(
        ctx: MapContext,
        id: u32,
        name: &str,
        kind: MapKind,
        version: u64,
        root: Option<PagePosition>,
        size: u64,
    ) -> Self {
        let cache = Arc::new(PageCache::new(ctx.page_cache_size));
        let inner = MapInner {
            id,
            name: name.to_string(),
            kind,
            ctx,
            writer: Mutex::new(()),
            state: RwLock::new(MapState {
                root: root.map(PageRef::Stored),
                size,
                committed_root: root,
                committed_size: size,
                version,
                removed: Vec::new(),
                dirty: false,
            }),
            cache,
            closed: Arc::new(AtomicBool::new(false)),
            snapshot_of: None,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Arc<MapInner<K, V>>) -> Self {
        Self { inner }
    }

    pub(crate) fn handle(&self) -> Arc<dyn OpenMap> {
        Arc::clone(&self.inner) as Arc<dyn OpenMap>
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn kind(&self) -> MapKind {
        self.inner.kind
    }

    /// Last committed version (or the version a snapshot was opened at)
    pub fn version(&self) -> u64 {
        self.inner.state.read().version
    }

    pub fn size(&self) -> u64 {
        self.inner.state.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.inner.state.read().dirty
    }

    /// Snapshot views and maps of a read-only storage reject mutations
    pub fn is_read_only(&self) -> bool {
        self.inner.snapshot_of.is_some() || self.inner.ctx.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let tree = self.tree()?;
        self.inner.lookup(&tree.chunks, tree.root.as_ref(), key)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Key at 0-based rank `index`; `None` when out of range
    pub fn get_key(&self, index: i64) -> Result<Option<K>> {
        let tree = self.tree()?;
        self.inner.key_at(&tree, index)
    }

    /// Rank of `key`, or `-(insertion_rank + 1)` if it is absent
    pub fn get_key_index(&self, key: &K) -> Result<i64> {
        let tree = self.tree()?;
        self.inner.rank_of(&tree.chunks, tree.root.as_ref(), key)
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        let tree = self.tree()?;
        self.inner.key_at(&tree, 0)
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        let tree = self.tree()?;
        self.inner.key_at(&tree, tree.size as i64 - 1)
    }

    /// Smallest key `>= key`
    pub fn ceiling_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate(key, |rank| rank, |insert| insert)
    }

    /// Smallest key `> key`
    pub fn higher_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate(key, |rank| rank + 1, |insert| insert)
    }

    /// Largest key `<= key`
    pub fn floor_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate(key, |rank| rank, |insert| insert - 1)
    }

    /// Largest key `< key`
    pub fn lower_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate(key, |rank| rank - 1, |insert| insert - 1)
    }

    /// Ordered iteration over all entries
    pub fn iter(&self) -> Result<Cursor<K, V>> {
        let tree = self.tree()?;
        Cursor::new(Arc::clone(&self.inner), tree.chunks, tree.root, None)
    }

    /// Ordered iteration starting at the first key `>= from`
    pub fn cursor(&self, from: &K) -> Result<Cursor<K, V>> {
        let tree = self.tree()?;
        Cursor::new(Arc::clone(&self.inner), tree.chunks, tree.root, Some(from))
    }

    /// Read-only, rank-indexed view of the keys
    pub fn key_list(&self) -> KeyList<K, V> {
        KeyList::new(self.clone())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or overwrite; returns the previous value
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let (_writer, mut state) = self.write_state()?;
        self.inner.put_locked(&mut state, key, value)
    }

    /// Insert only if absent; returns the existing value otherwise
    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        let (_writer, mut state) = self.write_state()?;
        let chunks = self.inner.ctx.chunks.reader();
        if let Some(existing) = self.inner.lookup(&chunks, state.root.as_ref(), &key)? {
            return Ok(Some(existing));
        }
        self.inner.put_locked(&mut state, key, value)
    }

    /// Overwrite an existing key; never inserts
    pub fn replace(&self, key: K, value: V) -> Result<Option<V>> {
        let (_writer, mut state) = self.write_state()?;
        let chunks = self.inner.ctx.chunks.reader();
        if self.inner.lookup(&chunks, state.root.as_ref(), &key)?.is_none() {
            return Ok(None);
        }
        self.inner.put_locked(&mut state, key, value)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let (_writer, mut state) = self.write_state()?;
        self.inner.remove_locked(&mut state, key)
    }

    /// Remove every key
    pub fn clear(&self) -> Result<()> {
        let (_writer, mut state) = self.write_state()?;
        if state.root.is_none() {
            return Ok(());
        }

        let mut stored = Vec::new();
        if let Some(root) = &state.root {
            self.inner.collect_stored(root, &mut stored)?;
        }
        state.removed.extend(stored);
        state.root = None;
        state.size = 0;
        state.dirty = true;
        Ok(())
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// Persist the working tree as a new version
    ///
    /// Without pending changes the current version is returned and nothing
    /// is written.
    pub fn commit(&self) -> Result<u64> {
        self.check_writable()?;
        self.inner.commit()
    }

    /// Discard uncommitted changes
    pub fn rollback(&self) -> Result<()> {
        self.check_writable()?;
        self.inner.discard();
        Ok(())
    }

    /// Read-only view of the newest retained version `<= version`
    ///
    /// A version older than the retained history resolves to the oldest
    /// retained one.
    pub fn open_version(&self, version: u64) -> Result<BTreeMap<K, V>> {
        self.check_open()?;
        let record = self
            .inner
            .ctx
            .chunks
            .map_record(self.inner.id)
            .ok_or_else(|| AoError::VersionUnavailable {
                map: self.inner.name.clone(),
                version,
                reason: "map is no longer registered".into(),
            })?;
        let target = record
            .at_or_before(version)
            .or_else(|| record.oldest())
            .copied()
            .ok_or_else(|| AoError::VersionUnavailable {
                map: self.inner.name.clone(),
                version,
                reason: "no retained versions".into(),
            })?;

        if let Some(root) = target.root {
            if !self.inner.ctx.chunks.contains_chunk(root.chunk_id()) {
                return Err(AoError::VersionUnavailable {
                    map: self.inner.name.clone(),
                    version: target.version,
                    reason: format!("chunk {} was reclaimed", root.chunk_id()),
                });
            }
        }

        debug!(map = %self.inner.name, requested = version, resolved = target.version, "opened snapshot");

        let inner = MapInner {
            id: self.inner.id,
            name: self.inner.name.clone(),
            kind: self.inner.kind,
            ctx: self.inner.ctx.clone(),
            writer: Mutex::new(()),
            state: RwLock::new(MapState {
                root: target.root.map(PageRef::Stored),
                size: target.size,
                committed_root: target.root,
                committed_size: target.size,
                version: target.version,
                removed: Vec::new(),
                dirty: false,
            }),
            cache: Arc::clone(&self.inner.cache),
            closed: Arc::clone(&self.inner.closed),
            snapshot_of: Some(target.version),
        };
        Ok(BTreeMap {
            inner: Arc::new(inner),
        })
    }

    /// Versions of this map still retained, oldest first
    pub fn retained_versions(&self) -> Vec<u64> {
        self.inner
            .ctx
            .chunks
            .map_record(self.inner.id)
            .map(|r| r.versions.iter().map(|v| v.version).collect())
            .unwrap_or_default()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AoError::StoreClosed(format!("map {} is closed", self.inner.name)));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if let Some(version) = self.inner.snapshot_of {
            return Err(AoError::UnsupportedOperation(format!(
                "snapshot of map {} at version {} is read-only",
                self.inner.name, version
            )));
        }
        if self.inner.ctx.read_only {
            return Err(AoError::UnsupportedOperation(format!(
                "map {} belongs to a read-only storage",
                self.inner.name
            )));
        }
        Ok(())
    }

    fn write_state(&self) -> Result<WriteGuard<'_, K, V>> {
        self.check_writable()?;
        let writer = self.inner.writer.lock();
        Ok((writer, self.inner.state.write()))
    }

    fn tree(&self) -> Result<Tree<K, V>> {
        self.check_open()?;
        // Chunks are captured under the same lock as the root: compaction
        // remaps every map before it releases the old chunks
        let state = self.inner.state.read();
        Ok(Tree {
            root: state.root.clone(),
            size: state.size,
            chunks: self.inner.ctx.chunks.reader(),
        })
    }

    /// Rank-based navigation: `found` maps the rank of a present key,
    /// `absent` the insertion rank of a missing one
    fn navigate(
        &self,
        key: &K,
        found: impl FnOnce(i64) -> i64,
        absent: impl FnOnce(i64) -> i64,
    ) -> Result<Option<K>> {
        let tree = self.tree()?;
        let rank = self.inner.rank_of(&tree.chunks, tree.root.as_ref(), key)?;
        let index = if rank >= 0 {
            found(rank)
        } else {
            absent(-rank - 1)
        };
        self.inner.key_at(&tree, index)
    }
}

impl<K: MapKey, V: MapValue + PartialEq> BTreeMap<K, V> {
    /// Compare-and-set: store `value` only if the current value equals `expected`
    pub fn replace_if(&self, key: K, expected: &V, value: V) -> Result<bool> {
        let (_writer, mut state) = self.write_state()?;
        let chunks = self.inner.ctx.chunks.reader();
        match self.inner.lookup(&chunks, state.root.as_ref(), &key)? {
            Some(current) if current == *expected => {
                self.inner.put_locked(&mut state, key, value)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl<K: MapKey + Debug, V: MapValue> BTreeMap<K, V> {
    /// Human-readable dump of the page tree
    pub fn describe(&self) -> Result<String> {
        let tree = self.tree()?;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "map {} (id {}) version {} size {}",
            self.inner.name,
            self.inner.id,
            self.version(),
            tree.size
        );
        if let Some(root) = &tree.root {
            self.inner.describe_page(&tree.chunks, root, 1, &mut out)?;
        }
        Ok(out)
    }
}

impl<K, V> Debug for BTreeMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("BTreeMap")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("version", &state.version)
            .field("size", &state.size)
            .field("dirty", &state.dirty)
            .field("snapshot", &self.inner.snapshot_of.is_some())
            .finish()
    }
}

// =============================================================================
// Tree Algorithms
// =============================================================================

impl<K: MapKey, V: MapValue> MapInner<K, V> {
    /// Resolve a page reference, reading and caching committed pages
    fn load(&self, chunks: &ChunkReader, page: &PageRef<K, V>) -> Result<Arc<Page<K, V>>> {
        match page {
            PageRef::Memory(page) => Ok(Arc::clone(page)),
            PageRef::Stored(pos) => {
                if let Some(page) = self.cache.get(*pos) {
                    return Ok(page);
                }
                let raw = chunks
                    .read_page(*pos)
                    .map_err(|e| self.missing_page(e))?;
                let page = Arc::new(Page::decode(raw)?);
                self.cache.insert(*pos, Arc::clone(&page));
                Ok(page)
            }
        }
    }

    fn missing_page(&self, err: AoError) -> AoError {
        match (err, self.snapshot_of) {
            (AoError::ChunkNotFound(chunk), Some(version)) => AoError::VersionUnavailable {
                map: self.name.clone(),
                version,
                reason: format!("chunk {} was reclaimed", chunk),
            },
            (err, _) => err,
        }
    }

    fn lookup(
        &self,
        chunks: &ChunkReader,
        root: Option<&PageRef<K, V>>,
        key: &K,
    ) -> Result<Option<V>> {
        let Some(root) = root else {
            return Ok(None);
        };
        let mut page = self.load(chunks, root)?;
        loop {
            let next = match &*page {
                Page::Leaf { keys, values, .. } => {
                    return Ok(keys.binary_search(key).ok().map(|i| values[i].clone()));
                }
                Page::Node { keys, children, .. } => {
                    self.load(chunks, &children[child_index(keys, key)].page)?
                }
            };
            page = next;
        }
    }

    fn rank_of(&self, chunks: &ChunkReader, root: Option<&PageRef<K, V>>, key: &K) -> Result<i64> {
        let Some(root) = root else {
            return Ok(-1);
        };
        let mut offset = 0u64;
        let mut page = self.load(chunks, root)?;
        loop {
            let next = match &*page {
                Page::Leaf { keys, .. } => {
                    return Ok(match keys.binary_search(key) {
                        Ok(i) => (offset + i as u64) as i64,
                        Err(i) => -((offset + i as u64) as i64) - 1,
                    });
                }
                Page::Node { keys, children, .. } => {
                    let idx = child_index(keys, key);
                    offset += children[..idx].iter().map(|c| c.count).sum::<u64>();
                    self.load(chunks, &children[idx].page)?
                }
            };
            page = next;
        }
    }

    fn key_at(&self, tree: &Tree<K, V>, index: i64) -> Result<Option<K>> {
        if index < 0 || index as u64 >= tree.size {
            return Ok(None);
        }
        let Some(root) = &tree.root else {
            return Ok(None);
        };

        let mut remaining = index as u64;
        let mut page = self.load(&tree.chunks, root)?;
        loop {
            let next = match &*page {
                Page::Leaf { keys, .. } => return Ok(keys.get(remaining as usize).cloned()),
                Page::Node { children, .. } => {
                    let mut chosen = None;
                    for child in children {
                        if remaining < child.count {
                            chosen = Some(child);
                            break;
                        }
                        remaining -= child.count;
                    }
                    match chosen {
                        Some(child) => self.load(&tree.chunks, &child.page)?,
                        None => return Ok(None),
                    }
                }
            };
            page = next;
        }
    }

    fn put_locked(&self, state: &mut MapState<K, V>, key: K, value: V) -> Result<Option<V>> {
        let chunks = self.ctx.chunks.reader();
        let mut removed = Vec::new();
        let (page, previous) = match &state.root {
            None => (Page::leaf(vec![key], vec![value])?, None),
            Some(root) => {
                let page = self.load(&chunks, root)?;
                self.insert(&chunks, &page, key, value, &mut removed)?
            }
        };

        let root = if page.needs_split(self.ctx.page_split_size) {
            let (left, separator, right) = page.split()?;
            Page::node(
                vec![separator],
                vec![ChildRef::memory(left), ChildRef::memory(right)],
            )?
        } else {
            page
        };

        if let Some(PageRef::Stored(pos)) = &state.root {
            removed.push(*pos);
        }
        state.root = Some(PageRef::Memory(Arc::new(root)));
        if previous.is_none() {
            state.size += 1;
        }
        state.removed.extend(removed);
        state.dirty = true;
        Ok(previous)
    }

    /// Copy of `page` with the entry set; splits children that outgrew the threshold
    fn insert(
        &self,
        chunks: &ChunkReader,
        page: &Page<K, V>,
        key: K,
        value: V,
        removed: &mut Vec<PagePosition>,
    ) -> Result<(Page<K, V>, Option<V>)> {
        match page {
            Page::Leaf {
                keys,
                values,
                payload,
            } => {
                let mut keys = keys.clone();
                let mut values = values.clone();
                let mut payload = *payload + item_size(&key)? + item_size(&value)?;
                let previous = match keys.binary_search(&key) {
                    Ok(i) => {
                        // The stored key is replaced too: equal keys may differ
                        // in fields outside their ordering
                        payload -= item_size(&keys[i])? + item_size(&values[i])?;
                        keys[i] = key;
                        Some(std::mem::replace(&mut values[i], value))
                    }
                    Err(i) => {
                        keys.insert(i, key);
                        values.insert(i, value);
                        None
                    }
                };
                let page = Page::Leaf {
                    keys,
                    values,
                    payload,
                };
                Ok((page, previous))
            }
            Page::Node {
                keys,
                children,
                payload,
            } => {
                let idx = child_index(keys, &key);
                let child = self.load(chunks, &children[idx].page)?;
                let (child, previous) = self.insert(chunks, &child, key, value, removed)?;

                if let PageRef::Stored(pos) = &children[idx].page {
                    removed.push(*pos);
                }

                let mut keys = keys.clone();
                let mut children = children.clone();
                let mut payload = *payload;
                if child.needs_split(self.ctx.page_split_size) {
                    let (left, separator, right) = child.split()?;
                    payload += item_size(&separator)? + CHILD_REF_SIZE as u64;
                    children[idx] = ChildRef::memory(left);
                    keys.insert(idx, separator);
                    children.insert(idx + 1, ChildRef::memory(right));
                } else {
                    children[idx] = ChildRef::memory(child);
                }
                let page = Page::Node {
                    keys,
                    children,
                    payload,
                };
                Ok((page, previous))
            }
        }
    }

    fn remove_locked(&self, state: &mut MapState<K, V>, key: &K) -> Result<Option<V>> {
        let Some(root) = &state.root else {
            return Ok(None);
        };
        let chunks = self.ctx.chunks.reader();
        let page = self.load(&chunks, root)?;
        let mut removed = Vec::new();
        let Some((page, value)) = self.delete(&chunks, &page, key, &mut removed)? else {
            return Ok(None);
        };

        if let Some(PageRef::Stored(pos)) = &state.root {
            removed.push(*pos);
        }

        // Collapse single-child roots
        let mut root = if page.total_count() == 0 {
            None
        } else {
            Some(PageRef::Memory(Arc::new(page)))
        };
        loop {
            let only_child = match &root {
                Some(PageRef::Memory(page)) => match &**page {
                    Page::Node { children, .. } if children.len() == 1 => children[0].page.clone(),
                    _ => break,
                },
                _ => break,
            };
            root = Some(only_child);
        }

        state.root = root;
        state.size -= 1;
        state.removed.extend(removed);
        state.dirty = true;
        Ok(Some(value))
    }

    /// Copy of `page` without `key`; `None` if the key is absent
    fn delete(
        &self,
        chunks: &ChunkReader,
        page: &Page<K, V>,
        key: &K,
        removed: &mut Vec<PagePosition>,
    ) -> Result<Option<(Page<K, V>, V)>> {
        match page {
            Page::Leaf {
                keys,
                values,
                payload,
            } => {
                let Ok(i) = keys.binary_search(key) else {
                    return Ok(None);
                };
                let mut keys = keys.clone();
                let mut values = values.clone();
                let payload = *payload - item_size(&keys[i])? - item_size(&values[i])?;
                keys.remove(i);
                let value = values.remove(i);
                let page = Page::Leaf {
                    keys,
                    values,
                    payload,
                };
                Ok(Some((page, value)))
            }
            Page::Node {
                keys,
                children,
                payload,
            } => {
                let idx = child_index(keys, key);
                let child = self.load(chunks, &children[idx].page)?;
                let Some((child, value)) = self.delete(chunks, &child, key, removed)? else {
                    return Ok(None);
                };

                if let PageRef::Stored(pos) = &children[idx].page {
                    removed.push(*pos);
                }

                if child.total_count() > 0 {
                    let mut children = children.clone();
                    children[idx] = ChildRef::memory(child);
                    let page = Page::Node {
                        keys: keys.clone(),
                        children,
                        payload: *payload,
                    };
                    return Ok(Some((page, value)));
                }

                // Emptied child: drop it with one adjacent separator
                if children.len() == 1 {
                    return Ok(Some((Page::empty_leaf(), value)));
                }
                let mut keys = keys.clone();
                let mut children = children.clone();
                children.remove(idx);
                let separator = keys.remove(idx.saturating_sub(1));
                let payload = *payload - item_size(&separator)? - CHILD_REF_SIZE as u64;
                let page = Page::Node {
                    keys,
                    children,
                    payload,
                };
                Ok(Some((page, value)))
            }
        }
    }

    /// Every committed page reachable from `page`
    fn collect_stored(&self, page: &PageRef<K, V>, out: &mut Vec<PagePosition>) -> Result<()> {
        match page {
            PageRef::Stored(pos) => self.ctx.chunks.collect_tree(*pos, out),
            PageRef::Memory(page) => {
                if let Page::Node { children, .. } = &**page {
                    for child in children {
                        self.collect_stored(&child.page, out)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Write the working tree as the next version
    ///
    /// Writers wait on the map's writer lock for the whole commit. The state
    /// lock is only taken to read the working tree and, once the chunk is
    /// durable, to swap in the committed root, so readers carry on meanwhile.
    fn commit(&self) -> Result<u64> {
        let _maintenance = self.ctx.maintenance.read();
        if self.closed.load(Ordering::Acquire) {
            return Err(AoError::StoreClosed(format!("map {} is closed", self.name)));
        }
        let _writer = self.writer.lock();

        let (root, size, version, removed) = {
            let state = self.state.read();
            if !state.dirty {
                return Ok(state.version);
            }
            (
                state.root.clone(),
                state.size,
                state.version,
                state.removed.clone(),
            )
        };

        let mut written = Vec::new();
        let (chunk, record) = self.ctx.chunks.commit(|writer| {
            let root = match &root {
                Some(root) => Some(self.write_page(root, writer, &mut written)?),
                None => None,
            };
            Ok(CommitRequest {
                map_id: self.id,
                version: version + 1,
                root,
                size,
                removed,
            })
        })?;

        for (pos, page) in written {
            self.cache.insert(pos, page);
        }

        let mut state = self.state.write();
        state.root = record.root.map(PageRef::Stored);
        state.committed_root = record.root;
        state.committed_size = record.size;
        state.version = record.version;
        state.removed.clear();
        state.dirty = false;
        drop(state);

        debug!(map = %self.name, version = record.version, chunk = chunk.id, "map committed");
        Ok(record.version)
    }

    /// Write the subtree under `page` post-order; committed pages are reused
    fn write_page(
        &self,
        page: &PageRef<K, V>,
        writer: &mut ChunkWriter,
        written: &mut Vec<(PagePosition, Arc<Page<K, V>>)>,
    ) -> Result<PagePosition> {
        let page = match page {
            PageRef::Stored(pos) => return Ok(*pos),
            PageRef::Memory(page) => page,
        };

        let mut children = Vec::new();
        if let Page::Node { children: refs, .. } = &**page {
            for child in refs {
                children.push(RawChild {
                    pos: self.write_page(&child.page, writer, written)?,
                    count: child.count,
                });
            }
        }

        let (bytes, page_type) = page.encode(self.kind, &children, self.ctx.compression)?;
        let pos = writer.write_page(&bytes, page_type)?;

        // Cache the committed form, with children addressed by position
        let stored = match &**page {
            Page::Leaf { .. } => Arc::clone(page),
            Page::Node { keys, payload, .. } => Arc::new(Page::Node {
                keys: keys.clone(),
                children: children
                    .iter()
                    .map(|c| ChildRef {
                        page: PageRef::Stored(c.pos),
                        count: c.count,
                    })
                    .collect(),
                payload: *payload,
            }),
        };
        written.push((pos, stored));
        Ok(pos)
    }

    fn discard(&self) {
        let _writer = self.writer.lock();
        let mut state = self.state.write();
        state.root = state.committed_root.map(PageRef::Stored);
        state.size = state.committed_size;
        state.removed.clear();
        state.dirty = false;
    }

    fn remap_ref(
        &self,
        page: &PageRef<K, V>,
        relocated: &HashMap<PagePosition, PagePosition>,
    ) -> Result<PageRef<K, V>> {
        match page {
            PageRef::Stored(pos) => relocated
                .get(pos)
                .map(|moved| PageRef::Stored(*moved))
                .ok_or_else(|| {
                    AoError::Corrupted(format!("map {} references unrelocated {:?}", self.name, pos))
                }),
            PageRef::Memory(page) => match &**page {
                Page::Leaf { .. } => Ok(PageRef::Memory(Arc::clone(page))),
                Page::Node {
                    keys,
                    children,
                    payload,
                } => {
                    let children = children
                        .iter()
                        .map(|c| {
                            Ok(ChildRef {
                                page: self.remap_ref(&c.page, relocated)?,
                                count: c.count,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Ok(PageRef::Memory(Arc::new(Page::Node {
                        keys: keys.clone(),
                        children,
                        payload: *payload,
                    })))
                }
            },
        }
    }
}

impl<K: MapKey + Debug, V: MapValue> MapInner<K, V> {
    fn describe_page(
        &self,
        chunks: &ChunkReader,
        page: &PageRef<K, V>,
        depth: usize,
        out: &mut String,
    ) -> Result<()> {
        let indent = "  ".repeat(depth);
        let location = match page {
            PageRef::Stored(pos) => format!("{:?}", pos),
            PageRef::Memory(_) => "memory".to_string(),
        };
        let loaded = self.load(chunks, page)?;
        match &*loaded {
            Page::Leaf { keys, .. } => {
                let _ = writeln!(out, "{}leaf {} keys={:?}", indent, location, keys);
            }
            Page::Node { keys, children, .. } => {
                let counts: Vec<u64> = children.iter().map(|c| c.count).collect();
                let _ = writeln!(
                    out,
                    "{}node {} keys={:?} counts={:?}",
                    indent, location, keys, counts
                );
                for child in children {
                    self.describe_page(chunks, &child.page, depth + 1, out)?;
                }
            }
        }
        Ok(())
    }
}

impl<K: MapKey, V: MapValue> OpenMap for MapInner<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn commit_if_dirty(&self) -> Result<Option<u64>> {
        if !self.state.read().dirty {
            return Ok(None);
        }
        self.commit().map(Some)
    }

    fn discard(&self) {
        MapInner::discard(self)
    }

    fn remap(&self, relocated: &HashMap<PagePosition, PagePosition>) -> Result<()> {
        let mut state = self.state.write();
        self.cache.clear();

        if let Some(root) = &state.root {
            state.root = Some(self.remap_ref(root, relocated)?);
        }
        state.committed_root = state
            .committed_root
            .and_then(|pos| relocated.get(&pos).copied());
        state.removed = state
            .removed
            .iter()
            .filter_map(|pos| relocated.get(pos).copied())
            .collect();
        Ok(())
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.cache.clear();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
