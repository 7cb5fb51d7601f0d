//! B-tree pages
//!
//! A page is either a leaf (sorted keys with their values) or an internal
//! node (separator keys, one more child than keys). Children are referenced
//! either by `PagePosition` once committed or by `Arc` while they only
//! exist in the working tree.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::format::{self, RawChild, RawPage, CHILD_REF_SIZE, PAGE_HEADER_SIZE};
use crate::error::{AoError, Result};
use crate::page_pos::{MapKind, PagePosition, PageType};

use super::{MapKey, MapValue};

/// Reference to a child page
#[derive(Debug)]
pub(crate) enum PageRef<K, V> {
    Stored(PagePosition),
    Memory(Arc<Page<K, V>>),
}

impl<K, V> Clone for PageRef<K, V> {
    fn clone(&self) -> Self {
        match self {
            PageRef::Stored(pos) => PageRef::Stored(*pos),
            PageRef::Memory(page) => PageRef::Memory(Arc::clone(page)),
        }
    }
}

/// Child slot of an internal node with the number of keys below it
#[derive(Debug)]
pub(crate) struct ChildRef<K, V> {
    pub page: PageRef<K, V>,
    pub count: u64,
}

impl<K, V> Clone for ChildRef<K, V> {
    fn clone(&self) -> Self {
        Self {
            page: self.page.clone(),
            count: self.count,
        }
    }
}

impl<K: MapKey, V: MapValue> ChildRef<K, V> {
    /// Wrap a freshly built page
    pub(crate) fn memory(page: Page<K, V>) -> Self {
        let count = page.total_count();
        Self {
            page: PageRef::Memory(Arc::new(page)),
            count,
        }
    }
}

/// A page with the size of its serialized payload
///
/// `payload` is kept up to date by every edit so deciding on a split never
/// re-serializes the page.
#[derive(Debug)]
pub(crate) enum Page<K, V> {
    Leaf {
        keys: Vec<K>,
        values: Vec<V>,
        payload: u64,
    },
    Node {
        keys: Vec<K>,
        children: Vec<ChildRef<K, V>>,
        payload: u64,
    },
}

/// Length prefix bincode writes for each `Vec`
const VEC_LEN_SIZE: u64 = 8;

/// Index of the child that may hold `key`
///
/// Child `i` holds keys `k` with `keys[i-1] <= k < keys[i]`.
pub(crate) fn child_index<K: Ord>(keys: &[K], key: &K) -> usize {
    match keys.binary_search(key) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

/// Serialized size of one key or value
pub(crate) fn item_size<T: serde::Serialize>(item: &T) -> Result<u64> {
    Ok(bincode::serialized_size(item)?)
}

impl<K: MapKey, V: MapValue> Page<K, V> {
    pub(crate) fn empty_leaf() -> Self {
        Page::Leaf {
            keys: Vec::new(),
            values: Vec::new(),
            payload: 2 * VEC_LEN_SIZE,
        }
    }

    /// Leaf over `keys` and `values`, sized from scratch
    pub(crate) fn leaf(keys: Vec<K>, values: Vec<V>) -> Result<Self> {
        let mut payload = 2 * VEC_LEN_SIZE;
        for key in &keys {
            payload += item_size(key)?;
        }
        for value in &values {
            payload += item_size(value)?;
        }
        Ok(Page::Leaf {
            keys,
            values,
            payload,
        })
    }

    /// Internal node over `keys` and `children`, sized from scratch
    pub(crate) fn node(keys: Vec<K>, children: Vec<ChildRef<K, V>>) -> Result<Self> {
        let mut payload = VEC_LEN_SIZE + (children.len() * CHILD_REF_SIZE) as u64;
        for key in &keys {
            payload += item_size(key)?;
        }
        Ok(Page::Node {
            keys,
            children,
            payload,
        })
    }

    pub(crate) fn keys(&self) -> &[K] {
        match self {
            Page::Leaf { keys, .. } | Page::Node { keys, .. } => keys,
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Page::Leaf { .. })
    }

    /// Keys stored in this subtree
    pub(crate) fn total_count(&self) -> u64 {
        match self {
            Page::Leaf { keys, .. } => keys.len() as u64,
            Page::Node { children, .. } => children.iter().map(|c| c.count).sum(),
        }
    }

    /// Serialized record size, before compression
    pub(crate) fn estimated_size(&self) -> u64 {
        let payload = match self {
            Page::Leaf { payload, .. } | Page::Node { payload, .. } => *payload,
        };
        PAGE_HEADER_SIZE as u64 + payload
    }

    /// Whether the page is over `split_size` and has enough keys to split
    pub(crate) fn needs_split(&self, split_size: usize) -> bool {
        let min_keys = if self.is_leaf() { 2 } else { 3 };
        self.keys().len() >= min_keys && self.estimated_size() > split_size as u64
    }

    /// Split at the median key
    ///
    /// Returns the left half, the separator and the right half. A leaf's
    /// separator is the first key of the right half; a node's separator
    /// moves up and belongs to neither half.
    pub(crate) fn split(self) -> Result<(Page<K, V>, K, Page<K, V>)> {
        match self {
            Page::Leaf {
                mut keys,
                mut values,
                ..
            } => {
                let at = keys.len() / 2;
                let right_keys = keys.split_off(at);
                let right_values = values.split_off(at);
                let separator = right_keys[0].clone();
                Ok((
                    Page::leaf(keys, values)?,
                    separator,
                    Page::leaf(right_keys, right_values)?,
                ))
            }
            Page::Node {
                mut keys,
                mut children,
                ..
            } => {
                let at = keys.len() / 2;
                let right_keys = keys.split_off(at + 1);
                let right_children = children.split_off(at + 1);
                // keys[at] moves up
                let separator = keys.remove(at);
                Ok((
                    Page::node(keys, children)?,
                    separator,
                    Page::node(right_keys, right_children)?,
                ))
            }
        }
    }

    /// Encode as a page record; `children` holds the committed child positions
    pub(crate) fn encode(
        &self,
        kind: MapKind,
        children: &[RawChild],
        compression: Option<i32>,
    ) -> Result<(Vec<u8>, PageType)> {
        match self {
            Page::Leaf { keys, values, .. } => {
                let payload = bincode::serialize(&(keys, values))?;
                let page_type = PageType::leaf(kind);
                let bytes = format::encode_page(page_type, keys.len(), &[], &payload, compression)?;
                Ok((bytes, page_type))
            }
            Page::Node { keys, .. } => {
                let payload = bincode::serialize(keys)?;
                let page_type = PageType::node(kind);
                let bytes =
                    format::encode_page(page_type, keys.len(), children, &payload, compression)?;
                Ok((bytes, page_type))
            }
        }
    }

    /// Rebuild a page from a verified record
    pub(crate) fn decode(raw: RawPage) -> Result<Self> {
        if raw.page_type.is_node() {
            let keys: Vec<K> = bincode::deserialize(&raw.payload)?;
            if keys.len() != raw.key_count as usize || keys.len() + 1 != raw.children.len() {
                return Err(AoError::Corrupted(format!(
                    "node with {} keys and {} children (header says {} keys)",
                    keys.len(),
                    raw.children.len(),
                    raw.key_count
                )));
            }
            let payload = (raw.payload.len() + raw.children.len() * CHILD_REF_SIZE) as u64;
            let children = raw
                .children
                .into_iter()
                .map(|c| ChildRef {
                    page: PageRef::Stored(c.pos),
                    count: c.count,
                })
                .collect();
            Ok(Page::Node {
                keys,
                children,
                payload,
            })
        } else {
            let (keys, values): (Vec<K>, Vec<V>) = bincode::deserialize(&raw.payload)?;
            if keys.len() != values.len() || keys.len() != raw.key_count as usize {
                return Err(AoError::Corrupted(format!(
                    "leaf with {} keys and {} values (header says {} keys)",
                    keys.len(),
                    values.len(),
                    raw.key_count
                )));
            }
            Ok(Page::Leaf {
                keys,
                values,
                payload: raw.payload.len() as u64,
            })
        }
    }
}

/// Decoded committed pages, keyed by position
///
/// Dropped wholesale once it reaches capacity.
pub(crate) struct PageCache<K, V> {
    capacity: usize,
    pages: Mutex<HashMap<PagePosition, Arc<Page<K, V>>>>,
}

impl<K, V> PageCache<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pages: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, pos: PagePosition) -> Option<Arc<Page<K, V>>> {
        self.pages.lock().get(&pos).cloned()
    }

    pub(crate) fn insert(&self, pos: PagePosition, page: Arc<Page<K, V>>) {
        let mut pages = self.pages.lock();
        if pages.len() >= self.capacity {
            pages.clear();
        }
        pages.insert(pos, page);
    }

    pub(crate) fn clear(&self) {
        self.pages.lock().clear();
    }
}
