//! Ordered iteration over a map
//!
//! A cursor walks one captured root, so later writes to the map are never
//! observed mid-iteration. It also keeps the chunks that root was read from,
//! so compaction cannot pull pages out from under it.

use std::sync::Arc;

use crate::chunk::ChunkReader;
use crate::error::Result;

use super::page::{child_index, Page, PageRef};
use super::{MapInner, MapKey, MapValue};

/// Iterator over `(key, value)` pairs in key order
pub struct Cursor<K, V> {
    map: Arc<MapInner<K, V>>,
    chunks: ChunkReader,
    /// Path from the root: page and the child (node) or entry (leaf) index
    stack: Vec<(Arc<Page<K, V>>, usize)>,
}

impl<K: MapKey, V: MapValue> Cursor<K, V> {
    pub(crate) fn new(
        map: Arc<MapInner<K, V>>,
        chunks: ChunkReader,
        root: Option<PageRef<K, V>>,
        from: Option<&K>,
    ) -> Result<Self> {
        let mut stack = Vec::new();
        if let Some(root) = root {
            let mut page = map.load(&chunks, &root)?;
            loop {
                let next = match &*page {
                    Page::Leaf { keys, .. } => {
                        let idx = match from {
                            Some(key) => keys.binary_search(key).unwrap_or_else(|i| i),
                            None => 0,
                        };
                        stack.push((Arc::clone(&page), idx));
                        break;
                    }
                    Page::Node { keys, children, .. } => {
                        let idx = from.map(|key| child_index(keys, key)).unwrap_or(0);
                        let child = map.load(&chunks, &children[idx].page)?;
                        stack.push((Arc::clone(&page), idx));
                        child
                    }
                };
                page = next;
            }
        }
        Ok(Self { map, chunks, stack })
    }

    /// Move to the next child of the parent frame
    fn advance_parent(&mut self) {
        self.stack.pop();
        if let Some(parent) = self.stack.last_mut() {
            parent.1 += 1;
        }
    }
}

impl<K: MapKey, V: MapValue> Iterator for Cursor<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (page, idx) = {
                let top = self.stack.last()?;
                (Arc::clone(&top.0), top.1)
            };

            match &*page {
                Page::Leaf { keys, values, .. } => {
                    if idx < keys.len() {
                        if let Some(top) = self.stack.last_mut() {
                            top.1 += 1;
                        }
                        return Some(Ok((keys[idx].clone(), values[idx].clone())));
                    }
                    self.advance_parent();
                }
                Page::Node { children, .. } => {
                    if idx >= children.len() {
                        self.advance_parent();
                        continue;
                    }
                    match self.map.load(&self.chunks, &children[idx].page) {
                        Ok(child) => self.stack.push((child, 0)),
                        Err(e) => {
                            self.stack.clear();
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}
