//! Per-shard recency list over the fixed buffer arena.
//!
//! Each shard owns the metadata (tag, validity, refcount, list links) of
//! the buffers currently assigned to it. Links are arena *indices* rather
//! than references: a node's prev/next name other buffer indices in the
//! same shard, with [`NIL`] standing in for the sentinel at both ends.
//! Unlink and splice are O(1) given a buffer index.
//!
//! The shard itself is not a lock; the cache controller wraps each `Shard`
//! in a `parking_lot::Mutex`, which makes every field here guarded by the
//! owning shard's lock by construction.

use blockcache_types::BlockTag;
use std::collections::HashMap;

/// Sentinel link value: "points at the list head".
pub(crate) const NIL: usize = usize::MAX;

/// Metadata for one buffer while it is assigned to a shard.
#[derive(Debug, Clone)]
pub(crate) struct BufMeta {
    /// Cache identity. `None` until the buffer is first assigned a block;
    /// a fully released buffer keeps its stale tag so a re-acquire of the
    /// same key is a hit without a device read.
    pub tag: Option<BlockTag>,
    /// Payload reflects on-device contents.
    pub valid: bool,
    /// In-use references plus pins. Victim-eligible only at zero.
    pub refcount: u32,
    prev: usize,
    next: usize,
}

impl BufMeta {
    pub(crate) fn unassigned() -> Self {
        Self {
            tag: None,
            valid: false,
            refcount: 0,
            prev: NIL,
            next: NIL,
        }
    }
}

/// One independently-lockable partition of the pool: a recency-ordered
/// doubly-linked list of buffer indices, MRU at the front, LRU at the back.
#[derive(Debug)]
pub(crate) struct Shard {
    mru: usize,
    lru: usize,
    nodes: HashMap<usize, BufMeta>,
}

impl Shard {
    pub(crate) fn new() -> Self {
        Self {
            mru: NIL,
            lru: NIL,
            nodes: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, idx: usize) -> &BufMeta {
        self.nodes
            .get(&idx)
            .expect("linked buffer index present in shard node map")
    }

    fn node_mut(&mut self, idx: usize) -> &mut BufMeta {
        self.nodes
            .get_mut(&idx)
            .expect("linked buffer index present in shard node map")
    }

    pub(crate) fn get(&self, idx: usize) -> &BufMeta {
        self.node(idx)
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut BufMeta {
        self.node_mut(idx)
    }

    fn link_front(&mut self, idx: usize) {
        let old_mru = self.mru;
        {
            let meta = self.node_mut(idx);
            meta.prev = NIL;
            meta.next = old_mru;
        }
        if old_mru == NIL {
            self.lru = idx;
        } else {
            self.node_mut(old_mru).prev = idx;
        }
        self.mru = idx;
    }

    fn link_back(&mut self, idx: usize) {
        let old_lru = self.lru;
        {
            let meta = self.node_mut(idx);
            meta.prev = old_lru;
            meta.next = NIL;
        }
        if old_lru == NIL {
            self.mru = idx;
        } else {
            self.node_mut(old_lru).next = idx;
        }
        self.lru = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let meta = self.node(idx);
            (meta.prev, meta.next)
        };
        if prev == NIL {
            self.mru = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.lru = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
    }

    /// Add a buffer at the most-recently-used end.
    pub(crate) fn insert_mru(&mut self, idx: usize, meta: BufMeta) {
        let replaced = self.nodes.insert(idx, meta);
        debug_assert!(replaced.is_none(), "buffer index already in shard");
        self.link_front(idx);
    }

    /// Add a buffer at the least-recently-used end (first in line for
    /// reuse). Used when returning a stolen buffer that lost the
    /// revalidation race.
    pub(crate) fn insert_lru(&mut self, idx: usize, meta: BufMeta) {
        let replaced = self.nodes.insert(idx, meta);
        debug_assert!(replaced.is_none(), "buffer index already in shard");
        self.link_back(idx);
    }

    /// Unlink a buffer and move its metadata out of this shard.
    pub(crate) fn remove(&mut self, idx: usize) -> BufMeta {
        self.unlink(idx);
        self.nodes
            .remove(&idx)
            .expect("linked buffer index present in shard node map")
    }

    /// Splice a buffer to the most-recently-used position.
    pub(crate) fn touch_mru(&mut self, idx: usize) {
        if self.mru == idx {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    /// Scan for a resident buffer carrying `tag`, MRU end first.
    pub(crate) fn find(&self, tag: BlockTag) -> Option<usize> {
        let mut idx = self.mru;
        while idx != NIL {
            let meta = self.node(idx);
            if meta.tag == Some(tag) {
                return Some(idx);
            }
            idx = meta.next;
        }
        None
    }

    /// Scan for a reusable buffer (`refcount == 0`), LRU end first.
    pub(crate) fn victim(&self) -> Option<usize> {
        let mut idx = self.lru;
        while idx != NIL {
            let meta = self.node(idx);
            if meta.refcount == 0 {
                return Some(idx);
            }
            idx = meta.prev;
        }
        None
    }

    /// Number of buffers in this shard carrying `tag` with a positive
    /// refcount. Diagnostics; the cache-wide invariant keeps this at most
    /// one.
    pub(crate) fn holders(&self, tag: BlockTag) -> usize {
        self.nodes
            .values()
            .filter(|meta| meta.tag == Some(tag) && meta.refcount > 0)
            .count()
    }

    /// Buffer indices from MRU to LRU.
    #[cfg(test)]
    pub(crate) fn order(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut idx = self.mru;
        while idx != NIL {
            out.push(idx);
            idx = self.node(idx).next;
        }
        out
    }
}
