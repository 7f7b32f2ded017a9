//! # Cursors
//!
//! A cursor walks one bucket's tree with a stack of (page-or-node, index)
//! frames. Frames address pages by id and nodes by arena id, never by
//! borrow, so a cursor stays valid across node materialization and page
//! allocation within its transaction.

use smallvec::SmallVec;

use crate::database::transaction::{Transaction, TxInner};
use crate::storage::Pgid;

use super::bucket::BucketId;
use super::node::NodeId;

/// One level of a cursor's descent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElemRef {
    pub pgid: Pgid,
    pub node: Option<NodeId>,
    pub index: usize,
}

pub(crate) type CursorStack = SmallVec<[ElemRef; 8]>;

/// Positioned walker over a bucket's tree.
pub struct Cursor<'tx, 'db> {
    tx: &'tx Transaction<'db>,
    bucket: BucketId,
    stack: CursorStack,
}

impl<'tx, 'db> Cursor<'tx, 'db> {
    pub(crate) fn new(tx: &'tx Transaction<'db>, bucket: BucketId) -> Self {
        Self {
            tx,
            bucket,
            stack: SmallVec::new(),
        }
    }

    /// Moves to the first key at or after `key`. Returns that entry's
    /// key, value, and flags, or `None` when positioned past the end of
    /// the bucket.
    pub fn seek(&mut self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>, u32)> {
        self.tx
            .inner
            .borrow()
            .seek_stack(self.bucket, key, &mut self.stack)
    }
}

impl TxInner<'_> {
    /// Core seek: clears `stack`, descends from the bucket root comparing
    /// keys byte-lexicographically, and returns the entry under the final
    /// frame (owned copies), or `None` when the index lands past the end.
    pub(crate) fn seek_stack(
        &self,
        b: BucketId,
        key: &[u8],
        stack: &mut CursorStack,
    ) -> Option<(Vec<u8>, Vec<u8>, u32)> {
        assert!(self.open, "transaction closed");

        stack.clear();
        self.search(b, key, self.buckets[b].header.root(), stack);

        let frame = *stack.last().expect("seek descended at least one level");
        if frame.index >= self.elem_count(b, &frame) {
            return None;
        }
        Some(self.key_value(b, &frame))
    }

    /// Recursive descent for one level: pushes a frame for `pgid` and
    /// either binary-searches the leaf or picks the child to follow.
    fn search(&self, b: BucketId, key: &[u8], pgid: Pgid, stack: &mut CursorStack) {
        let node = self.page_node_id(b, pgid);
        stack.push(ElemRef {
            pgid,
            node,
            index: 0,
        });

        let frame = *stack.last().expect("frame just pushed");
        if self.elem_is_leaf(b, &frame) {
            self.leaf_search(b, key, stack);
            return;
        }

        match node {
            Some(nid) => self.branch_search_node(b, key, nid, stack),
            None => self.branch_search_page(b, key, pgid, stack),
        }
    }

    /// Cached node for `pgid`, honoring the inline-bucket special case
    /// where the whole tree is the (pseudo page 0) inline root.
    fn page_node_id(&self, b: BucketId, pgid: Pgid) -> Option<NodeId> {
        let state = &self.buckets[b];
        if state.header.root() == 0 {
            assert_eq!(pgid, 0, "inline bucket referenced page {}", pgid);
            return state.root_node;
        }
        state.nodes.get(&pgid).copied()
    }

    fn branch_search_node(&self, b: BucketId, key: &[u8], nid: NodeId, stack: &mut CursorStack) {
        let (index, child) = {
            let node = &self.buckets[b].arena[nid];
            let (first_ge, exact) = match node
                .inodes
                .binary_search_by(|ino| ino.key.as_slice().cmp(key))
            {
                Ok(i) => (i, true),
                Err(i) => (i, false),
            };
            // Descend into the last child whose first key is <= key.
            let mut index = first_ge;
            if !exact && index > 0 {
                index -= 1;
            }
            (index, node.child_at(index))
        };

        stack.last_mut().expect("frame just pushed").index = index;
        self.search(b, key, child, stack);
    }

    fn branch_search_page(&self, b: BucketId, key: &[u8], pgid: Pgid, stack: &mut CursorStack) {
        let (index, child) = {
            let view = self.page_view_in(b, pgid);
            let count = view.count() as usize;
            let first_ge = lower_bound(count, |i| view.branch_key(i) < key);
            let exact = first_ge < count && view.branch_key(first_ge) == key;
            let mut index = first_ge;
            if !exact && index > 0 {
                index -= 1;
            }
            (index, view.branch_pgid(index))
        };

        stack.last_mut().expect("frame just pushed").index = index;
        self.search(b, key, child, stack);
    }

    /// Positions the top frame at the first leaf key >= `key`.
    fn leaf_search(&self, b: BucketId, key: &[u8], stack: &mut CursorStack) {
        let frame = *stack.last().expect("frame just pushed");
        let index = match frame.node {
            Some(nid) => {
                let node = &self.buckets[b].arena[nid];
                match node
                    .inodes
                    .binary_search_by(|ino| ino.key.as_slice().cmp(key))
                {
                    Ok(i) | Err(i) => i,
                }
            }
            None => {
                let view = self.page_view_in(b, frame.pgid);
                lower_bound(view.count() as usize, |i| view.leaf_key(i) < key)
            }
        };
        stack.last_mut().expect("frame just pushed").index = index;
    }

    pub(crate) fn elem_is_leaf(&self, b: BucketId, frame: &ElemRef) -> bool {
        match frame.node {
            Some(nid) => self.buckets[b].arena[nid].is_leaf,
            None => self.page_view_in(b, frame.pgid).is_leaf(),
        }
    }

    pub(crate) fn elem_count(&self, b: BucketId, frame: &ElemRef) -> usize {
        match frame.node {
            Some(nid) => self.buckets[b].arena[nid].inodes.len(),
            None => self.page_view_in(b, frame.pgid).count() as usize,
        }
    }

    /// Key, value, and flags under `frame`, copied out.
    pub(crate) fn key_value(&self, b: BucketId, frame: &ElemRef) -> (Vec<u8>, Vec<u8>, u32) {
        match frame.node {
            Some(nid) => {
                let ino = &self.buckets[b].arena[nid].inodes[frame.index];
                (ino.key.clone(), ino.value.clone(), ino.flags)
            }
            None => {
                let view = self.page_view_in(b, frame.pgid);
                (
                    view.leaf_key(frame.index).to_vec(),
                    view.leaf_value(frame.index).to_vec(),
                    view.leaf_flags(frame.index),
                )
            }
        }
    }

    /// Materializes the leaf under the cursor as a mutable node,
    /// promoting every page frame on the way down so a following `put`
    /// edits nodes rather than mapped pages.
    pub(crate) fn cursor_node(&mut self, b: BucketId, stack: &CursorStack) -> NodeId {
        assert!(
            !stack.is_empty(),
            "accessing node with zero-length cursor stack"
        );

        // Top of the stack is already a materialized leaf.
        if let Some(nid) = stack.last().expect("nonempty stack").node {
            if self.buckets[b].arena[nid].is_leaf {
                return nid;
            }
        }

        let mut node = match stack[0].node {
            Some(nid) => nid,
            None => self.bucket_node(b, stack[0].pgid, None),
        };
        for frame in &stack[..stack.len() - 1] {
            let child = self.buckets[b].arena[node].child_at(frame.index);
            node = self.bucket_node(b, child, Some(node));
        }
        debug_assert!(self.buckets[b].arena[node].is_leaf);
        node
    }
}

/// First index in `0..count` for which `below(i)` is false; `below` must
/// be monotone (true then false).
fn lower_bound(count: usize, below: impl Fn(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, count);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if below(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}
