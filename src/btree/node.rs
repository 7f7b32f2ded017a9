//! # Nodes
//!
//! A node is the in-memory, mutable image of a branch or leaf page. Nodes
//! exist only inside a write transaction: cursors materialize them on the
//! pages they touch, `put` edits them, and commit serializes them back
//! into freshly allocated pages (the spill).
//!
//! Nodes form a transient tree linked by arena ids into the owning
//! bucket's node arena rather than by pointers; the tree lives only for
//! the duration of a spill and is discarded with the transaction.

use eyre::Result;

use crate::config::{
    BRANCH_ELEMENT_SIZE, LEAF_ELEMENT_SIZE, MAX_FILL_PERCENT, MIN_FILL_PERCENT, MIN_KEYS_PER_PAGE,
    PAGE_HEADER_SIZE,
};
use crate::database::transaction::TxInner;
use crate::storage::page::{BranchElement, LeafElement, PageHeader};
use crate::storage::{parse_zerocopy_mut, PageView, Pgid, BRANCH_PAGE_FLAG, LEAF_PAGE_FLAG};

use super::bucket::BucketId;

/// Index into a bucket's node arena.
pub type NodeId = usize;

/// One key entry inside a node. Leaf inodes carry a value; branch inodes
/// carry the child page id instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub flags: u32,
    pub pgid: Pgid,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug)]
pub struct Node {
    pub is_leaf: bool,
    /// Page this node was read from; 0 for a node that has not been
    /// assigned a page yet.
    pub pgid: Pgid,
    pub unbalanced: bool,
    pub spilled: bool,
    /// First key at materialization time, used to address this node in
    /// its parent.
    pub key: Vec<u8>,
    pub parent: Option<NodeId>,
    /// Materialized children, live only until they are spilled.
    pub children: Vec<NodeId>,
    pub inodes: Vec<Inode>,
}

impl Node {
    pub fn new(is_leaf: bool, parent: Option<NodeId>) -> Self {
        Self {
            is_leaf,
            pgid: 0,
            unbalanced: false,
            spilled: false,
            key: Vec::new(),
            parent,
            children: Vec::new(),
            inodes: Vec::new(),
        }
    }

    /// Deserializes a page into a fresh node.
    pub fn from_page(view: &PageView<'_>, parent: Option<NodeId>) -> Self {
        let is_leaf = view.is_leaf();
        let count = view.count() as usize;
        let mut inodes = Vec::with_capacity(count);
        for i in 0..count {
            if is_leaf {
                inodes.push(Inode {
                    flags: view.leaf_flags(i),
                    pgid: 0,
                    key: view.leaf_key(i).to_vec(),
                    value: view.leaf_value(i).to_vec(),
                });
            } else {
                inodes.push(Inode {
                    flags: 0,
                    pgid: view.branch_pgid(i),
                    key: view.branch_key(i).to_vec(),
                    value: Vec::new(),
                });
            }
        }
        let key = inodes.first().map(|ino| ino.key.clone()).unwrap_or_default();

        Self {
            is_leaf,
            pgid: view.id(),
            unbalanced: false,
            spilled: false,
            key,
            parent,
            children: Vec::new(),
            inodes,
        }
    }

    pub fn page_element_size(&self) -> usize {
        if self.is_leaf {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        }
    }

    /// Serialized size of this node, page header included.
    pub fn size(&self) -> usize {
        let elem = self.page_element_size();
        self.inodes
            .iter()
            .fold(PAGE_HEADER_SIZE, |acc, ino| {
                acc + elem + ino.key.len() + ino.value.len()
            })
    }

    /// Like `size() < v` but returns as soon as the bound is crossed.
    pub fn size_less_than(&self, v: usize) -> bool {
        let elem = self.page_element_size();
        let mut sz = PAGE_HEADER_SIZE;
        for ino in &self.inodes {
            sz += elem + ino.key.len() + ino.value.len();
            if sz >= v {
                return false;
            }
        }
        true
    }

    /// Inserts or overwrites an inode. `old_key` addresses the slot (the
    /// first inode with key >= old_key, overwritten only on an exact
    /// match); `new_key` is what gets stored. Keys are copied.
    pub fn put(
        &mut self,
        old_key: &[u8],
        new_key: &[u8],
        value: Vec<u8>,
        pgid: Pgid,
        flags: u32,
        hwm: Pgid,
    ) {
        assert!(pgid < hwm, "inode pgid {} above high water mark {}", pgid, hwm);
        assert!(!old_key.is_empty(), "put: zero-length old key");
        assert!(!new_key.is_empty(), "put: zero-length new key");

        match self
            .inodes
            .binary_search_by(|ino| ino.key.as_slice().cmp(old_key))
        {
            Ok(i) => {
                let ino = &mut self.inodes[i];
                ino.flags = flags;
                ino.pgid = pgid;
                ino.key = new_key.to_vec();
                ino.value = value;
            }
            Err(i) => {
                self.inodes.insert(
                    i,
                    Inode {
                        flags,
                        pgid,
                        key: new_key.to_vec(),
                        value,
                    },
                );
            }
        }
    }

    /// Serializes this node into a page buffer. Element headers come
    /// first; key and value bytes fill the space after the element array,
    /// addressed by offsets relative to each element.
    pub fn write_into(&self, buf: &mut [u8]) {
        assert!(
            self.inodes.len() < 0xFFFF,
            "node element count overflow: {}",
            self.inodes.len()
        );

        let page_id = PageHeader::from_bytes(buf).expect("page buffer too small").id();
        {
            let header = PageHeader::from_bytes_mut(buf).expect("page buffer too small");
            header.set_flags(if self.is_leaf {
                LEAF_PAGE_FLAG
            } else {
                BRANCH_PAGE_FLAG
            });
            header.set_count(self.inodes.len() as u16);
        }
        if self.inodes.is_empty() {
            return;
        }

        let elem_size = self.page_element_size();
        let mut pos = PAGE_HEADER_SIZE + elem_size * self.inodes.len();
        for (i, ino) in self.inodes.iter().enumerate() {
            assert!(!ino.key.is_empty(), "write: zero-length inode key");

            let off = PAGE_HEADER_SIZE + i * elem_size;
            if self.is_leaf {
                let elem = parse_zerocopy_mut::<LeafElement>(&mut buf[off..], "LeafElement")
                    .expect("leaf element slot");
                elem.set_flags(ino.flags);
                elem.set_pos((pos - off) as u32);
                elem.set_ksize(ino.key.len() as u32);
                elem.set_vsize(ino.value.len() as u32);
            } else {
                assert!(
                    ino.pgid != page_id,
                    "write: circular child reference on page {}",
                    page_id
                );
                let elem = parse_zerocopy_mut::<BranchElement>(&mut buf[off..], "BranchElement")
                    .expect("branch element slot");
                elem.set_pos((pos - off) as u32);
                elem.set_ksize(ino.key.len() as u32);
                elem.set_pgid(ino.pgid);
            }

            buf[pos..pos + ino.key.len()].copy_from_slice(&ino.key);
            pos += ino.key.len();
            buf[pos..pos + ino.value.len()].copy_from_slice(&ino.value);
            pos += ino.value.len();
        }
    }

    /// Page id of the child subtree stored at `index`. Branch nodes only;
    /// leaf inodes carry values, not children.
    pub fn child_at(&self, index: usize) -> Pgid {
        assert!(!self.is_leaf, "child_at on a leaf node");
        self.inodes[index].pgid
    }

    /// Index at which `split_two` divides this node: the running
    /// serialized size crosses `threshold`, but both halves keep at least
    /// [`MIN_KEYS_PER_PAGE`] inodes.
    pub fn split_index(&self, threshold: usize) -> usize {
        let elem = self.page_element_size();
        let mut sz = PAGE_HEADER_SIZE;
        let mut index = 0;
        for i in 0..self.inodes.len() - MIN_KEYS_PER_PAGE {
            index = i;
            let ino = &self.inodes[i];
            let elsize = elem + ino.key.len() + ino.value.len();
            if i >= MIN_KEYS_PER_PAGE && sz + elsize > threshold {
                break;
            }
            sz += elsize;
        }
        index
    }

    /// Merges underfilled nodes after deletions. Nothing in this crate
    /// marks a node unbalanced yet, so clearing the flag is the whole job;
    /// commit still calls this before every spill.
    pub fn rebalance(&mut self) {
        if !self.unbalanced {
            return;
        }
        self.unbalanced = false;
    }
}

impl TxInner<'_> {
    /// Writes a node tree rooted at `n` out to pages: children first, then
    /// `n` itself, split as needed to honor the page size. Freshly split
    /// roots recurse into their new parent.
    pub(crate) fn spill_node(&mut self, b: BucketId, n: NodeId) -> Result<()> {
        if self.buckets[b].arena[n].spilled {
            return Ok(());
        }

        // Spill materialized children first, lowest key first. The list
        // can grow while we walk it (splits append siblings), so index
        // into it instead of iterating.
        {
            let state = &mut self.buckets[b];
            let mut children = std::mem::take(&mut state.arena[n].children);
            children.sort_by(|&x, &y| state.arena[x].inodes[0].key.cmp(&state.arena[y].inodes[0].key));
            state.arena[n].children = children;
        }
        let mut i = 0;
        loop {
            let child = {
                let children = &self.buckets[b].arena[n].children;
                if i >= children.len() {
                    break;
                }
                children[i]
            };
            self.spill_node(b, child)?;
            i += 1;
        }
        self.buckets[b].arena[n].children.clear();

        let page_size = self.db.page_size();
        for node_id in self.split(b, n) {
            // The page this node was read from is superseded.
            let old_pgid = self.buckets[b].arena[node_id].pgid;
            if old_pgid > 0 {
                let (id, overflow) = {
                    let view = self.page_view(old_pgid);
                    (view.id(), view.overflow())
                };
                self.db.freelist().lock().free(self.meta.txid(), id, overflow);
                self.buckets[b].arena[node_id].pgid = 0;
            }

            let size = self.buckets[b].arena[node_id].size();
            let pgid = self.allocate(size.div_ceil(page_size))?;
            assert!(
                pgid < self.meta.pgid_hwm(),
                "spilled node pgid {} above high water mark {}",
                pgid,
                self.meta.pgid_hwm()
            );

            let mut buf = self.pages.remove(&pgid).expect("page buffer just allocated");
            self.buckets[b].arena[node_id].write_into(&mut buf);
            self.pages.insert(pgid, buf);

            {
                let node = &mut self.buckets[b].arena[node_id];
                node.pgid = pgid;
                node.spilled = true;
            }

            // Record the node under its parent.
            let parent = self.buckets[b].arena[node_id].parent;
            if let Some(p) = parent {
                let hwm = self.meta.pgid_hwm();
                let (old_key, first_key) = {
                    let node = &self.buckets[b].arena[node_id];
                    let old = if node.key.is_empty() {
                        node.inodes[0].key.clone()
                    } else {
                        node.key.clone()
                    };
                    (old, node.inodes[0].key.clone())
                };
                self.buckets[b].arena[p].put(&old_key, &first_key, Vec::new(), pgid, 0, hwm);
                self.buckets[b].arena[node_id].key = first_key;
            }
        }

        // A splitting root grows a brand-new parent; it needs spilling too.
        if let Some(p) = self.buckets[b].arena[n].parent {
            if self.buckets[b].arena[p].pgid == 0 {
                self.buckets[b].arena[n].children.clear();
                return self.spill_node(b, p);
            }
        }
        Ok(())
    }

    /// Splits a node into as many siblings as the page size demands,
    /// returned left to right. All siblings share the original parent.
    fn split(&mut self, b: BucketId, n: NodeId) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        let mut node = n;
        loop {
            nodes.push(node);
            match self.split_two(b, node) {
                Some(next) => node = next,
                None => break,
            }
        }
        nodes
    }

    /// Splits off the tail of an oversized node into a new right sibling.
    /// Returns `None` when the node fits its page or is too small to
    /// divide.
    fn split_two(&mut self, b: BucketId, n: NodeId) -> Option<NodeId> {
        let page_size = self.db.page_size();
        {
            let node = &self.buckets[b].arena[n];
            if node.inodes.len() <= MIN_KEYS_PER_PAGE * 2 || node.size_less_than(page_size) {
                return None;
            }
        }

        let fill = self.buckets[b]
            .fill_percent
            .clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT);
        let threshold = (page_size as f64 * fill) as usize;
        let split_index = self.buckets[b].arena[n].split_index(threshold);

        // A splitting root gets a fresh parent to receive the separators.
        let parent = match self.buckets[b].arena[n].parent {
            Some(p) => p,
            None => {
                let state = &mut self.buckets[b];
                let p = state.arena.len();
                state.arena.push(Node::new(false, None));
                state.arena[p].children.push(n);
                state.arena[n].parent = Some(p);
                p
            }
        };

        let state = &mut self.buckets[b];
        let tail = state.arena[n].inodes.split_off(split_index);
        let is_leaf = state.arena[n].is_leaf;
        let next = state.arena.len();
        let mut sibling = Node::new(is_leaf, Some(parent));
        sibling.inodes = tail;
        state.arena.push(sibling);
        state.arena[parent].children.push(next);
        Some(next)
    }

    /// Walks parent links up to the topmost node of `n`'s tree.
    pub(crate) fn node_root(&self, b: BucketId, n: NodeId) -> NodeId {
        let mut node = n;
        while let Some(p) = self.buckets[b].arena[node].parent {
            node = p;
        }
        node
    }
}
