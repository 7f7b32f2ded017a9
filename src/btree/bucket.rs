//! # Buckets
//!
//! A bucket is a named B+tree. Buckets nest: a child bucket is stored as
//! a leaf value in its parent, flagged with [`BUCKET_LEAF_FLAG`]. Small
//! buckets are *inline*: their whole root page rides along inside that
//! leaf value and they occupy no pages of their own until they outgrow a
//! quarter of a page.
//!
//! Bucket state lives in a transaction-owned arena. The public [`Bucket`]
//! type is a copyable handle (transaction reference plus arena id); all
//! state mutation happens inside the transaction cell, which is also why
//! lookups hand out owned key and value bytes.

use eyre::Result;
use hashbrown::HashMap;
use smallvec::SmallVec;
use zerocopy::IntoBytes;

use crate::config::{
    BUCKET_HEADER_SIZE, DEFAULT_FILL_PERCENT, LEAF_ELEMENT_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE,
    PAGE_HEADER_SIZE,
};
use crate::database::transaction::{Transaction, TxInner};
use crate::error::Error;
use crate::storage::page::PageHeader;
use crate::storage::{BucketHeader, PageView, Pgid, BUCKET_LEAF_FLAG, LEAF_PAGE_FLAG};

use super::cursor::Cursor;
use super::node::{Node, NodeId};

/// Index into a transaction's bucket arena.
pub(crate) type BucketId = usize;

/// The root bucket always occupies slot 0 of the arena.
pub(crate) const ROOT_BUCKET: BucketId = 0;

/// Per-transaction state of one bucket.
pub(crate) struct BucketState {
    /// On-disk descriptor: root page id (0 while inline) and sequence.
    pub header: BucketHeader,
    pub fill_percent: f64,
    /// Child buckets opened through this one, by name.
    pub children: HashMap<Vec<u8>, BucketId>,
    /// Materialized nodes by origin page id.
    pub nodes: HashMap<Pgid, NodeId>,
    pub root_node: Option<NodeId>,
    pub arena: Vec<Node>,
    /// Serialized root page of an inline bucket, copied onto the heap
    /// when the bucket was opened.
    pub inline: Option<Vec<u8>>,
}

impl BucketState {
    pub fn new(header: BucketHeader, inline: Option<Vec<u8>>) -> Self {
        Self {
            header,
            fill_percent: DEFAULT_FILL_PERCENT,
            children: HashMap::new(),
            nodes: HashMap::new(),
            root_node: None,
            arena: Vec::new(),
            inline,
        }
    }

    /// Reinterprets a bucket-flagged leaf value: the descriptor, followed
    /// by the inline root page when the descriptor says `root == 0`.
    pub fn from_value(value: &[u8]) -> Self {
        let header = *BucketHeader::from_bytes(value).expect("bucket value too short");
        let inline = if header.root() == 0 {
            let page = &value[BUCKET_HEADER_SIZE..];
            assert!(
                page.len() >= PAGE_HEADER_SIZE,
                "inline bucket value is missing its root page"
            );
            Some(page.to_vec())
        } else {
            None
        };
        Self::new(header, inline)
    }
}

/// Handle to a bucket within a transaction.
#[derive(Clone, Copy)]
pub struct Bucket<'tx, 'db> {
    pub(crate) tx: &'tx Transaction<'db>,
    pub(crate) id: BucketId,
}

impl std::fmt::Debug for Bucket<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("id", &self.id).finish()
    }
}

impl<'tx, 'db> Bucket<'tx, 'db> {
    /// Sets `key` to `value`. Writer-only; the key is copied, so the
    /// caller may reuse its buffers.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.inner.borrow_mut().bucket_put(self.id, key, value)
    }

    /// Looks up a child bucket. The handle is cached on this bucket for
    /// the rest of the transaction.
    pub fn bucket(&self, name: &[u8]) -> Option<Bucket<'tx, 'db>> {
        let id = self.tx.inner.borrow_mut().bucket_lookup(self.id, name)?;
        Some(Bucket { tx: self.tx, id })
    }

    /// Creates a child bucket and returns its handle.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        let id = self.tx.inner.borrow_mut().bucket_create(self.id, name)?;
        Ok(Bucket { tx: self.tx, id })
    }

    /// A fresh cursor rooted on this bucket.
    pub fn cursor(&self) -> Cursor<'tx, 'db> {
        Cursor::new(self.tx, self.id)
    }

    pub fn sequence(&self) -> u64 {
        self.tx.inner.borrow().buckets[self.id].header.sequence()
    }

    pub fn fill_percent(&self) -> f64 {
        self.tx.inner.borrow().buckets[self.id].fill_percent
    }

    /// Sets the split threshold as a fraction of the page size, clamped
    /// to `[0.1, 1.0]` when the split happens.
    pub fn set_fill_percent(&self, fill_percent: f64) {
        self.tx.inner.borrow_mut().buckets[self.id].fill_percent = fill_percent;
    }
}

impl TxInner<'_> {
    /// Raw bytes of a page as seen by bucket `b`: the inline root page for
    /// an inline bucket, a dirty or mapped page otherwise.
    pub(crate) fn page_ref(&self, b: BucketId, pgid: Pgid) -> &[u8] {
        let state = &self.buckets[b];
        if state.header.root() == 0 {
            assert_eq!(pgid, 0, "inline bucket referenced page {}", pgid);
            return state.inline.as_ref().expect("inline bucket payload");
        }
        self.page(pgid)
    }

    pub(crate) fn page_view_in(&self, b: BucketId, pgid: Pgid) -> PageView<'_> {
        PageView::new(self.page_ref(b, pgid)).expect("malformed page")
    }

    /// Write-path node factory: returns the cached node for `pgid` or
    /// materializes it from its page and links it to `parent`.
    pub(crate) fn bucket_node(&mut self, b: BucketId, pgid: Pgid, parent: Option<NodeId>) -> NodeId {
        assert!(self.writable, "nodes exist only in write transactions");
        if let Some(&id) = self.buckets[b].nodes.get(&pgid) {
            return id;
        }

        let node = {
            let view = self.page_view_in(b, pgid);
            Node::from_page(&view, parent)
        };

        let state = &mut self.buckets[b];
        let id = state.arena.len();
        state.arena.push(node);
        state.nodes.insert(pgid, id);
        match parent {
            Some(p) => state.arena[p].children.push(id),
            None => state.root_node = Some(id),
        }
        id
    }

    fn check_writable(&self) -> Result<()> {
        if !self.open {
            return Err(Error::TxClosed.into());
        }
        if !self.writable {
            return Err(Error::TxNotWritable.into());
        }
        Ok(())
    }

    pub(crate) fn bucket_put(&mut self, b: BucketId, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        if key.is_empty() {
            return Err(Error::KeyRequired.into());
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge.into());
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge.into());
        }

        let mut stack = SmallVec::new();
        if let Some((found, _, flags)) = self.seek_stack(b, key, &mut stack) {
            if found == key && flags & BUCKET_LEAF_FLAG != 0 {
                return Err(Error::IncompatibleValue.into());
            }
        }

        let hwm = self.meta.pgid_hwm();
        let node = self.cursor_node(b, &stack);
        self.buckets[b].arena[node].put(key, key, value.to_vec(), 0, 0, hwm);
        Ok(())
    }

    pub(crate) fn bucket_lookup(&mut self, b: BucketId, name: &[u8]) -> Option<BucketId> {
        assert!(self.open, "transaction closed");
        if let Some(&id) = self.buckets[b].children.get(name) {
            return Some(id);
        }

        let mut stack = SmallVec::new();
        let (key, value, flags) = self.seek_stack(b, name, &mut stack)?;
        if key != name || flags & BUCKET_LEAF_FLAG == 0 {
            return None;
        }

        let child = BucketState::from_value(&value);
        let id = self.buckets.len();
        self.buckets.push(child);
        self.buckets[b].children.insert(name.to_vec(), id);
        Some(id)
    }

    pub(crate) fn bucket_create(&mut self, b: BucketId, name: &[u8]) -> Result<BucketId> {
        self.check_writable()?;
        if name.is_empty() {
            return Err(Error::BucketNameRequired.into());
        }

        let mut stack = SmallVec::new();
        if let Some((key, _, flags)) = self.seek_stack(b, name, &mut stack) {
            if key == name {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(Error::BucketExists.into());
                }
                return Err(Error::IncompatibleValue.into());
            }
        }

        // A new bucket starts inline: zeroed descriptor plus an empty
        // leaf root page.
        let mut value = vec![0u8; BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE];
        {
            let header = PageHeader::from_bytes_mut(&mut value[BUCKET_HEADER_SIZE..])
                .expect("inline template buffer");
            header.set_flags(LEAF_PAGE_FLAG);
        }

        let hwm = self.meta.pgid_hwm();
        let node = self.cursor_node(b, &stack);
        self.buckets[b].arena[node].put(name, name, value, 0, BUCKET_LEAF_FLAG, hwm);

        Ok(self.bucket_lookup(b, name).expect("bucket just created"))
    }

    /// A bucket folds back into its parent's leaf when its whole tree is
    /// a single leaf with no nested buckets and fits in a quarter page.
    fn bucket_inlineable(&self, b: BucketId) -> bool {
        let state = &self.buckets[b];
        let Some(root) = state.root_node else {
            return false;
        };
        let node = &state.arena[root];
        if !node.is_leaf {
            return false;
        }

        let max_size = self.db.page_size() / 4;
        let mut size = PAGE_HEADER_SIZE;
        for ino in &node.inodes {
            size += LEAF_ELEMENT_SIZE + ino.key.len() + ino.value.len();
            if ino.flags & BUCKET_LEAF_FLAG != 0 {
                return false;
            }
            if size > max_size {
                return false;
            }
        }
        true
    }

    /// Serializes an inline bucket: descriptor followed by its root page.
    fn write_inline_bucket(&self, b: BucketId) -> Vec<u8> {
        let state = &self.buckets[b];
        let root = state.root_node.expect("inline bucket has a root node");
        let node = &state.arena[root];

        let mut value = vec![0u8; BUCKET_HEADER_SIZE + node.size()];
        value[..BUCKET_HEADER_SIZE].copy_from_slice(state.header.as_bytes());
        node.write_into(&mut value[BUCKET_HEADER_SIZE..]);
        value
    }

    /// Commit-time write-out of bucket `b`: child buckets first (each one
    /// re-embedded inline or spilled to pages, and its descriptor updated
    /// in this bucket's leaves), then this bucket's own node tree.
    pub(crate) fn bucket_spill(&mut self, b: BucketId) -> Result<()> {
        let mut children: Vec<(Vec<u8>, BucketId)> = self.buckets[b]
            .children
            .iter()
            .map(|(name, &id)| (name.clone(), id))
            .collect();
        children.sort();

        for (name, child) in children {
            let value = if self.bucket_inlineable(child) {
                self.bucket_free(child);
                self.write_inline_bucket(child)
            } else {
                self.bucket_spill(child)?;
                self.buckets[child].header.as_bytes().to_vec()
            };

            // Untouched buckets have no nodes and need no descriptor update.
            if self.buckets[child].root_node.is_none() {
                continue;
            }

            let mut stack = SmallVec::new();
            let hit = self.seek_stack(b, &name, &mut stack);
            let (key, _, flags) = hit.unwrap_or_else(|| {
                panic!("bucket entry {:?} vanished during spill", name);
            });
            assert_eq!(key, name, "bucket entry moved during spill");
            assert!(
                flags & BUCKET_LEAF_FLAG != 0,
                "misplaced bucket header during spill"
            );

            let hwm = self.meta.pgid_hwm();
            let node = self.cursor_node(b, &stack);
            self.buckets[b].arena[node].put(&name, &name, value, 0, BUCKET_LEAF_FLAG, hwm);
        }

        let Some(root) = self.buckets[b].root_node else {
            return Ok(());
        };
        self.spill_node(b, root)?;

        // The root may have gained a parent through a split.
        let new_root = self.node_root(b, root);
        self.buckets[b].root_node = Some(new_root);
        let pgid = self.buckets[b].arena[new_root].pgid;
        assert!(
            pgid < self.meta.pgid_hwm(),
            "bucket root pgid {} above high water mark {}",
            pgid,
            self.meta.pgid_hwm()
        );
        let sequence = self.buckets[b].header.sequence();
        self.buckets[b].header = BucketHeader::new(pgid, sequence);
        Ok(())
    }

    /// Recursively clears the unbalanced flag across this bucket's nodes
    /// and children; merging happens here once deletion exists.
    pub(crate) fn bucket_rebalance(&mut self, b: BucketId) {
        let children: Vec<BucketId> = self.buckets[b].children.values().copied().collect();
        for child in children {
            self.bucket_rebalance(child);
        }
        for node in self.buckets[b].arena.iter_mut() {
            node.rebalance();
        }
    }

    /// Releases every page of bucket `b`'s tree into the freelist and
    /// marks the bucket inline. Needed when a page-rooted bucket shrinks
    /// back under the inline threshold.
    pub(crate) fn bucket_free(&mut self, b: BucketId) {
        let root = self.buckets[b].header.root();
        if root == 0 {
            return;
        }
        self.free_tree(b, root);
        let sequence = self.buckets[b].header.sequence();
        self.buckets[b].header = BucketHeader::new(0, sequence);
    }

    fn free_tree(&mut self, b: BucketId, pgid: Pgid) {
        let txid = self.meta.txid();

        if let Some(&nid) = self.buckets[b].nodes.get(&pgid) {
            let child_pgids: Vec<Pgid> = {
                let node = &self.buckets[b].arena[nid];
                if node.is_leaf {
                    Vec::new()
                } else {
                    (0..node.inodes.len()).map(|i| node.child_at(i)).collect()
                }
            };
            for child in child_pgids {
                self.free_tree(b, child);
            }

            let node_pgid = self.buckets[b].arena[nid].pgid;
            if node_pgid != 0 {
                let (id, overflow) = {
                    let view = self.page_view(node_pgid);
                    (view.id(), view.overflow())
                };
                self.db.freelist().lock().free(txid, id, overflow);
                self.buckets[b].arena[nid].pgid = 0;
            }
        } else {
            let (child_pgids, id, overflow) = {
                let view = self.page_view(pgid);
                let children: Vec<Pgid> = if view.is_branch() {
                    (0..view.count() as usize).map(|i| view.branch_pgid(i)).collect()
                } else {
                    Vec::new()
                };
                (children, view.id(), view.overflow())
            };
            for child in child_pgids {
                self.free_tree(b, child);
            }
            self.db.freelist().lock().free(txid, id, overflow);
        }
    }
}
