//! # Transactions
//!
//! A transaction is a snapshot of one meta page plus, for writers, the
//! machinery to supersede it: a dirty-page table, the bucket/node arenas,
//! and the commit pipeline.
//!
//! ## Snapshot rules
//!
//! Readers copy the newest valid meta at begin and hold the map's read
//! lock until they close; commits that happen later are invisible to
//! them. The single writer sees its own in-flight changes through the
//! dirty-page table, which is consulted before the map on every page
//! lookup.
//!
//! ## Commit pipeline
//!
//! ```text
//! rebalance -> spill -> adopt new root -> rewrite freelist -> grow file
//!   -> write dirty pages + fdatasync -> write meta + fdatasync -> close
//! ```
//!
//! Data pages are durable before the meta that references them; a crash
//! at any point leaves the previous meta as the newest valid one, which
//! is the whole recovery story. Any error along the way rolls back and
//! leaves the previous snapshot current.

use std::cell::RefCell;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{MutexGuard, RwLockReadGuard};

use crate::btree::bucket::{Bucket, BucketState, ROOT_BUCKET};
use crate::btree::cursor::Cursor;
use crate::config::MAX_WRITE_CHUNK;
use crate::error::Error;
use crate::storage::page::PageHeader;
use crate::storage::{Meta, MmapRegion, PageView, Pgid, Txid};

use super::Database;

/// A read-only or read-write transaction.
///
/// Obtained from [`Database::begin`]. Dropping an open transaction rolls
/// it back.
pub struct Transaction<'db> {
    pub(crate) db: &'db Database,
    pub(crate) inner: RefCell<TxInner<'db>>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish()
    }
}

/// Mutable transaction state. Public handles (`Bucket`, `Cursor`) borrow
/// the transaction and reach this through its cell; every internal
/// operation runs under a single borrow taken at the public surface, so
/// the cell is never borrowed reentrantly.
pub(crate) struct TxInner<'db> {
    pub db: &'db Database,
    pub writable: bool,
    pub managed: bool,
    pub open: bool,
    pub meta: Meta,
    /// High-water mark at begin; growth beyond it triggers a file grow
    /// during commit.
    pub hwm_at_begin: Pgid,
    /// Dirty pages by id, each buffer covering its whole run.
    pub pages: HashMap<Pgid, Vec<u8>>,
    /// Arena of buckets touched by this transaction; slot 0 is the root.
    pub buckets: Vec<BucketState>,
    /// Read pin on the map; released around the writer's own remaps and
    /// at close.
    pub mmap: Option<RwLockReadGuard<'db, MmapRegion>>,
    /// Writer exclusivity, held until close.
    pub writer: Option<MutexGuard<'db, ()>>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(db: &'db Database, writable: bool) -> Result<Transaction<'db>> {
        if writable && db.is_read_only() {
            return Err(Error::DatabaseReadOnly.into());
        }

        // Writer lock first; it is held until the transaction closes.
        let writer = if writable {
            Some(db.writer_lock())
        } else {
            None
        };

        // The meta lock makes snapshot selection and reader registration
        // atomic with respect to other begins and closes.
        let mut state = db.state_lock();
        let mmap = db.mmap_read();
        let mut meta = mmap
            .meta(db.page_size())
            .expect("pddb: invalid meta pages");

        if writable {
            meta.set_txid(meta.txid() + 1);
            // Pages freed under transactions no open reader can still see
            // become allocatable now.
            let min_reader = state.readers.iter().copied().min().unwrap_or(Txid::MAX);
            if min_reader > 0 {
                db.freelist().lock().release(min_reader - 1);
            }
        } else {
            state.readers.push(meta.txid());
        }
        drop(state);

        let root = BucketState::new(meta.root(), None);
        let hwm_at_begin = meta.pgid_hwm();
        Ok(Transaction {
            db,
            inner: RefCell::new(TxInner {
                db,
                writable,
                managed: false,
                open: true,
                meta,
                hwm_at_begin,
                pages: HashMap::new(),
                buckets: vec![root],
                mmap: Some(mmap),
                writer,
            }),
        })
    }

    pub fn db(&self) -> &'db Database {
        self.db
    }

    pub fn writable(&self) -> bool {
        self.inner.borrow().writable
    }

    /// This transaction's id: the snapshot's id for readers, the id being
    /// produced for writers.
    pub fn id(&self) -> Txid {
        self.inner.borrow().meta.txid()
    }

    /// Looks up a top-level bucket.
    pub fn bucket(&self, name: &[u8]) -> Option<Bucket<'_, 'db>> {
        let id = self.inner.borrow_mut().bucket_lookup(ROOT_BUCKET, name)?;
        Some(Bucket { tx: self, id })
    }

    /// Creates a top-level bucket.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        let id = self.inner.borrow_mut().bucket_create(ROOT_BUCKET, name)?;
        Ok(Bucket { tx: self, id })
    }

    /// A cursor over the root bucket.
    pub fn cursor(&self) -> Cursor<'_, 'db> {
        Cursor::new(self, ROOT_BUCKET)
    }

    /// Publishes this transaction's changes atomically. Writer-only.
    ///
    /// Panics when called on a managed transaction (one driven by
    /// [`Database::update`] or [`Database::view`]).
    pub fn commit(&self) -> Result<()> {
        self.inner.borrow_mut().commit()
    }

    /// Discards this transaction's changes and releases its resources.
    ///
    /// Panics when called on a managed transaction.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        assert!(
            !inner.managed,
            "rollback on a managed transaction is not allowed"
        );
        if !inner.open {
            return Err(Error::TxClosed.into());
        }
        inner.rollback();
        Ok(())
    }

    pub(crate) fn set_managed(&self, managed: bool) {
        self.inner.borrow_mut().managed = managed;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        if inner.open {
            inner.rollback();
        }
    }
}

impl<'db> TxInner<'db> {
    /// Full bytes of a page run: the dirty table first, the map second.
    pub(crate) fn page(&self, id: Pgid) -> &[u8] {
        if let Some(buf) = self.pages.get(&id) {
            return buf;
        }
        let region = self.mmap.as_ref().expect("transaction holds the map");
        region.page(id, self.db.page_size())
    }

    pub(crate) fn page_view(&self, id: Pgid) -> PageView<'_> {
        PageView::new(self.page(id)).expect("malformed page")
    }

    /// Allocates a run of `count` pages: from the freelist when a
    /// contiguous run exists, otherwise by advancing the high-water mark
    /// (remapping first when the run would cross the mapped window). The
    /// zeroed buffer joins the dirty table with its header pre-filled.
    pub(crate) fn allocate(&mut self, count: usize) -> Result<Pgid> {
        let page_size = self.db.page_size();
        let mut buf = if count == 1 {
            self.db.pool().acquire()
        } else {
            vec![0u8; count * page_size]
        };

        let mut id = self.db.freelist().lock().allocate(count);
        if id == 0 {
            id = self.meta.pgid_hwm();
            let min_size = (id as usize + count + 1) * page_size;
            if min_size >= self.mmap_len() {
                self.remap(min_size)?;
            }
            self.meta.set_pgid_hwm(id + count as Pgid);
        }

        {
            let header = PageHeader::from_bytes_mut(&mut buf).expect("allocated page buffer");
            header.set_id(id);
            header.set_overflow(count as u32 - 1);
        }
        self.pages.insert(id, buf);
        Ok(id)
    }

    fn mmap_len(&self) -> usize {
        self.mmap.as_ref().map(|region| region.size()).unwrap_or(0)
    }

    /// Remaps the database file to at least `min_size`, dropping our read
    /// pin for the duration. Only the writer calls this, and only from
    /// `allocate`, where no page borrows are outstanding.
    fn remap(&mut self, min_size: usize) -> Result<()> {
        self.mmap = None;
        let result = self.db.remap(min_size);
        self.mmap = Some(self.db.mmap_read());
        result
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        assert!(
            !self.managed,
            "commit on a managed transaction is not allowed"
        );
        if !self.open {
            return Err(Error::TxClosed.into());
        }
        if !self.writable {
            return Err(Error::TxNotWritable.into());
        }

        // Merge deletion debt before writing anything out.
        self.bucket_rebalance(ROOT_BUCKET);

        if let Err(err) = self.bucket_spill(ROOT_BUCKET) {
            self.rollback();
            return Err(err);
        }
        self.meta.set_root(self.buckets[ROOT_BUCKET].header);

        if let Err(err) = self.rewrite_freelist() {
            self.rollback();
            return Err(err);
        }

        if self.meta.pgid_hwm() > self.hwm_at_begin {
            let size = (self.meta.pgid_hwm() as usize + 1) * self.db.page_size();
            if let Err(err) = self.db.grow(size) {
                self.rollback();
                return Err(err);
            }
        }

        if let Err(err) = self.write_pages() {
            self.rollback();
            return Err(err);
        }
        if let Err(err) = self.write_meta() {
            self.rollback();
            return Err(err);
        }

        self.close();
        Ok(())
    }

    /// Releases the old freelist page under this transaction and writes
    /// the current freelist (free and pending ids both) to a fresh run.
    fn rewrite_freelist(&mut self) -> Result<()> {
        let txid = self.meta.txid();
        {
            let view = self.page_view(self.meta.freelist());
            let (id, overflow) = (view.id(), view.overflow());
            self.db.freelist().lock().free(txid, id, overflow);
        }

        let size = self.db.freelist().lock().size();
        let count = size.div_ceil(self.db.page_size());
        let pgid = self.allocate(count)?;

        let mut buf = self.pages.remove(&pgid).expect("freelist buffer just allocated");
        self.db.freelist().lock().write_into(&mut buf);
        self.pages.insert(pgid, buf);
        self.meta.set_freelist(pgid);
        Ok(())
    }

    /// Flushes every dirty page to its file offset in id order, chunked,
    /// then fdatasyncs. Single-page buffers return to the pool.
    fn write_pages(&mut self) -> Result<()> {
        let page_size = self.db.page_size();
        let mut pages = std::mem::take(&mut self.pages);
        let mut ids: Vec<Pgid> = pages.keys().copied().collect();
        ids.sort_unstable();

        for &id in &ids {
            let buf = &pages[&id];
            let mut offset = id * page_size as u64;
            for chunk in buf.chunks(MAX_WRITE_CHUNK) {
                self.db.write_at(chunk, offset)?;
                offset += chunk.len() as u64;
            }
        }
        self.db.sync_data()?;

        for (_, buf) in pages.drain() {
            self.db.pool().release(buf);
        }
        Ok(())
    }

    /// Renders the meta into its alternating slot and fdatasyncs; this is
    /// the atomic publish.
    fn write_meta(&mut self) -> Result<()> {
        let page_size = self.db.page_size();
        let mut buf = self.db.pool().acquire();
        self.meta.write_into(&mut buf);

        let offset = (self.meta.txid() % 2) * page_size as u64;
        let result = self.db.write_at(&buf, offset).and_then(|_| self.db.sync_data());
        self.db.pool().release(buf);
        result
    }

    /// Discards dirty state. For a writer this also forgets the pending
    /// frees of this transaction and restores the freelist to its on-disk
    /// image (keeping other transactions' pending sets), undoing any
    /// allocations taken from it.
    pub(crate) fn rollback(&mut self) {
        if !self.open {
            return;
        }
        if self.writable {
            let txid = self.meta.txid();
            let page_size = self.db.page_size();
            let region = self.mmap.as_ref().expect("transaction holds the map");
            let committed = region.meta(page_size).expect("pddb: invalid meta pages");

            let mut freelist = self.db.freelist().lock();
            freelist.rollback(txid);
            let page = region.page(committed.freelist(), page_size);
            let view = PageView::new(page).expect("freelist page");
            freelist.reload(&view);
        }
        self.close();
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let was_reader = !self.writable;
        let txid = self.meta.txid();

        // Release the writer lock and drop the map pin before touching the
        // reader registry; a closing reader must never hold the registry
        // lock while a remap is queued behind its pin.
        self.writer = None;
        self.mmap = None;
        if was_reader {
            self.db.remove_reader(txid);
        }

        self.pages = HashMap::new();
        self.buckets.clear();
    }
}
