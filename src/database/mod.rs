//! # Database
//!
//! Owns the file, the read-only map, the freelist, and the three locks
//! that make the engine multi-reader / single-writer:
//!
//! - *writer lock*: an exclusive mutex held by the one write transaction
//!   from begin to close;
//! - *meta lock*: a short mutex protecting snapshot selection and the
//!   open-reader registry;
//! - *mmap lock*: a readers-writer lock. Transactions pin the map with
//!   the read half for their lifetime; remapping takes the write half.
//!
//! Cross-process exclusion uses an advisory `flock`: shared for read-only
//! opens, exclusive otherwise, held for the database's lifetime.
//!
//! ## File lifecycle
//!
//! An empty file is initialized with four pages: two meta snapshots, an
//! empty freelist at page 2, and an empty leaf at page 3 as the root
//! bucket. A non-empty file must carry a valid meta on page 0 or 1; its
//! recorded page size is adopted so a database created on one kernel
//! page size opens correctly on another.

pub mod transaction;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::config::{Options, LOCK_POLL_INTERVAL, META_SIZE, PAGE_HEADER_SIZE};
use crate::error::Error;
use crate::memory::PagePool;
use crate::storage::page::PageHeader;
use crate::storage::{
    mmap_size, Freelist, Meta, MmapRegion, PageView, Txid, FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG,
};

pub use transaction::Transaction;

/// Buffers kept warm for page allocation and meta writes.
const PAGE_POOL_SIZE: usize = 8;

/// An open database file.
///
/// All methods take `&self`; the database can be shared across threads
/// and hands out transactions that borrow it.
pub struct Database {
    path: PathBuf,
    file: File,
    read_only: bool,
    page_size: usize,
    pool: PagePool,
    mmap: RwLock<MmapRegion>,
    state: Mutex<DbState>,
    freelist: Mutex<Freelist>,
    rwlock: Mutex<()>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("page_size", &self.page_size)
            .finish()
    }
}

pub(crate) struct DbState {
    /// Transaction ids of the open readers, used to decide which pending
    /// freelist pages are safe to reuse.
    pub readers: Vec<Txid>,
}

impl Database {
    /// Opens (or creates) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Database> {
        let path = path.as_ref().to_path_buf();

        let mut open_options = OpenOptions::new();
        open_options.read(true);
        if !options.read_only {
            open_options.write(true).create(true).mode(options.mode);
        }
        let file = open_options
            .open(&path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        flock(&file, !options.read_only, options.timeout)?;

        let file_len = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len() as usize;

        let page_size;
        if file_len == 0 {
            if options.read_only {
                return Err(Error::Invalid.into());
            }
            page_size = os_page_size();
            init(&file, page_size)?;
        } else {
            // Adopt the creating system's page size; fall back to ours
            // when page 0 does not parse (the map validation below has
            // the final say).
            page_size = read_page_size(&file).unwrap_or_else(os_page_size);
        }

        let file_len = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len() as usize;
        if file_len < page_size * 2 {
            // Too small to even hold the two meta pages.
            return Err(Error::Invalid.into());
        }

        let mut region = MmapRegion::unmapped();
        let target = mmap_size(file_len.max(options.initial_mmap_size))?;
        region.remap(&file, target)?;

        let meta = region.meta(page_size)?;

        let mut freelist = Freelist::new();
        {
            let view = PageView::new(region.page(meta.freelist(), page_size))?;
            freelist.read(&view);
        }

        Ok(Database {
            path,
            file,
            read_only: options.read_only,
            page_size,
            pool: PagePool::new(page_size, PAGE_POOL_SIZE),
            mmap: RwLock::new(region),
            state: Mutex::new(DbState {
                readers: Vec::new(),
            }),
            freelist: Mutex::new(freelist),
            rwlock: Mutex::new(()),
        })
    }

    /// Starts a transaction. `begin(true)` blocks until it is the only
    /// writer; any number of readers run concurrently.
    pub fn begin(&self, writable: bool) -> Result<Transaction<'_>> {
        Transaction::begin(self, writable)
    }

    /// Runs `f` inside a managed write transaction: committed when it
    /// returns `Ok`, rolled back when it returns `Err`.
    pub fn update<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin(true)?;
        tx.set_managed(true);
        let result = f(&tx);
        tx.set_managed(false);
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback();
                Err(err)
            }
        }
    }

    /// Runs `f` inside a managed read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin(false)?;
        tx.set_managed(true);
        let result = f(&tx);
        tx.set_managed(false);
        let _ = tx.rollback();
        result
    }

    /// Closes the database. Equivalent to dropping it; the advisory file
    /// lock is released either way.
    pub fn close(self) {}

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Forces file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.sync_data()
    }

    /// Grows the map to cover at least `min_size` bytes of file. Blocks
    /// until every open transaction has dropped its read pin.
    pub(crate) fn remap(&self, min_size: usize) -> Result<()> {
        let mut region = self.mmap.write();
        let file_len = self
            .file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len() as usize;
        let target = mmap_size(file_len.max(min_size))?;
        region.remap(&self.file, target)?;
        // Both metas must still be readable through the new window.
        region.meta(self.page_size).map(|_| ())
    }

    /// Extends the file to at least `size` bytes, zero-filled, and
    /// flushes the length change.
    pub(crate) fn grow(&self, size: usize) -> Result<()> {
        let current = self
            .file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();
        if size as u64 <= current {
            return Ok(());
        }

        self.file
            .set_len(size as u64)
            .wrap_err_with(|| format!("failed to grow database file to {} bytes", size))?;
        self.file
            .sync_all()
            .wrap_err("failed to sync file growth")?;
        Ok(())
    }

    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .wrap_err_with(|| format!("failed to write {} bytes at offset {}", buf.len(), offset))
    }

    pub(crate) fn sync_data(&self) -> Result<()> {
        self.file.sync_data().wrap_err("fdatasync failed")
    }

    pub(crate) fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub(crate) fn freelist(&self) -> &Mutex<Freelist> {
        &self.freelist
    }

    pub(crate) fn writer_lock(&self) -> MutexGuard<'_, ()> {
        self.rwlock.lock()
    }

    pub(crate) fn state_lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock()
    }

    pub(crate) fn mmap_read(&self) -> RwLockReadGuard<'_, MmapRegion> {
        self.mmap.read()
    }

    pub(crate) fn remove_reader(&self, txid: Txid) {
        let mut state = self.state.lock();
        if let Some(pos) = state.readers.iter().position(|&t| t == txid) {
            state.readers.swap_remove(pos);
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // SAFETY: unlocking an fd this struct owns; no memory involved.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Writes the four initial pages of a fresh database: meta snapshots 0
/// and 1, an empty freelist, and an empty leaf as the root bucket.
fn init(file: &File, page_size: usize) -> Result<()> {
    let mut buf = vec![0u8; page_size * 4];

    for i in 0..2u64 {
        let mut meta = Meta::new(page_size as u32);
        meta.set_txid(i);
        meta.write_into(&mut buf[i as usize * page_size..]);
    }
    {
        let header = PageHeader::from_bytes_mut(&mut buf[2 * page_size..]).expect("init buffer");
        header.set_id(2);
        header.set_flags(FREELIST_PAGE_FLAG);
    }
    {
        let header = PageHeader::from_bytes_mut(&mut buf[3 * page_size..]).expect("init buffer");
        header.set_id(3);
        header.set_flags(LEAF_PAGE_FLAG);
    }

    file.write_all_at(&buf, 0)
        .wrap_err("failed to write initial database pages")?;
    file.sync_data()
        .wrap_err("failed to sync initial database pages")?;
    Ok(())
}

/// Reads the recorded page size from page 0, if it carries a valid meta.
fn read_page_size(file: &File) -> Option<usize> {
    let mut buf = [0u8; 4096];
    let n = file.read_at(&mut buf, 0).ok()?;
    if n < PAGE_HEADER_SIZE + META_SIZE {
        return None;
    }
    let meta = Meta::from_bytes(&buf[PAGE_HEADER_SIZE..n]).ok()?;
    meta.validate().ok()?;
    Some(meta.page_size() as usize)
}

/// Acquires the advisory file lock, polling every 50 ms until `timeout`
/// elapses. A zero timeout waits indefinitely.
fn flock(file: &File, exclusive: bool, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    loop {
        let mut flags = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        flags |= libc::LOCK_NB;

        // SAFETY: flock on an fd this function borrows; no memory involved.
        let rc = unsafe { libc::flock(file.as_raw_fd(), flags) };
        if rc == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
            return Err(err).wrap_err("failed to acquire database file lock");
        }
        if !timeout.is_zero() && started.elapsed() > timeout {
            return Err(Error::Timeout.into());
        }
        std::thread::sleep(LOCK_POLL_INTERVAL);
    }
}

fn os_page_size() -> usize {
    // SAFETY: sysconf has no memory side effects.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_initializes_four_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");

        let db = Database::open(&path, Options::default()).unwrap();

        let expected = db.page_size() as u64 * 4;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
        assert_eq!(db.path(), path.as_path());
    }

    #[test]
    fn reopen_adopts_the_recorded_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");

        let page_size = {
            let db = Database::open(&path, Options::default()).unwrap();
            db.page_size()
        };

        let db = Database::open(&path, Options::default()).unwrap();
        assert_eq!(db.page_size(), page_size);
    }

    #[test]
    fn garbage_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, b"this is not a pddb database").unwrap();

        let err = Database::open(&path, Options::default()).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Invalid));
    }

    #[test]
    fn corrupt_magic_on_both_metas_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.db");
        {
            let db = Database::open(&path, Options::default()).unwrap();
            drop(db);
        }

        // Stomp the magic of both meta pages.
        let page_size = os_page_size();
        let mut contents = std::fs::read(&path).unwrap();
        for i in 0..2 {
            let off = i * page_size + PAGE_HEADER_SIZE;
            contents[off..off + 4].copy_from_slice(&[0u8; 4]);
        }
        std::fs::write(&path, &contents).unwrap();

        let err = Database::open(&path, Options::default()).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Invalid));
    }

    #[test]
    fn second_exclusive_open_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let _db = Database::open(&path, Options::default()).unwrap();

        let err = Database::open(
            &path,
            Options {
                timeout: Duration::from_millis(120),
                ..Options::default()
            },
        )
        .unwrap_err();

        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Timeout));
    }

    #[test]
    fn read_only_open_rejects_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        {
            let db = Database::open(&path, Options::default()).unwrap();
            drop(db);
        }

        let db = Database::open(
            &path,
            Options {
                read_only: true,
                ..Options::default()
            },
        )
        .unwrap();

        let err = db.begin(true).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::DatabaseReadOnly));
    }
}
