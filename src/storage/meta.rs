//! # Meta Pages
//!
//! Pages 0 and 1 hold alternating snapshots of the database root state.
//! The writer committing transaction `T` overwrites meta page `T mod 2`,
//! so a crash mid-commit always leaves the other meta intact; recovery is
//! simply "pick the newest meta that validates".
//!
//! ## Meta Layout (64 bytes at payload offset 16)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  --------------------------------------
//! 0       4     magic      0xEC0CDAED
//! 4       4     version    Format version (2)
//! 8       4     page_size  Page size chosen at creation
//! 12      4     flags      Reserved
//! 16      16    root       Root bucket descriptor (pgid, sequence)
//! 32      8     freelist   Page id of the freelist page
//! 40      8     pgid_hwm   High-water mark: one past the last page
//! 48      8     txid       Transaction id of this snapshot
//! 56      8     checksum   FNV-1a over the preceding 56 bytes
//! ```
//!
//! A zero checksum is accepted for compatibility with files written before
//! checksums existed; anything else must match.

use std::hash::Hasher;

use eyre::Result;
use fnv::FnvHasher;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{MAGIC, META_SIZE, PAGE_HEADER_SIZE, VERSION};
use crate::error::Error;
use crate::storage::page::{PageHeader, META_PAGE_FLAG};
use crate::storage::{parse_zerocopy, Pgid};

/// Bucket descriptor as stored on disk: the root page id of the bucket's
/// tree and a monotonically increasing sequence counter. `root == 0`
/// marks an inline bucket whose serialized root page follows the
/// descriptor inside the parent's leaf value.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BucketHeader {
    root: U64,
    sequence: U64,
}

const _: () = assert!(std::mem::size_of::<BucketHeader>() == crate::config::BUCKET_HEADER_SIZE);

impl BucketHeader {
    zerocopy_accessors! {
        root: u64,
        sequence: u64,
    }

    pub fn new(root: Pgid, sequence: u64) -> Self {
        Self {
            root: U64::new(root),
            sequence: U64::new(sequence),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        parse_zerocopy(data, "BucketHeader")
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    root: BucketHeader,
    freelist: U64,
    pgid_hwm: U64,
    txid: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_SIZE);

/// The checksum covers everything before the checksum field itself.
const CHECKSUM_OFFSET: usize = META_SIZE - 8;

impl Meta {
    zerocopy_accessors! {
        magic: u32,
        version: u32,
        page_size: u32,
        flags: u32,
        freelist: u64,
        pgid_hwm: u64,
        txid: u64,
        checksum: u64,
    }

    /// Template for a freshly initialized database: empty freelist at
    /// page 2, empty root leaf at page 3, four pages allocated in total.
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            page_size: U32::new(page_size),
            flags: U32::new(0),
            root: BucketHeader::new(3, 0),
            freelist: U64::new(2),
            pgid_hwm: U64::new(4),
            txid: U64::new(0),
            checksum: U64::new(0),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        parse_zerocopy(data, "Meta")
    }

    pub fn root(&self) -> BucketHeader {
        self.root
    }

    pub fn set_root(&mut self, root: BucketHeader) {
        self.root = root;
    }

    /// FNV-1a over the struct up to the checksum field.
    pub fn sum64(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(&self.as_bytes()[..CHECKSUM_OFFSET]);
        hasher.finish()
    }

    /// Checks magic, version, and checksum, in that order.
    pub fn validate(&self) -> Result<()> {
        if self.magic() != MAGIC {
            return Err(Error::Invalid.into());
        }
        if self.version() != VERSION {
            return Err(Error::VersionMismatch.into());
        }
        if self.checksum() != 0 && self.checksum() != self.sum64() {
            return Err(Error::Checksum.into());
        }
        Ok(())
    }

    /// Renders this meta into a page buffer: the page id is `txid mod 2`
    /// and the checksum is recomputed.
    ///
    /// Panics when the root or freelist page id has escaped above the
    /// high-water mark; a meta like that must never reach disk.
    pub fn write_into(&self, buf: &mut [u8]) {
        assert!(
            self.root.root() < self.pgid_hwm(),
            "root bucket pgid {} above high water mark {}",
            self.root.root(),
            self.pgid_hwm()
        );
        assert!(
            self.freelist() < self.pgid_hwm(),
            "freelist pgid {} above high water mark {}",
            self.freelist(),
            self.pgid_hwm()
        );

        {
            let header = PageHeader::from_bytes_mut(buf).expect("meta page buffer too small");
            header.set_id(self.txid() % 2);
            header.set_flags(META_PAGE_FLAG);
            header.set_count(0);
            header.set_overflow(0);
        }

        let mut meta = *self;
        meta.set_checksum(meta.sum64());
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE].copy_from_slice(meta.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_size_is_64() {
        assert_eq!(std::mem::size_of::<Meta>(), 64);
    }

    #[test]
    fn fresh_meta_validates() {
        let mut meta = Meta::new(4096);
        meta.set_checksum(meta.sum64());

        assert!(meta.validate().is_ok());
    }

    #[test]
    fn zero_checksum_is_accepted() {
        let meta = Meta::new(4096);

        assert!(meta.validate().is_ok());
    }

    #[test]
    fn corrupted_magic_is_invalid() {
        let mut meta = Meta::new(4096);
        meta.set_magic(0xDEAD_BEEF);

        let err = meta.validate().unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Invalid));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut meta = Meta::new(4096);
        meta.set_version(VERSION + 1);
        meta.set_checksum(meta.sum64());

        let err = meta.validate().unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::VersionMismatch));
    }

    #[test]
    fn flipped_bit_fails_the_checksum() {
        let mut meta = Meta::new(4096);
        meta.set_checksum(meta.sum64());
        meta.set_pgid_hwm(meta.pgid_hwm() + 1);

        let err = meta.validate().unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Checksum));
    }

    #[test]
    fn checksum_covers_only_the_prefix() {
        let mut a = Meta::new(4096);
        let mut b = a;
        a.set_checksum(1);
        b.set_checksum(2);

        assert_eq!(a.sum64(), b.sum64());
    }

    #[test]
    fn write_into_targets_the_alternating_page() {
        let mut meta = Meta::new(4096);
        meta.set_txid(7);
        let mut buf = vec![0u8; 4096];

        meta.write_into(&mut buf);

        let view = crate::storage::PageView::new(&buf).unwrap();
        assert_eq!(view.id(), 1);
        assert_eq!(view.flags(), META_PAGE_FLAG);

        let parsed = Meta::from_bytes(&buf[PAGE_HEADER_SIZE..]).unwrap();
        assert_eq!(parsed.txid(), 7);
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.checksum(), parsed.sum64());
    }

    #[test]
    #[should_panic(expected = "high water mark")]
    fn write_into_rejects_root_above_hwm() {
        let mut meta = Meta::new(4096);
        meta.set_root(BucketHeader::new(9, 0));
        let mut buf = vec![0u8; 4096];

        meta.write_into(&mut buf);
    }
}
