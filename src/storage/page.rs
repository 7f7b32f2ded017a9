//! # Page Layout
//!
//! Every page begins with a 16-byte header followed by a typed payload
//! selected by the header flags. This module defines the header, the
//! branch and leaf element records, and `PageView`, a checked read view
//! over a raw byte buffer.
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ------------------------------------------
//! 0       8     id        Page id (u64, little-endian)
//! 8       2     flags     branch / leaf / meta / freelist
//! 10      2     count     Number of elements (freelist: see below)
//! 12      4     overflow  Extra contiguous pages in this run
//! ```
//!
//! ## Element Layouts (16 bytes each)
//!
//! ```text
//! Branch: pos: u32, ksize: u32, pgid: u64
//! Leaf:   flags: u32, pos: u32, ksize: u32, vsize: u32
//! ```
//!
//! Elements form an array directly after the header; key and value bytes
//! fill the rest of the page. `pos` is measured from the element's own
//! offset, not from the page start, so a page round-trips through the map
//! and through heap buffers without fix-up.
//!
//! A freelist page stores sorted u64 page ids as its payload. When the
//! count does not fit in the 16-bit header field, the header holds
//! `0xFFFF` and the true count occupies the first payload slot.
//!
//! ## Read/Write Split
//!
//! `PageView` is strictly read-only and may be backed by the shared map.
//! Mutation happens only through `PageHeader::from_bytes_mut` and the node
//! and freelist serializers, all of which operate on heap-owned buffers;
//! nothing in this crate writes through a view obtained from the map.

use eyre::Result;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BRANCH_ELEMENT_SIZE, LEAF_ELEMENT_SIZE, PAGE_HEADER_SIZE};
use crate::storage::{parse_zerocopy, parse_zerocopy_mut, Pgid};

pub const BRANCH_PAGE_FLAG: u16 = 0x01;
pub const LEAF_PAGE_FLAG: u16 = 0x02;
pub const META_PAGE_FLAG: u16 = 0x04;
pub const FREELIST_PAGE_FLAG: u16 = 0x10;

/// Leaf element flag marking a nested bucket value.
pub const BUCKET_LEAF_FLAG: u32 = 0x01;

/// Header count value signalling that the true freelist count lives in the
/// first payload slot.
pub const FREELIST_COUNT_OVERFLOW: u16 = 0xFFFF;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    id: U64,
    flags: U16,
    count: U16,
    overflow: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    zerocopy_accessors! {
        id: u64,
        flags: u16,
        count: u16,
        overflow: u32,
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        parse_zerocopy(data, "PageHeader")
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        parse_zerocopy_mut(data, "PageHeader")
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BranchElement {
    pos: U32,
    ksize: U32,
    pgid: U64,
}

const _: () = assert!(std::mem::size_of::<BranchElement>() == BRANCH_ELEMENT_SIZE);

impl BranchElement {
    zerocopy_accessors! {
        pos: u32,
        ksize: u32,
        pgid: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafElement {
    flags: U32,
    pos: U32,
    ksize: U32,
    vsize: U32,
}

const _: () = assert!(std::mem::size_of::<LeafElement>() == LEAF_ELEMENT_SIZE);

impl LeafElement {
    zerocopy_accessors! {
        flags: u32,
        pos: u32,
        ksize: u32,
        vsize: u32,
    }
}

/// Read-only view over one page run (head page plus its overflow pages).
///
/// The backing bytes may live in the shared map or in a transaction's
/// dirty-page buffer; element accessors index with the stored offsets and
/// panic on a malformed page, which indicates corruption or a broken
/// serializer rather than a recoverable condition.
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    bytes: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        PageHeader::from_bytes(bytes)?;
        Ok(Self { bytes })
    }

    fn header(&self) -> &PageHeader {
        PageHeader::from_bytes(self.bytes).expect("validated in PageView::new")
    }

    pub fn id(&self) -> Pgid {
        self.header().id()
    }

    pub fn flags(&self) -> u16 {
        self.header().flags()
    }

    pub fn count(&self) -> u16 {
        self.header().count()
    }

    pub fn overflow(&self) -> u32 {
        self.header().overflow()
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & LEAF_PAGE_FLAG != 0
    }

    pub fn is_branch(&self) -> bool {
        self.flags() & BRANCH_PAGE_FLAG != 0
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[PAGE_HEADER_SIZE..]
    }

    fn element_offset(i: usize, element_size: usize) -> usize {
        PAGE_HEADER_SIZE + i * element_size
    }

    pub fn branch_element(&self, i: usize) -> &'a BranchElement {
        debug_assert!(i < self.count() as usize);
        let off = Self::element_offset(i, BRANCH_ELEMENT_SIZE);
        parse_zerocopy(&self.bytes[off..], "BranchElement").expect("branch element out of bounds")
    }

    pub fn leaf_element(&self, i: usize) -> &'a LeafElement {
        debug_assert!(i < self.count() as usize);
        let off = Self::element_offset(i, LEAF_ELEMENT_SIZE);
        parse_zerocopy(&self.bytes[off..], "LeafElement").expect("leaf element out of bounds")
    }

    /// Key bytes of branch element `i`.
    pub fn branch_key(&self, i: usize) -> &'a [u8] {
        let off = Self::element_offset(i, BRANCH_ELEMENT_SIZE);
        let elem = self.branch_element(i);
        let start = off + elem.pos() as usize;
        &self.bytes[start..start + elem.ksize() as usize]
    }

    /// Child page id of branch element `i`.
    pub fn branch_pgid(&self, i: usize) -> Pgid {
        self.branch_element(i).pgid()
    }

    /// Key bytes of leaf element `i`.
    pub fn leaf_key(&self, i: usize) -> &'a [u8] {
        let off = Self::element_offset(i, LEAF_ELEMENT_SIZE);
        let elem = self.leaf_element(i);
        let start = off + elem.pos() as usize;
        &self.bytes[start..start + elem.ksize() as usize]
    }

    /// Value bytes of leaf element `i` (directly after its key).
    pub fn leaf_value(&self, i: usize) -> &'a [u8] {
        let off = Self::element_offset(i, LEAF_ELEMENT_SIZE);
        let elem = self.leaf_element(i);
        let start = off + elem.pos() as usize + elem.ksize() as usize;
        &self.bytes[start..start + elem.vsize() as usize]
    }

    pub fn leaf_flags(&self, i: usize) -> u32 {
        self.leaf_element(i).flags()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_leaf_page(entries: &[(&[u8], &[u8], u32)]) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        {
            let header = PageHeader::from_bytes_mut(&mut buf).unwrap();
            header.set_id(7);
            header.set_flags(LEAF_PAGE_FLAG);
            header.set_count(entries.len() as u16);
        }
        let mut pos = PAGE_HEADER_SIZE + entries.len() * LEAF_ELEMENT_SIZE;
        for (i, (key, value, flags)) in entries.iter().enumerate() {
            let off = PAGE_HEADER_SIZE + i * LEAF_ELEMENT_SIZE;
            {
                let elem =
                    crate::storage::parse_zerocopy_mut::<LeafElement>(&mut buf[off..], "LeafElement")
                        .unwrap();
                elem.set_flags(*flags);
                elem.set_pos((pos - off) as u32);
                elem.set_ksize(key.len() as u32);
                elem.set_vsize(value.len() as u32);
            }
            buf[pos..pos + key.len()].copy_from_slice(key);
            pos += key.len();
            buf[pos..pos + value.len()].copy_from_slice(value);
            pos += value.len();
        }
        buf
    }

    #[test]
    fn page_header_size_is_16() {
        assert_eq!(std::mem::size_of::<PageHeader>(), 16);
    }

    #[test]
    fn element_sizes_are_16() {
        assert_eq!(std::mem::size_of::<BranchElement>(), 16);
        assert_eq!(std::mem::size_of::<LeafElement>(), 16);
    }

    #[test]
    fn page_header_roundtrip() {
        let mut buf = vec![0u8; 64];
        {
            let header = PageHeader::from_bytes_mut(&mut buf).unwrap();
            header.set_id(42);
            header.set_flags(BRANCH_PAGE_FLAG);
            header.set_count(9);
            header.set_overflow(3);
        }

        let view = PageView::new(&buf).unwrap();

        assert_eq!(view.id(), 42);
        assert!(view.is_branch());
        assert!(!view.is_leaf());
        assert_eq!(view.count(), 9);
        assert_eq!(view.overflow(), 3);
    }

    #[test]
    fn page_header_fields_are_little_endian() {
        let mut buf = vec![0u8; 16];
        {
            let header = PageHeader::from_bytes_mut(&mut buf).unwrap();
            header.set_id(0x0102_0304_0506_0708);
            header.set_count(0x1122);
        }

        assert_eq!(&buf[..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[10..12], &[0x22, 0x11]);
    }

    #[test]
    fn leaf_elements_resolve_keys_and_values() {
        let buf = build_leaf_page(&[
            (b"alpha", b"1", 0),
            (b"beta", b"two", BUCKET_LEAF_FLAG),
            (b"gamma", b"", 0),
        ]);

        let view = PageView::new(&buf).unwrap();

        assert_eq!(view.count(), 3);
        assert_eq!(view.leaf_key(0), b"alpha");
        assert_eq!(view.leaf_value(0), b"1");
        assert_eq!(view.leaf_key(1), b"beta");
        assert_eq!(view.leaf_value(1), b"two");
        assert_eq!(view.leaf_flags(1), BUCKET_LEAF_FLAG);
        assert_eq!(view.leaf_key(2), b"gamma");
        assert_eq!(view.leaf_value(2), b"");
    }

    #[test]
    fn element_positions_are_relative_to_the_element() {
        let buf = build_leaf_page(&[(b"k", b"v", 0)]);
        let view = PageView::new(&buf).unwrap();

        // One element: payload starts right after the element array, so the
        // stored pos equals the element's own size.
        assert_eq!(view.leaf_element(0).pos() as usize, LEAF_ELEMENT_SIZE);
    }

    #[test]
    fn view_rejects_truncated_buffer() {
        let buf = [0u8; 8];
        assert!(PageView::new(&buf).is_err());
    }
}
