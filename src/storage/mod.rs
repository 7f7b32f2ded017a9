//! # Storage Module
//!
//! The on-disk side of the engine: page layout, meta pages, the freelist,
//! and the read-only memory map.
//!
//! ## Architecture Overview
//!
//! The database is a single file of fixed-size pages. Readers see the file
//! through one shared, read-only memory map; the writer builds pages in
//! heap buffers and transfers them to the file with positioned writes
//! followed by `fdatasync`. No code path ever writes through the map, so a
//! page view borrowed from it can never alias a mutation.
//!
//! ## Safety Model
//!
//! The map is remapped when the file grows. Rather than hazard pointers or
//! epoch tracking, the crate leans on two mechanisms:
//!
//! - every transaction pins the map with the read half of a `RwLock` for
//!   its whole lifetime, so a remap waits for them;
//! - page views are plain borrowed slices, so the borrow checker refuses
//!   code that would hold one across a remap.
//!
//! ## Module Organization
//!
//! - `page`: page header, typed element arrays, checked byte views
//! - `meta`: the alternating meta pages and their FNV-1a checksum
//! - `freelist`: free and pending page accounting, run allocation
//! - `mmap`: the read-only shared map and its size ladder

mod freelist;
mod meta;
mod mmap;
pub(crate) mod page;

pub use freelist::Freelist;
pub use meta::{BucketHeader, Meta};
pub use mmap::{mmap_size, MmapRegion};
pub use page::{
    PageHeader, PageView, BRANCH_PAGE_FLAG, BUCKET_LEAF_FLAG, FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG,
    META_PAGE_FLAG,
};

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Page identifier: an index into the file in units of the page size.
pub type Pgid = u64;

/// Transaction identifier. Strictly increasing across commits; parity
/// selects which of the two meta pages a commit overwrites.
pub type Txid = u64;

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + zerocopy::IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}
