//! # Configuration Constants and Open Options
//!
//! This module centralizes the layout constants and limits of the file
//! format, grouping interdependent values together. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! page size P (runtime, OS page size at database creation)
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, fixed)
//!       │
//!       ├─> BRANCH_ELEMENT_SIZE / LEAF_ELEMENT_SIZE (16 bytes each)
//!       │     Node serialization and split thresholds derive from these.
//!       │
//!       └─> inline bucket threshold (P / 4, computed per database)
//!
//! MIN_MMAP_SIZE (32 KiB)
//!       │
//!       └─> map sizes double up to MAX_MMAP_STEP (1 GiB), then advance in
//!           1 GiB steps up to MAX_MAP_SIZE (2 GiB), the absolute cap on
//!           the database file.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions in `storage::page` and
//! `storage::meta`:
//!
//! 1. `size_of::<PageHeader>() == PAGE_HEADER_SIZE`
//! 2. `size_of::<BranchElement>() == BRANCH_ELEMENT_SIZE` (same for leaf)
//! 3. `size_of::<Meta>() == META_SIZE`
//!
//! Unlike the fixed-size constants, the page size itself is a runtime
//! value: it is chosen once at database creation (the OS page size) and
//! adopted from the file's first meta page on every subsequent open.

use std::time::Duration;

// ============================================================================
// FILE FORMAT IDENTITY
// ============================================================================

/// Magic number identifying a pddb file.
pub const MAGIC: u32 = 0xEC0C_DAED;

/// On-disk format version.
pub const VERSION: u32 = 2;

// ============================================================================
// PAGE LAYOUT CONSTANTS
// ============================================================================

/// Size of the header that begins every page.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of one branch page element (pos, ksize, child pgid).
pub const BRANCH_ELEMENT_SIZE: usize = 16;

/// Size of one leaf page element (flags, pos, ksize, vsize).
pub const LEAF_ELEMENT_SIZE: usize = 16;

/// Size of the serialized bucket descriptor (root pgid, sequence).
pub const BUCKET_HEADER_SIZE: usize = 16;

/// Size of the serialized meta struct, checksum included.
pub const META_SIZE: usize = 64;

// ============================================================================
// MAPPING LIMITS
// ============================================================================

/// Smallest memory map the database will create (32 KiB). Map sizes double
/// from here until they reach [`MAX_MMAP_STEP`].
pub const MIN_MMAP_SIZE: usize = 1 << 15;

/// Beyond 1 GiB the map grows in steps of this size instead of doubling.
pub const MAX_MMAP_STEP: usize = 1 << 30;

/// Absolute cap on the database size (just under 2 GiB).
pub const MAX_MAP_SIZE: usize = 0x7FFF_FFFF;

/// Largest number of bytes handed to a single write syscall when flushing
/// dirty pages. Runs larger than this are written in chunks.
pub const MAX_WRITE_CHUNK: usize = 0x7FFF_F000;

// ============================================================================
// KEY/VALUE AND TREE LIMITS
// ============================================================================

/// Largest key accepted by `put`.
pub const MAX_KEY_SIZE: usize = 32768;

/// Largest value accepted by `put`.
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// A node keeps at least this many inodes on each side of a split.
pub const MIN_KEYS_PER_PAGE: usize = 2;

/// Lower clamp for a bucket's fill percent.
pub const MIN_FILL_PERCENT: f64 = 0.1;

/// Upper clamp for a bucket's fill percent.
pub const MAX_FILL_PERCENT: f64 = 1.0;

/// Fraction of a page a node may fill before it splits during spill.
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;

// ============================================================================
// LOCKING
// ============================================================================

/// Poll interval while contending for the advisory file lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Options accepted by [`Database::open`](crate::Database::open).
#[derive(Debug, Clone)]
pub struct Options {
    /// How long to keep retrying the advisory file lock before failing
    /// with `Error::Timeout`. Zero waits indefinitely.
    pub timeout: Duration,

    /// Open the file read-only and take a shared lock instead of an
    /// exclusive one. Write transactions are rejected.
    pub read_only: bool,

    /// Initial size of the memory map. Useful when the expected database
    /// size is known up front; remaps stop until the file outgrows it.
    /// Zero lets the map track the file size.
    pub initial_mmap_size: usize,

    /// Unix permission bits for a newly created database file.
    pub mode: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            read_only: false,
            initial_mmap_size: 0,
            mode: 0o600,
        }
    }
}
