//! # B+Tree Module
//!
//! The copy-on-write tree: in-memory nodes, nested buckets, and cursors.
//!
//! Reads walk mapped pages directly. The first write to a page
//! materializes it as a [`node::Node`] in the owning bucket's arena, and
//! commit spills the touched subtree into freshly allocated pages; the
//! previous pages are released to the freelist once no reader needs them.
//!
//! - `node`: mutable page images, insert, split, spill
//! - `bucket`: named subtrees, inline embedding, recursive spill
//! - `cursor`: frame-stack descent and the `seek` primitive

pub mod bucket;
pub mod cursor;
pub mod node;

pub use bucket::Bucket;
pub use cursor::Cursor;
