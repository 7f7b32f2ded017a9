//! # pddb - Embedded Transactional Key/Value Store
//!
//! pddb is a single-file, embedded key/value store built on a page-backed
//! copy-on-write B+tree behind single-writer / multi-reader transactions.
//! Commit atomically publishes a new snapshot of the whole key space; a
//! crash or abort leaves the previous snapshot intact.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pddb::{Database, Options};
//!
//! let db = Database::open("app.db", Options::default())?;
//!
//! let tx = db.begin(true)?;
//! let bucket = tx.create_bucket(b"widgets")?;
//! bucket.put(b"color", b"red")?;
//! tx.commit()?;
//!
//! let tx = db.begin(false)?;
//! let bucket = tx.bucket(b"widgets").unwrap();
//! let (key, value, _flags) = bucket.cursor().seek(b"color").unwrap();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Public API (Database, Tx, Bucket) │
//! ├─────────────────────────────────────┤
//! │   B+Tree (nodes, buckets, cursors)  │
//! ├─────────────────────────────────────┤
//! │   Transactions (snapshots, commit)  │
//! ├─────────────────────────────────────┤
//! │   Storage (pages, meta, freelist)   │
//! ├─────────────────────────────────────┤
//! │   Read-only mmap + positioned I/O   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! There is no write-ahead log. Pages are copy-on-write: a commit writes
//! changed pages to fresh locations, syncs them, and only then overwrites
//! one of the two alternating meta pages (again synced). The newest meta
//! with a valid checksum is the database; an interrupted commit simply
//! never becomes visible.
//!
//! ## Module Overview
//!
//! - [`storage`]: page layout, meta pages, freelist, memory map
//! - [`btree`]: nodes, nested buckets, cursors
//! - [`database`]: file lifecycle, locks, transactions
//! - [`config`]: format constants and open options
//! - [`memory`]: page buffer pool

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod database;
pub mod error;
pub mod memory;
pub mod storage;

pub use btree::{Bucket, Cursor};
pub use config::Options;
pub use database::{Database, Transaction};
pub use error::Error;
