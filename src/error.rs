//! # Error Kinds
//!
//! Typed failure kinds for the public surface. Everything else in the crate
//! reports through `eyre::Result`; these kinds are attached to the report so
//! callers can discriminate them with `Report::downcast_ref::<Error>()`
//! without losing the context chain on the way up.
//!
//! Programming errors (double-free, page id above the high-water mark,
//! zero-length inode keys, commit on a managed transaction) are not errors
//! at all: they indicate a broken invariant and panic.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The file lock could not be acquired within the configured timeout.
    #[error("timeout")]
    Timeout,

    /// The file is not a pddb database (bad magic, or too small to hold
    /// the two meta pages).
    #[error("invalid database")]
    Invalid,

    /// The file was written by an incompatible format version.
    #[error("version mismatch")]
    VersionMismatch,

    /// A meta page checksum did not match its contents.
    #[error("checksum error")]
    Checksum,

    #[error("database not open")]
    DatabaseNotOpen,

    /// A write transaction was requested on a database opened read-only.
    #[error("database is in read-only mode")]
    DatabaseReadOnly,

    /// The transaction has already been committed or rolled back.
    #[error("transaction closed")]
    TxClosed,

    /// A mutating operation was attempted on a read-only transaction.
    #[error("transaction not writable")]
    TxNotWritable,

    #[error("bucket name required")]
    BucketNameRequired,

    #[error("bucket already exists")]
    BucketExists,

    /// The key exists but holds the wrong kind of value for the operation,
    /// e.g. creating a bucket over a plain key or putting a plain value
    /// over a bucket.
    #[error("incompatible value")]
    IncompatibleValue,

    #[error("key required")]
    KeyRequired,

    #[error("key too large")]
    KeyTooLarge,

    #[error("value too large")]
    ValueTooLarge,
}
