//! Error types for the mark-and-prune stage.

use std::io;

use thiserror::Error;

use crate::config::TableId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes of the backward marking run.
///
/// Everything here is fatal for the run: a configuration error means the
/// metadata handed over by the table-building stage is incompatible or
/// corrupted, and an I/O error leaves no partial-bitmap recovery path. There
/// is no transient or retryable class — once a bucket is in memory, marking is
/// pure bit manipulation.
///
/// Programming-invariant violations inside the marking computation itself
/// (a map-resolved index outside the owning table's entry count) abort via
/// `assert!` rather than returning a value: they indicate a mismatch between
/// the upstream stage and the bucket-count metadata, not a condition callers
/// could handle.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the storage collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bucket count other than 128/256/512/1024.
    #[error("unsupported bucket count: {0}")]
    InvalidBucketCount(u32),

    /// Storage block size that is zero or not a power of two.
    #[error("unsupported storage block size: {0}")]
    InvalidBlockSize(usize),

    /// Per-bucket row counts do not reconcile with the table's entry total.
    ///
    /// Both the physical and the pointer/reference bucket-count arrays must
    /// sum to the same per-table entry count; divergence means the upstream
    /// stage and this one disagree about the table layout.
    #[error("table {table} row counts do not reconcile: buckets total {actual}, entry count {expected}")]
    MetadataMismatch {
        /// Table whose counts failed to reconcile.
        table: TableId,
        /// Entry count the metadata claims for the table.
        expected: u64,
        /// Sum of the offending bucket-count array.
        actual: u64,
    },
}
