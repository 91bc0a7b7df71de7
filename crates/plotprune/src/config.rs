//! Run configuration and the immutable table-metadata snapshot.
//!
//! The table-building stage hands this stage three read-only inputs: per-table
//! entry totals, per-table/per-bucket physical row counts, and per-table/
//! per-bucket referencing-row counts. They are captured once in a
//! [`PlotMetadata`] snapshot, validated, and shared by reference with every
//! component for the whole run; nothing here is mutated after construction.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// One of the seven tables of the plot.
///
/// Higher tables reference lower ones: each row of table *t* holds a pair of
/// offsets into table *t−1*'s entry space. Table 7 is the top; nothing
/// references it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TableId {
    /// Table 1 (leaves; never referenced by name here, kept for completeness).
    Table1 = 1,
    /// Table 2.
    Table2 = 2,
    /// Table 3.
    Table3 = 3,
    /// Table 4.
    Table4 = 4,
    /// Table 5.
    Table5 = 5,
    /// Table 6.
    Table6 = 6,
    /// Table 7 (top table; every entry counts as referenced).
    Table7 = 7,
}

impl TableId {
    /// All tables, ascending.
    pub const ALL: [Self; 7] = [
        Self::Table1,
        Self::Table2,
        Self::Table3,
        Self::Table4,
        Self::Table5,
        Self::Table6,
        Self::Table7,
    ];

    /// Zero-based index for table-keyed arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    /// One-based table number.
    #[must_use]
    pub const fn number(self) -> u32 {
        self as u32
    }

    /// The table this one references, if any.
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self {
            Self::Table1 => None,
            Self::Table2 => Some(Self::Table1),
            Self::Table3 => Some(Self::Table2),
            Self::Table4 => Some(Self::Table3),
            Self::Table5 => Some(Self::Table4),
            Self::Table6 => Some(Self::Table5),
            Self::Table7 => Some(Self::Table6),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Number of on-disk buckets every table is split into for this run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BucketCount {
    /// 128 buckets.
    B128 = 128,
    /// 256 buckets.
    B256 = 256,
    /// 512 buckets.
    B512 = 512,
    /// 1024 buckets.
    B1024 = 1024,
}

impl BucketCount {
    /// The bucket count as a plain number.
    #[must_use]
    pub const fn get(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for BucketCount {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            128 => Ok(Self::B128),
            256 => Ok(Self::B256),
            512 => Ok(Self::B512),
            1024 => Ok(Self::B1024),
            other => Err(Error::InvalidBucketCount(other)),
        }
    }
}

/// Immutable per-table metadata produced by the table-building stage.
///
/// `bucket_counts` holds each table's physical per-bucket row counts;
/// `ptr_bucket_counts` holds the per-bucket counts of the table *as the
/// referencing side* (the rows actually scanned when marking). Upstream
/// pruning can shuffle rows between buckets, but both arrays must still sum to
/// the same per-table entry total; [`PlotMetadata::validate`] enforces that.
#[derive(Debug)]
pub struct PlotMetadata {
    entry_counts: [u64; 7],
    bucket_counts: [Vec<u64>; 7],
    ptr_bucket_counts: [Vec<u64>; 7],
}

impl PlotMetadata {
    /// Builds a snapshot from the raw arrays, in table order 1..=7.
    #[must_use]
    pub const fn new(
        entry_counts: [u64; 7],
        bucket_counts: [Vec<u64>; 7],
        ptr_bucket_counts: [Vec<u64>; 7],
    ) -> Self {
        Self {
            entry_counts,
            bucket_counts,
            ptr_bucket_counts,
        }
    }

    /// Total entry count of a table.
    #[must_use]
    pub const fn entry_count(&self, table: TableId) -> u64 {
        self.entry_counts[table.index()]
    }

    /// Physical per-bucket row counts of a table.
    #[must_use]
    pub fn bucket_counts(&self, table: TableId) -> &[u64] {
        &self.bucket_counts[table.index()]
    }

    /// Per-bucket referencing-row counts of a table.
    #[must_use]
    pub fn ptr_bucket_counts(&self, table: TableId) -> &[u64] {
        &self.ptr_bucket_counts[table.index()]
    }

    /// Checks array lengths against the bucket count and reconciles both
    /// count arrays against every table's entry total.
    ///
    /// # Errors
    ///
    /// [`Error::MetadataMismatch`] on the first table whose counts diverge.
    pub fn validate(&self, buckets: BucketCount) -> Result<()> {
        for table in TableId::ALL {
            let expected = self.entry_count(table);
            for counts in [self.bucket_counts(table), self.ptr_bucket_counts(table)] {
                if counts.len() != buckets.get() {
                    return Err(Error::MetadataMismatch {
                        table,
                        expected,
                        actual: counts.iter().sum(),
                    });
                }
                let actual: u64 = counts.iter().sum();
                if actual != expected {
                    return Err(Error::MetadataMismatch {
                        table,
                        expected,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Validated configuration for one backward marking run.
#[derive(Debug, Clone)]
pub struct PruneConfig {
    /// Number of buckets per table.
    pub buckets: BucketCount,
    /// Worker thread count for the marking pool (at least 1).
    pub thread_count: usize,
    /// Storage block size; bitmap writes are rounded up to this.
    pub block_size: usize,
    /// Shared metadata snapshot.
    pub meta: Arc<PlotMetadata>,
}

impl PruneConfig {
    /// Builds and validates a configuration.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBlockSize`] for a zero or non-power-of-two block size,
    /// or any error from [`PlotMetadata::validate`].
    pub fn new(
        buckets: BucketCount,
        thread_count: usize,
        block_size: usize,
        meta: Arc<PlotMetadata>,
    ) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::InvalidBlockSize(block_size));
        }
        meta.validate(buckets)?;
        Ok(Self {
            buckets,
            thread_count: thread_count.max(1),
            block_size,
            meta,
        })
    }

    /// Largest entry count across all tables; both bitmap buffers are sized
    /// to this so they can be reused for every table iteration.
    #[must_use]
    pub fn max_entry_count(&self) -> u64 {
        self.meta.entry_counts.iter().copied().max().unwrap_or(0)
    }

    /// Largest referencing-row count of any single bucket, for sizing the
    /// reader's staging buffers.
    #[must_use]
    pub fn max_bucket_rows(&self) -> u64 {
        self.meta
            .ptr_bucket_counts
            .iter()
            .flatten()
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Size in bytes of one persisted marking bitfield:
    /// `ceil(max_entry_count / 8)` rounded up to the storage block size.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn markfield_size(&self) -> usize {
        let bytes = self.max_entry_count().div_ceil(8) as usize;
        bytes.next_multiple_of(self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_meta(entries: u64, buckets: usize) -> PlotMetadata {
        let per = entries / buckets as u64;
        let mut counts = vec![per; buckets];
        *counts.last_mut().unwrap() += entries - per * buckets as u64;
        PlotMetadata::new(
            [entries; 7],
            std::array::from_fn(|_| counts.clone()),
            std::array::from_fn(|_| counts.clone()),
        )
    }

    #[test]
    fn test_bucket_count_parse() {
        assert_eq!(BucketCount::try_from(128).unwrap(), BucketCount::B128);
        assert_eq!(BucketCount::try_from(1024).unwrap(), BucketCount::B1024);
        assert!(matches!(
            BucketCount::try_from(64),
            Err(Error::InvalidBucketCount(64))
        ));
    }

    #[test]
    fn test_table_id_ordering() {
        assert_eq!(TableId::Table7.prev(), Some(TableId::Table6));
        assert_eq!(TableId::Table1.prev(), None);
        assert_eq!(TableId::Table3.index(), 2);
    }

    #[test]
    fn test_metadata_reconciliation() {
        let meta = uniform_meta(10_000, 128);
        assert!(meta.validate(BucketCount::B128).is_ok());

        let mut bad = uniform_meta(10_000, 128);
        bad.ptr_bucket_counts[4][0] += 1;
        let err = bad.validate(BucketCount::B128).unwrap_err();
        assert!(matches!(
            err,
            Error::MetadataMismatch {
                table: TableId::Table5,
                expected: 10_000,
                actual: 10_001,
            }
        ));
    }

    #[test]
    fn test_markfield_size_rounds_to_block() {
        let cfg = PruneConfig::new(
            BucketCount::B128,
            4,
            4096,
            Arc::new(uniform_meta(100_000, 128)),
        )
        .unwrap();
        // 100_000 bits -> 12_500 bytes -> next 4 KiB boundary
        assert_eq!(cfg.markfield_size(), 16_384);
    }

    #[test]
    fn test_invalid_block_size() {
        let meta = Arc::new(uniform_meta(1000, 128));
        assert!(matches!(
            PruneConfig::new(BucketCount::B128, 4, 1000, meta),
            Err(Error::InvalidBlockSize(1000))
        ));
    }
}
