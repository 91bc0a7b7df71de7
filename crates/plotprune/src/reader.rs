//! Double-buffered bucket streaming of pair and map rows.
//!
//! Tables exceed memory, so the marking engine consumes them bucket by
//! bucket. [`PairAndMapReader`] keeps two staging slots: while the engine
//! processes bucket *k* out of one slot, the asynchronous read of bucket
//! *k+1* lands in the other. Pair rows are delta-encoded on disk; decoding
//! them into bucket-relative `{left, right}` offsets is this module's job —
//! the marking engine never sees the wire format.

use std::sync::Arc;

use blockbuf::AlignedBuf;
use tracing::trace;

use crate::config::{PruneConfig, TableId};
use crate::error::Result;
use crate::fence::Fence;
use crate::io::{FileKind, IoBuf, IoQueue};

/// One row of a table: two offsets into the previous table's entry space,
/// relative to the current bucket's base.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pair {
    /// Offset of the first referenced entry.
    pub left: u32,
    /// Offset of the second referenced entry; always `>= left`.
    pub right: u32,
}

/// Bytes of one serialized pair row: `left` as `u32` LE plus
/// `right - left` as `u16` LE. The delta keeps the stored value narrow;
/// matched entries sit near each other in the previous table.
pub const PAIR_ROW_SIZE: usize = 6;

/// Bytes of one serialized map row (`u64` LE).
pub const MAP_ROW_SIZE: usize = 8;

/// Serializes one pair row. Inverse of the reader's decoding; the
/// table-building stage owns the real writer, this one exists for fixtures
/// and tests.
///
/// # Panics
///
/// If `right - left` exceeds the 16-bit delta the row format allows.
pub fn encode_pair(pair: Pair, out: &mut Vec<u8>) {
    let delta = pair
        .right
        .checked_sub(pair.left)
        .expect("pair.right must not precede pair.left");
    assert!(delta <= u32::from(u16::MAX), "pair delta exceeds row format");
    out.extend_from_slice(&pair.left.to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(delta as u16).to_le_bytes());
}

/// Streaming source of one table's buckets, in index order.
///
/// The caller drives the double buffer: one priming
/// [`load_next_bucket`](Self::load_next_bucket) call, then per bucket *k* one
/// further `load_next_bucket` (prefetching *k+1*) followed by
/// [`unpack_bucket`](Self::unpack_bucket)`(k)`. Unpacking bucket *k* must
/// happen before bucket *k+2* is loaded; the staging slot is reused.
pub trait BucketReader {
    /// Starts the asynchronous load of the next unread bucket, if any.
    fn load_next_bucket(&mut self);

    /// Blocks until bucket `bucket`'s data has arrived, then decodes its pair
    /// rows into `pairs` and (for tables below 7) its map rows into `map`.
    /// Returns the bucket's row count.
    ///
    /// # Errors
    ///
    /// Fatal I/O errors surfaced by the storage collaborator.
    fn unpack_bucket(
        &mut self,
        bucket: usize,
        pairs: &mut Vec<Pair>,
        map: &mut Vec<u64>,
    ) -> Result<usize>;
}

struct Slot {
    pairs_raw: AlignedBuf,
    map_raw: AlignedBuf,
}

/// [`BucketReader`] over an [`IoQueue`], staging into two block-aligned slots.
pub struct PairAndMapReader {
    io: Arc<dyn IoQueue>,
    table: TableId,
    row_counts: Vec<u64>,
    slots: [Slot; 2],
    fence: Arc<Fence>,
    next_bucket: usize,
}

impl PairAndMapReader {
    /// Creates a reader for `table`, sized for the run's largest bucket.
    ///
    /// # Errors
    ///
    /// Staging buffer allocation failure.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(io: Arc<dyn IoQueue>, config: &PruneConfig, table: TableId) -> Result<Self> {
        let max_rows = config.max_bucket_rows() as usize;
        let slot = || -> Result<Slot> {
            Ok(Slot {
                pairs_raw: AlignedBuf::zeroed((max_rows * PAIR_ROW_SIZE).max(1))?,
                map_raw: AlignedBuf::zeroed((max_rows * MAP_ROW_SIZE).max(1))?,
            })
        };
        Ok(Self {
            io,
            table,
            row_counts: config.meta.ptr_bucket_counts(table).to_vec(),
            slots: [slot()?, slot()?],
            fence: Arc::new(Fence::new()),
            next_bucket: 0,
        })
    }

    const fn has_map(&self) -> bool {
        // Table 7 has no table referencing it, hence no map to resolve
        // relevance against.
        !matches!(self.table, TableId::Table7)
    }
}

impl BucketReader for PairAndMapReader {
    #[allow(clippy::cast_possible_truncation)]
    fn load_next_bucket(&mut self) {
        if self.next_bucket >= self.row_counts.len() {
            return;
        }
        let bucket = self.next_bucket;
        self.next_bucket += 1;

        let rows = self.row_counts[bucket] as usize;
        let slot = &self.slots[bucket & 1];
        trace!(table = self.table.number(), bucket, rows, "bucket load issued");

        // SAFETY: the slot buffers are untouched until unpack_bucket waits on
        // the fence value signaled after these reads, and the slot is not
        // reused before that unpack (reader contract).
        unsafe {
            self.io.read_file(
                FileKind::TablePairs(self.table),
                IoBuf::from_raw(slot.pairs_raw.as_ptr(), rows * PAIR_ROW_SIZE),
            );
            if self.has_map() {
                self.io.read_file(
                    FileKind::TableMap(self.table),
                    IoBuf::from_raw(slot.map_raw.as_ptr(), rows * MAP_ROW_SIZE),
                );
            }
        }
        self.io.signal_fence(Arc::clone(&self.fence), bucket as u64 + 1);
        self.io.commit_commands();
    }

    #[allow(clippy::cast_possible_truncation)]
    fn unpack_bucket(
        &mut self,
        bucket: usize,
        pairs: &mut Vec<Pair>,
        map: &mut Vec<u64>,
    ) -> Result<usize> {
        assert!(bucket < self.next_bucket, "bucket was never loaded");
        self.fence.wait(bucket as u64 + 1);

        let rows = self.row_counts[bucket] as usize;
        let slot = &self.slots[bucket & 1];

        pairs.clear();
        pairs.reserve(rows);
        for row in slot.pairs_raw.as_slice()[..rows * PAIR_ROW_SIZE].chunks_exact(PAIR_ROW_SIZE) {
            let left = u32::from_le_bytes([row[0], row[1], row[2], row[3]]);
            let delta = u16::from_le_bytes([row[4], row[5]]);
            pairs.push(Pair {
                left,
                right: left + u32::from(delta),
            });
        }

        map.clear();
        if self.has_map() {
            map.reserve(rows);
            for row in slot.map_raw.as_slice()[..rows * MAP_ROW_SIZE].chunks_exact(MAP_ROW_SIZE) {
                map.push(u64::from_le_bytes(row.try_into().expect("chunk is 8 bytes")));
            }
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketCount, PlotMetadata, PruneConfig};
    use crate::io::mem::MemIoQueue;

    fn config_with_rows(rows_per_bucket: &[u64]) -> PruneConfig {
        let buckets = 128;
        let mut counts = vec![0u64; buckets];
        counts[..rows_per_bucket.len()].copy_from_slice(rows_per_bucket);
        let total: u64 = counts.iter().sum();
        let meta = PlotMetadata::new(
            [total; 7],
            std::array::from_fn(|_| counts.clone()),
            std::array::from_fn(|_| counts.clone()),
        );
        PruneConfig::new(BucketCount::B128, 1, 512, Arc::new(meta)).unwrap()
    }

    #[test]
    fn test_pair_codec_roundtrip() {
        let mut bytes = Vec::new();
        encode_pair(Pair { left: 70_000, right: 70_512 }, &mut bytes);
        assert_eq!(bytes.len(), PAIR_ROW_SIZE);
        let left = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let delta = u16::from_le_bytes([bytes[4], bytes[5]]);
        assert_eq!(left, 70_000);
        assert_eq!(u32::from(delta), 512);
    }

    #[test]
    fn test_double_buffered_stream_decodes_in_order() {
        let cfg = config_with_rows(&[2, 3]);
        let table = TableId::Table6;

        let mut pair_bytes = Vec::new();
        let mut map_bytes = Vec::new();
        let rows = [
            vec![Pair { left: 1, right: 2 }, Pair { left: 5, right: 5 }],
            vec![
                Pair { left: 0, right: 9 },
                Pair { left: 3, right: 4 },
                Pair { left: 7, right: 8 },
            ],
        ];
        let mut absolute = 0u64;
        for bucket_rows in &rows {
            for &pair in bucket_rows {
                encode_pair(pair, &mut pair_bytes);
                map_bytes.extend_from_slice(&absolute.to_le_bytes());
                absolute += 1;
            }
        }

        let io = Arc::new(MemIoQueue::new());
        io.preload(FileKind::TablePairs(table), pair_bytes);
        io.preload(FileKind::TableMap(table), map_bytes);

        let mut reader = PairAndMapReader::new(io, &cfg, table).unwrap();
        let mut pairs = Vec::new();
        let mut map = Vec::new();

        reader.load_next_bucket(); // prime
        reader.load_next_bucket();
        assert_eq!(reader.unpack_bucket(0, &mut pairs, &mut map).unwrap(), 2);
        assert_eq!(pairs, rows[0]);
        assert_eq!(map, vec![0, 1]);

        reader.load_next_bucket(); // past the end: no-op
        assert_eq!(reader.unpack_bucket(1, &mut pairs, &mut map).unwrap(), 3);
        assert_eq!(pairs, rows[1]);
        assert_eq!(map, vec![2, 3, 4]);
    }

    #[test]
    fn test_table7_has_no_map() {
        let cfg = config_with_rows(&[1]);
        let table = TableId::Table7;

        let mut pair_bytes = Vec::new();
        encode_pair(Pair { left: 4, right: 6 }, &mut pair_bytes);

        let io = Arc::new(MemIoQueue::new());
        io.preload(FileKind::TablePairs(table), pair_bytes);

        let mut reader = PairAndMapReader::new(io, &cfg, table).unwrap();
        let mut pairs = Vec::new();
        let mut map = vec![99u64];

        reader.load_next_bucket();
        assert_eq!(reader.unpack_bucket(0, &mut pairs, &mut map).unwrap(), 1);
        assert_eq!(pairs, vec![Pair { left: 4, right: 6 }]);
        assert!(map.is_empty());
    }
}
