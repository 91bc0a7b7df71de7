//! The backward marking driver.
//!
//! Walks the referencing tables in strictly descending order — 7, 6, 5, 4,
//! 3 — and for each produces the marking bitmap of the table below it, so the
//! terminal state is five persisted bitmaps (tables 2 through 6). Table 7
//! needs no bitmap of its own (every entry counts), and table 1 is derived
//! from table 2's bitmap by the consuming compaction stage.
//!
//! Two bitmap buffers alternate roles: the one just finished becomes the next
//! pass's read-only "right" reference while the other is rebuilt as the new
//! "left" target. The disk write of a finished bitmap overlaps the next
//! table's compute; the buffer is only reclaimed two passes later, after its
//! write fence has fired.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, info_span};

use crate::config::{PruneConfig, TableId};
use crate::error::Result;
use crate::fence::Fence;
use crate::io::{FileKind, FileSetOptions, IoBytes, IoQueue, SeekOrigin};
use crate::mark::bitmap::PackedBitmap;
use crate::mark::pool::WorkerPool;
use crate::mark::{mark_bucket, MarkParams};
use crate::metrics::{PruneMetrics, TableMarkStats};
use crate::reader::{BucketReader, Pair, PairAndMapReader};

/// Referencing tables, in processing order.
const R_TABLES: [TableId; 5] = [
    TableId::Table7,
    TableId::Table6,
    TableId::Table5,
    TableId::Table4,
    TableId::Table3,
];

/// Drives the whole backward marking stage.
///
/// Owns both bitmap buffers; the worker pool borrows them for one bucket's
/// fork-join round at a time, never longer.
pub struct BackwardMarkScheduler {
    config: Arc<PruneConfig>,
    io: Arc<dyn IoQueue>,
}

impl BackwardMarkScheduler {
    /// Registers every file this stage touches — five marks outputs with
    /// direct I/O, plus the pair and map inputs — rewinds the inputs, and
    /// commits the batch.
    ///
    /// # Errors
    ///
    /// File registration failures from the storage collaborator.
    pub fn new(config: Arc<PruneConfig>, io: Arc<dyn IoQueue>) -> Result<Self> {
        for r_table in R_TABLES {
            let marks = FileKind::Marks(r_table.prev().expect("r-tables are all above table 1"));
            io.init_file_set(marks, &marks.name(), 1, FileSetOptions { direct_io: true })?;
        }
        for table in TableId::ALL {
            if table == TableId::Table1 {
                continue; // table 1 has no pair rows
            }
            let pairs = FileKind::TablePairs(table);
            io.init_file_set(pairs, &pairs.name(), 1, FileSetOptions::default())?;
            io.seek(pairs, SeekOrigin::Begin, 0);
            // Table 7's map is never read (no table references it) but it is
            // part of the handed-over working set; rewind it like the rest.
            let map = FileKind::TableMap(table);
            io.init_file_set(map, &map.name(), 1, FileSetOptions::default())?;
            io.seek(map, SeekOrigin::Begin, 0);
        }
        io.commit_commands();
        Ok(Self { config, io })
    }

    /// Runs the full stage: five marking passes, five persisted bitmaps.
    ///
    /// # Errors
    ///
    /// Allocation or I/O failures; marking-invariant violations abort instead.
    pub fn run(&self, pool: &WorkerPool) -> Result<PruneMetrics> {
        let markfield_size = self.config.markfield_size();
        let bitmaps = [
            PackedBitmap::new(markfield_size)?,
            PackedBitmap::new(markfield_size)?,
        ];
        // Roles by index: bitmaps[left] is the write target, bitmaps[right]
        // the finalized reference. Swapped after every pass.
        let mut left = 0usize;
        let mut right = 1usize;

        let write_fence = Arc::new(Fence::new());
        let mut writes_issued = 0u64;
        let mut metrics = PruneMetrics::default();

        for r_table in R_TABLES {
            let l_table = r_table.prev().expect("r-tables are all above table 1");
            let span = info_span!("mark_table", r_table = r_table.number()).entered();
            let started = Instant::now();

            let mut reader = PairAndMapReader::new(Arc::clone(&self.io), &self.config, r_table)?;
            let right_bitmap = if r_table == TableId::Table7 {
                None // every table-7 entry is a survivor
            } else {
                Some(&bitmaps[right])
            };
            self.mark_table(pool, r_table, &mut reader, &bitmaps[left], right_bitmap)?;

            // The buffer written two passes ago is about to become the next
            // pass's reference; make sure its write has finished before a new
            // one is issued. First pass has nothing outstanding.
            if writes_issued > 0 {
                let wait_started = Instant::now();
                write_fence.wait(writes_issued);
                let waited = wait_started.elapsed();
                if !waited.is_zero() {
                    debug!(waited_ms = waited.as_millis() as u64, "bitmap write fence wait");
                }
                metrics.write_wait += waited;
            }

            // Persist the finished left bitmap and fence it.
            // SAFETY: the bitmap buffer outlives the run and is not mutated
            // again until the fence two passes ahead has been waited on.
            unsafe {
                self.io.write_file(
                    FileKind::Marks(l_table),
                    IoBytes::from_raw(bitmaps[left].as_bytes().as_ptr(), markfield_size),
                );
            }
            writes_issued += 1;
            self.io.signal_fence(Arc::clone(&write_fence), writes_issued);
            self.io.commit_commands();

            let l_entry_count = self.config.meta.entry_count(l_table);
            let marked = bitmaps[left].count_ones(l_entry_count);
            let stats = TableMarkStats {
                r_table,
                l_table,
                l_entry_count,
                marked,
                elapsed: started.elapsed(),
            };
            info!(
                l_table = l_table.number(),
                marked,
                l_entry_count,
                fraction = stats.marked_fraction(),
                elapsed_ms = stats.elapsed.as_millis() as u64,
                "table marked"
            );
            metrics.tables.push(stats);

            // The bitmap just written becomes the next pass's reference.
            std::mem::swap(&mut left, &mut right);
            drop(span);
        }

        // Buffers are released on return; the last write must land first.
        write_fence.wait(writes_issued);
        Ok(metrics)
    }

    /// Streams every bucket of `r_table` through the worker pool, in index
    /// order, accumulating the left table's per-bucket entry counts into the
    /// running offset.
    fn mark_table<R: BucketReader>(
        &self,
        pool: &WorkerPool,
        r_table: TableId,
        reader: &mut R,
        left: &PackedBitmap,
        right: Option<&PackedBitmap>,
    ) -> Result<()> {
        let meta = &self.config.meta;
        let l_table = r_table.prev().expect("r-tables are all above table 1");
        let l_entry_count = meta.entry_count(l_table);
        let right_entry_count = meta.entry_count(r_table);
        let l_bucket_counts = meta.bucket_counts(l_table);

        let mut pairs: Vec<Pair> = Vec::new();
        let mut map: Vec<u64> = Vec::new();
        let mut left_offset = 0u64;

        reader.load_next_bucket();
        for bucket in 0..self.config.buckets.get() {
            reader.load_next_bucket();
            let rows = reader.unpack_bucket(bucket, &mut pairs, &mut map)? as u64;

            let params = MarkParams {
                table: r_table,
                bucket,
                rows,
                pairs: &pairs,
                map: &map,
                left,
                right,
                right_entry_count,
                left_offset,
                left_entry_count: l_entry_count,
            };
            pool.run(|ctx| mark_bucket(ctx, &params));

            left_offset += l_bucket_counts[bucket];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketCount, PlotMetadata};
    use crate::io::mem::MemIoQueue;

    fn uniform_config() -> Arc<PruneConfig> {
        let buckets = 128usize;
        let counts = vec![8u64; buckets];
        let meta = PlotMetadata::new(
            [8 * buckets as u64; 7],
            std::array::from_fn(|_| counts.clone()),
            std::array::from_fn(|_| counts.clone()),
        );
        Arc::new(PruneConfig::new(BucketCount::B128, 1, 64, Arc::new(meta)).unwrap())
    }

    #[test]
    fn test_new_registers_whole_working_set() {
        let io = Arc::new(MemIoQueue::new());
        let _scheduler =
            BackwardMarkScheduler::new(uniform_config(), Arc::clone(&io) as Arc<dyn IoQueue>)
                .unwrap();

        // Pair and map files for every table above table 1 — table 7's map
        // included, even though no pass reads it.
        for table in TableId::ALL {
            if table == TableId::Table1 {
                assert!(io.contents(FileKind::TablePairs(table)).is_none());
                assert!(io.contents(FileKind::TableMap(table)).is_none());
                continue;
            }
            assert!(io.contents(FileKind::TablePairs(table)).is_some(), "pairs {table}");
            assert!(io.contents(FileKind::TableMap(table)).is_some(), "map {table}");
        }
        // One marks output per table 2..=6, none for tables 1 and 7.
        for r_table in R_TABLES {
            let l_table = r_table.prev().unwrap();
            assert!(io.contents(FileKind::Marks(l_table)).is_some(), "marks {l_table}");
        }
        assert!(io.contents(FileKind::Marks(TableId::Table7)).is_none());
        assert!(io.contents(FileKind::Marks(TableId::Table1)).is_none());
    }
}
