//! The per-bucket marking algorithm and its data structures.
//!
//! One fork-join round marks one bucket: every thread of the pool takes a
//! contiguous slice of the bucket's rows and sets, in the left table's
//! bitmap, the bits of both entries each relevant row references. Safety of
//! the concurrent bit writes rests entirely on the partitioning rules
//! enforced here; see [`min_safe_rows_per_thread`].

use tracing::trace;

use crate::config::TableId;
use crate::mark::bitmap::PackedBitmap;
use crate::mark::pool::JobCtx;
use crate::reader::Pair;

pub mod bitmap;
pub mod pool;

/// Minimum rows a thread must own before another thread is activated.
///
/// [`PackedBitmap::set`] is a plain word-level read-modify-write, so two
/// threads must never be mid-mutation on the same 64-bit word. Consecutive
/// rows of a bucket reference entries clustered around the same left-table
/// region (matching groups span roughly 236 entries, under 4 words); giving
/// each active thread at least 896 rows keeps every thread's index span a
/// dozen-plus words wide, so only *adjacent* threads can ever share a word —
/// and the two-pass split in [`mark_bucket`] keeps adjacent threads out of
/// their boundary region at the same time.
#[must_use]
pub const fn min_safe_rows_per_thread() -> u64 {
    896
}

/// Inputs for marking one bucket of the referencing table.
///
/// Borrowed by the worker threads for the duration of a single fork-join
/// round; nothing here is retained across rounds.
pub struct MarkParams<'a> {
    /// The referencing (right) table being scanned.
    pub table: TableId,
    /// Bucket index within the table, `0..B`.
    pub bucket: usize,
    /// Referencing-row count of this bucket.
    pub rows: u64,
    /// Decoded pair rows, bucket-relative.
    pub pairs: &'a [Pair],
    /// Map rows resolving bucket order to absolute right-table indices.
    /// Empty for table 7.
    pub map: &'a [u64],
    /// Bitmap being built for the left table (write target).
    pub left: &'a PackedBitmap,
    /// Finalized bitmap of the right table; `None` for table 7, whose rows
    /// all count.
    pub right: Option<&'a PackedBitmap>,
    /// Entry count of the right table (bounds the map values).
    pub right_entry_count: u64,
    /// Sum of the left table's row counts over all preceding buckets.
    pub left_offset: u64,
    /// Entry count of the left table (bounds the resolved indices).
    pub left_entry_count: u64,
}

/// Marks one bucket's rows into the left bitmap. Must be called from inside a
/// [`WorkerPool::run`](crate::mark::pool::WorkerPool::run) round, by every
/// thread of the pool.
///
/// On bucket 0 the live region of the left bitmap is zeroed first, in
/// per-thread slices, with a barrier before any bit is set. Rows are then
/// partitioned subject to the [`min_safe_rows_per_thread`] floor (threads
/// beyond the floor-constrained count idle for this bucket but still take
/// part in every barrier), and each active thread walks its range in two
/// halves around a full-team barrier so adjacent threads are never mutating
/// their shared boundary word at the same instant.
///
/// # Panics
///
/// If a map value or resolved entry index falls outside the owning table's
/// entry count — a fatal mismatch between the upstream stage and the
/// bucket-count metadata, not a recoverable condition.
#[allow(clippy::cast_possible_truncation)]
pub fn mark_bucket(ctx: &JobCtx<'_>, params: &MarkParams<'_>) {
    debug_assert_eq!(params.pairs.len() as u64, params.rows);
    debug_assert!(params.right.is_none() || params.map.len() as u64 == params.rows);

    if params.bucket == 0 {
        // Lazily zero only the region this table will write, split across
        // the team in whole words. The barrier keeps any set() away from a
        // slice another thread is still clearing.
        let field_words = params.left_entry_count.div_ceil(8).div_ceil(8);
        let (word_offset, word_count, _) = ctx.thread_offsets(field_words);
        if word_count > 0 {
            params
                .left
                .zero(word_offset as usize * 8, word_count as usize * 8);
        }
        ctx.sync();
    }

    // Shrink the active team until each thread clears the rows floor; the
    // remaining threads idle for this bucket (a tiny bucket runs on one
    // thread alone).
    let mut active = ctx.thread_count() as u64;
    let mut per_thread = params.rows / active;
    while per_thread < min_safe_rows_per_thread() && active > 1 {
        active -= 1;
        per_thread = params.rows / active;
    }

    let id = ctx.thread_id() as u64;
    if id < active {
        let start = per_thread * id;
        let count = if id == active - 1 {
            // Rows left over by the integer division go to the last thread.
            params.rows - start
        } else {
            per_thread
        };

        // Two passes split at this thread's own midpoint: all first halves,
        // barrier, all second halves. A thread's first rows can share a word
        // with the previous thread's last rows; the barrier keeps those two
        // mutations apart in time.
        let mid = start + count / 2;
        mark_rows(params, start, mid);
        ctx.sync();
        mark_rows(params, mid, start + count);
    } else {
        ctx.sync();
    }

    if ctx.thread_id() == 0 {
        trace!(
            table = params.table.number(),
            bucket = params.bucket,
            rows = params.rows,
            active,
            "bucket marked"
        );
    }
}

#[allow(clippy::cast_possible_truncation)]
fn mark_rows(params: &MarkParams<'_>, start: u64, end: u64) {
    for i in start..end {
        if let Some(right) = params.right {
            let right_index = params.map[i as usize];
            assert!(
                right_index < params.right_entry_count,
                "map value {right_index} out of range for table {} (bucket {})",
                params.table,
                params.bucket,
            );
            if !right.get(right_index) {
                continue;
            }
        }

        let pair = params.pairs[i as usize];
        let left = params.left_offset + u64::from(pair.left);
        let right = params.left_offset + u64::from(pair.right);
        assert!(
            left < params.left_entry_count && right < params.left_entry_count,
            "pair ({left}, {right}) out of range for table {} (bucket {})",
            params.table,
            params.bucket,
        );
        params.left.set(left);
        params.left.set(right);
    }
}
