//! Statistics gathered over one marking run.

use std::time::Duration;

use crate::config::TableId;

/// Outcome of one table's marking pass.
#[derive(Debug, Clone, Copy)]
pub struct TableMarkStats {
    /// The referencing table that was scanned.
    pub r_table: TableId,
    /// The table whose bitmap was produced.
    pub l_table: TableId,
    /// Entry count of the marked table.
    pub l_entry_count: u64,
    /// Entries found reachable from a table-7 survivor.
    pub marked: u64,
    /// Wall time of the pass, bucket streaming included.
    pub elapsed: Duration,
}

impl TableMarkStats {
    /// Fraction of the marked table's entries that survive pruning.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn marked_fraction(&self) -> f64 {
        if self.l_entry_count == 0 {
            0.0
        } else {
            self.marked as f64 / self.l_entry_count as f64
        }
    }
}

/// Run-wide metrics of the backward marking stage.
#[derive(Debug, Clone, Default)]
pub struct PruneMetrics {
    /// Per-table stats in processing order (table 7's pass first).
    pub tables: Vec<TableMarkStats>,
    /// Total time spent waiting on bitmap-write fences; nonzero values mean
    /// the disk could not hide a write behind one table's compute.
    pub write_wait: Duration,
}
