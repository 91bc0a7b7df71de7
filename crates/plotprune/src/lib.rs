//! Backward-propagation mark-and-prune engine for disk-resident
//! proof-of-space tables.
//!
//! A plot holds seven tables of cryptographically derived entries; each row of
//! tables 2–7 is a pair of indices into the previous table. This crate
//! implements the stage that decides, for every entry of tables 2–6, whether
//! it is still referenced — directly or transitively — by a surviving entry of
//! table 7, and persists one packed bitmap per table recording that decision
//! so the following compaction stage can drop dead rows.
//!
//! Tables exceed memory, so each one streams through in buckets
//! ([`reader::PairAndMapReader`], double-buffered against the asynchronous
//! [`io::IoQueue`]). A fixed fork-join team ([`WorkerPool`]) marks each bucket
//! into a [`PackedBitmap`] under a word-exclusive partitioning discipline, and
//! the [`BackwardMarkScheduler`] walks the tables top-down, overlapping each
//! finished bitmap's disk write with the next table's compute.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use plotprune::{
//!     BackwardMarkScheduler, BucketCount, PlotMetadata, PruneConfig, WorkerPool,
//! };
//! use plotprune::io::disk::DiskIoQueue;
//!
//! # fn metadata_from_previous_stage() -> PlotMetadata { unimplemented!() }
//! # fn main() -> plotprune::Result<()> {
//! let meta = Arc::new(metadata_from_previous_stage());
//! let config = Arc::new(PruneConfig::new(BucketCount::B256, 8, 4096, meta)?);
//! let io = Arc::new(DiskIoQueue::new("/mnt/plot-tmp")?);
//!
//! let pool = WorkerPool::new(config.thread_count);
//! let scheduler = BackwardMarkScheduler::new(config, io)?;
//! let metrics = scheduler.run(&pool)?;
//! for table in &metrics.tables {
//!     println!("table {}: {:.2}% live", table.l_table, table.marked_fraction() * 100.0);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod fence;
pub mod io;
pub mod mark;
pub mod metrics;
pub mod reader;
pub mod scheduler;

pub use config::{BucketCount, PlotMetadata, PruneConfig, TableId};
pub use error::{Error, Result};
pub use mark::bitmap::PackedBitmap;
pub use mark::pool::WorkerPool;
pub use metrics::{PruneMetrics, TableMarkStats};
pub use scheduler::BackwardMarkScheduler;
