//! The storage-collaborator boundary.
//!
//! The marking engine does not perform disk I/O itself; it queues commands
//! against an [`IoQueue`] and synchronizes with [`Fence`](crate::fence::Fence)
//! values. Commands accumulate locally and are only dispatched by
//! [`IoQueue::commit_commands`], so a read, its fence signal, and anything
//! batched with them land on the I/O thread as one unit.
//!
//! Two implementations ship here: [`disk::DiskIoQueue`], a background thread
//! draining a command channel against real files, and [`mem::MemIoQueue`], an
//! in-memory twin used by tests.

use std::sync::Arc;

use crate::config::TableId;
use crate::error::Result;
use crate::fence::Fence;

pub mod disk;
pub mod mem;

/// Identifies one logical file of the plot working set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// A table's delta-encoded pair rows.
    TablePairs(TableId),
    /// A table's per-row map values (physical bucket order to absolute index).
    TableMap(TableId),
    /// A table's persisted marking bitfield.
    Marks(TableId),
}

impl FileKind {
    /// Canonical base name for the file, without extension.
    #[must_use]
    pub fn name(self) -> String {
        match self {
            Self::TablePairs(t) => format!("t{t}"),
            Self::TableMap(t) => format!("map{t}"),
            Self::Marks(t) => format!("table_{t}_marks"),
        }
    }
}

/// Where a seek offset is measured from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekOrigin {
    /// Start of the file.
    Begin,
    /// Current cursor position.
    Current,
}

/// Options for [`IoQueue::init_file_set`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FileSetOptions {
    /// Request direct (unbuffered) transfers; buffers must then be aligned to
    /// the storage block size.
    pub direct_io: bool,
}

/// A raw destination buffer handed to the I/O thread for a read.
///
/// This is a non-owning view. The producer of the view promises the memory
/// stays alive and untouched until a fence queued after the read is signaled.
#[derive(Debug)]
pub struct IoBuf {
    ptr: *mut u8,
    len: usize,
}

impl IoBuf {
    /// Wraps a raw destination region.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `len` bytes, and the region must not
    /// be read, written, or freed by anyone else until a fence queued after
    /// the command using this buffer has been signaled.
    #[must_use]
    pub const unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length of the destination region.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mutable slice over the region.
    ///
    /// # Safety
    ///
    /// Caller must be the sole accessor of the region for the duration of the
    /// returned borrow (the I/O thread is, between dequeue and fence signal).
    pub(crate) unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

// SAFETY: the view crosses to the I/O thread only under the from_raw contract,
// which gives that thread exclusive access until the fence fires.
unsafe impl Send for IoBuf {}

/// A raw source buffer handed to the I/O thread for a write.
///
/// Same keep-alive contract as [`IoBuf`], read-only.
#[derive(Debug)]
pub struct IoBytes {
    ptr: *const u8,
    len: usize,
}

impl IoBytes {
    /// Wraps a raw source region.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes and the contents must not
    /// be mutated or freed until a fence queued after the command using this
    /// buffer has been signaled.
    #[must_use]
    pub const unsafe fn from_raw(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length of the source region.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slice over the region.
    ///
    /// # Safety
    ///
    /// Caller must uphold the `from_raw` contract for the borrow's duration.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

// SAFETY: see IoBuf.
unsafe impl Send for IoBytes {}

/// Asynchronous command queue of the storage collaborator.
///
/// All methods except [`init_file_set`](Self::init_file_set) only stage
/// commands; nothing reaches the I/O thread until
/// [`commit_commands`](Self::commit_commands). Commands execute strictly in
/// queue order, so a fence signaled after a read or write implies that
/// transfer has completed.
///
/// I/O failures on the queue's execution side are fatal to the run: the stage
/// attempts no partial-bitmap recovery.
pub trait IoQueue: Send + Sync {
    /// Registers (and creates if needed) the backing file for `file`.
    ///
    /// `file_count` is the number of physical files backing the logical file
    /// (always 1 for this stage's outputs).
    ///
    /// # Errors
    ///
    /// Any error opening or creating the backing file.
    fn init_file_set(
        &self,
        file: FileKind,
        name: &str,
        file_count: u32,
        options: FileSetOptions,
    ) -> Result<()>;

    /// Queues a cursor move on `file`.
    fn seek(&self, file: FileKind, origin: SeekOrigin, offset: i64);

    /// Queues an asynchronous read of `dst.len()` bytes at `file`'s cursor,
    /// advancing the cursor.
    ///
    /// # Safety
    ///
    /// `dst` must satisfy the [`IoBuf::from_raw`] keep-alive contract: the
    /// caller may not touch the region again until a fence queued after this
    /// command is signaled.
    unsafe fn read_file(&self, file: FileKind, dst: IoBuf);

    /// Queues an asynchronous write of `src.len()` bytes at `file`'s cursor,
    /// advancing the cursor.
    ///
    /// # Safety
    ///
    /// `src` must satisfy the [`IoBytes::from_raw`] keep-alive contract.
    unsafe fn write_file(&self, file: FileKind, src: IoBytes);

    /// Queues a fence signal: once every command queued before it has
    /// executed, `fence` is signaled with `value`.
    fn signal_fence(&self, fence: Arc<Fence>, value: u64);

    /// Dispatches all staged commands to the I/O thread.
    fn commit_commands(&self);
}
