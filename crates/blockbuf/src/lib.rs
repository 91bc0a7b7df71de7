//! Page-aligned buffer allocation for direct-I/O staging and bitfield storage.
//!
//! Direct (unbuffered) disk transfers require their source and destination
//! buffers to be aligned to the storage block size. Every supported block size
//! (512 to 4096 bytes) divides the system page size, so buffers backed by whole
//! anonymous memory mappings satisfy the alignment requirement on every
//! platform. This crate provides [`AlignedBuf`], an owned, zero-initialized
//! buffer allocated straight from the OS with `mmap` (Unix) or `VirtualAlloc`
//! (Windows).

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// An owned, page-aligned, zero-initialized byte buffer.
///
/// The backing memory comes from an anonymous mapping and is released when the
/// buffer is dropped. Freshly mapped pages are zero-filled by the OS, so a new
/// `AlignedBuf` reads as all zeroes.
///
/// # Example
///
/// ```
/// use blockbuf::AlignedBuf;
///
/// let buf = AlignedBuf::zeroed(4096).unwrap();
/// assert_eq!(buf.len(), 4096);
/// assert!(buf.as_slice().iter().all(|&b| b == 0));
/// assert_eq!(buf.as_ptr() as usize % blockbuf::page_size(), 0);
/// ```
pub struct AlignedBuf {
    inner: os::MapInner,
    len: usize,
}

impl AlignedBuf {
    /// Allocates a zero-initialized buffer of `len` bytes aligned to the
    /// system page size.
    ///
    /// The underlying mapping is rounded up to whole pages; `len` is what the
    /// accessors report.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping cannot be created.
    pub fn zeroed(len: usize) -> io::Result<Self> {
        let page = page_size();
        let map_len = len.div_ceil(page).max(1) * page;
        // SAFETY: anonymous mapping of a freshly computed, non-zero length.
        let inner = unsafe { os::MapInner::map_anon(map_len)? };
        Ok(Self { inner, len })
    }

    /// Length of the buffer in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the start of the buffer.
    ///
    /// The mapping is inherently writable; the pointer is mutable even through
    /// a shared reference so callers layering their own synchronization on top
    /// (atomic word access, fence-guarded I/O) can do so without holding
    /// `&mut self`.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Immutable view of the buffer contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is live for the lifetime of self and covers len bytes.
        unsafe { std::slice::from_raw_parts(self.inner.ptr(), self.len) }
    }

    /// Mutable view of the buffer contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.inner.ptr(), self.len) }
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.inner.ptr())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{page_size, AlignedBuf};

    #[test]
    fn test_zeroed_contents_and_alignment() {
        let buf = AlignedBuf::zeroed(10_000).unwrap();
        assert_eq!(buf.len(), 10_000);
        assert_eq!(buf.as_ptr() as usize % page_size(), 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut buf = AlignedBuf::zeroed(4096).unwrap();
        buf.as_mut_slice()[0] = 0xAB;
        buf.as_mut_slice()[4095] = 0xCD;
        assert_eq!(buf.as_slice()[0], 0xAB);
        assert_eq!(buf.as_slice()[4095], 0xCD);
    }

    #[test]
    fn test_sub_page_allocation_rounds_up() {
        let buf = AlignedBuf::zeroed(1).unwrap();
        assert_eq!(buf.len(), 1);
    }
}
