//! Packed marking bitfield with word-exclusive concurrent writes.
//!
//! One bit per entry index of a table; bit *i* set means entry *i* is
//! reachable from a table-7 survivor. The same allocation doubles as the disk
//! write buffer, so it is block-aligned and sized to the rounded markfield
//! size up front.

use std::sync::atomic::{AtomicU64, Ordering};

use blockbuf::AlignedBuf;

use crate::error::Result;

/// A fixed-capacity, block-aligned bit vector over entry indices.
///
/// # Concurrency contract
///
/// [`get`](Self::get) is safe against any number of concurrent readers.
/// [`set`](Self::set) is deliberately a plain load/or/store on the containing
/// 64-bit word — not an atomic RMW — so it is safe against concurrent setters
/// **only when no two threads ever target bit indices inside the same word at
/// the same time**. The marking pass guarantees that with its
/// rows-per-thread floor and two-pass barrier split
/// (see [`min_safe_rows_per_thread`](crate::mark::min_safe_rows_per_thread));
/// nothing else may write concurrently.
pub struct PackedBitmap {
    buf: AlignedBuf,
    words: usize,
}

impl PackedBitmap {
    /// Allocates a zeroed bitmap of `byte_len` bytes (`byte_len * 8` bits).
    ///
    /// `byte_len` must be a multiple of 8 so storage is word-addressable; the
    /// markfield size always is, being a multiple of the storage block size.
    ///
    /// # Errors
    ///
    /// Allocation failure from the OS.
    ///
    /// # Panics
    ///
    /// If `byte_len` is not a multiple of 8.
    pub fn new(byte_len: usize) -> Result<Self> {
        assert_eq!(byte_len % 8, 0, "bitmap storage must be whole 64-bit words");
        let buf = AlignedBuf::zeroed(byte_len)?;
        Ok(Self {
            buf,
            words: byte_len / 8,
        })
    }

    /// Capacity in bits.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.words as u64 * 64
    }

    fn words(&self) -> &[AtomicU64] {
        // SAFETY: the buffer is page-aligned (so word-aligned), lives as long
        // as self, and spans words * 8 bytes. AtomicU64 shares u64's layout.
        unsafe {
            std::slice::from_raw_parts(self.buf.as_ptr().cast::<AtomicU64>(), self.words)
        }
    }

    /// Whether bit `index` is set. Safe against concurrent readers and
    /// against writers targeting other words.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn get(&self, index: u64) -> bool {
        debug_assert!(index < self.capacity());
        let word = (index / 64) as usize;
        let bit = index % 64;
        (self.words()[word].load(Ordering::Relaxed) >> bit) & 1 != 0
    }

    /// Sets bit `index` unconditionally.
    ///
    /// Word-level read-modify-write without atomicity across the pair of
    /// operations; see the type-level concurrency contract.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set(&self, index: u64) {
        debug_assert!(index < self.capacity());
        let word = (index / 64) as usize;
        let mask = 1u64 << (index % 64);
        let slot = &self.words()[word];
        let value = slot.load(Ordering::Relaxed);
        slot.store(value | mask, Ordering::Relaxed);
    }

    /// Clears `byte_len` bytes starting at `byte_offset`.
    ///
    /// Both arguments must be multiples of 8 so no two parallel zeroing
    /// slices straddle a word. Used to lazily zero only the region a table
    /// will actually write, in per-thread slices.
    ///
    /// # Panics
    ///
    /// On unaligned or out-of-range arguments.
    pub fn zero(&self, byte_offset: usize, byte_len: usize) {
        assert_eq!(byte_offset % 8, 0, "zero range must start on a word");
        assert_eq!(byte_len % 8, 0, "zero range must cover whole words");
        let start = byte_offset / 8;
        let end = start + byte_len / 8;
        for word in &self.words()[start..end] {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Raw bytes of the whole bitmap, for the disk write.
    ///
    /// Only meaningful once no marking round is in flight.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Number of set bits among the first `bit_len` bits.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn count_ones(&self, bit_len: u64) -> u64 {
        debug_assert!(bit_len <= self.capacity());
        let full_words = (bit_len / 64) as usize;
        let words = self.words();
        let mut total: u64 = 0;
        for word in &words[..full_words] {
            total += u64::from(word.load(Ordering::Relaxed).count_ones());
        }
        let tail_bits = bit_len % 64;
        if tail_bits != 0 {
            let mask = (1u64 << tail_bits) - 1;
            total += u64::from((words[full_words].load(Ordering::Relaxed) & mask).count_ones());
        }
        total
    }
}

impl std::fmt::Debug for PackedBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedBitmap")
            .field("bits", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::PackedBitmap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_get() {
        let bitmap = PackedBitmap::new(64).unwrap();
        assert!(!bitmap.get(0));
        assert!(!bitmap.get(511));

        bitmap.set(0);
        bitmap.set(63);
        bitmap.set(64);
        bitmap.set(511);

        assert!(bitmap.get(0));
        assert!(bitmap.get(63));
        assert!(bitmap.get(64));
        assert!(bitmap.get(511));
        assert!(!bitmap.get(1));
        assert_eq!(bitmap.count_ones(512), 4);
    }

    #[test]
    fn test_zero_range() {
        let bitmap = PackedBitmap::new(64).unwrap();
        for i in 0..512 {
            bitmap.set(i);
        }
        bitmap.zero(8, 16); // bits 64..192
        for i in 0..512 {
            assert_eq!(bitmap.get(i), !(64..192).contains(&i), "bit {i}");
        }
    }

    #[test]
    fn test_concurrent_word_disjoint_setters() {
        // Each thread owns a disjoint range of whole words.
        let bitmap = Arc::new(PackedBitmap::new(4096).unwrap());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let bitmap = Arc::clone(&bitmap);
            handles.push(thread::spawn(move || {
                let base = t * 8192;
                for i in 0..8192 {
                    bitmap.set(base + i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bitmap.count_ones(32_768), 32_768);
    }

    #[test]
    fn test_count_ones_tail_masking() {
        let bitmap = PackedBitmap::new(64).unwrap();
        bitmap.set(10);
        bitmap.set(70);
        assert_eq!(bitmap.count_ones(11), 1);
        assert_eq!(bitmap.count_ones(70), 1);
        assert_eq!(bitmap.count_ones(71), 2);
    }
}
