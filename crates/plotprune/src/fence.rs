//! Counting completion fence for asynchronous I/O.
//!
//! A [`Fence`] is attached to a batch of queued I/O commands via
//! [`IoQueue::signal_fence`](crate::io::IoQueue::signal_fence). The I/O thread
//! signals it with a monotonically increasing value once everything queued
//! before it has completed; consumers block until the fence reaches the value
//! they depend on. The scheduler holds at most one outstanding fence value per
//! bitmap buffer and waits on it before the buffer's next reuse.

use parking_lot::{Condvar, Mutex};

/// A counting fence.
///
/// Values are expected to be signaled in increasing order; `signal` keeps the
/// maximum seen so a late wake-up never loses progress.
#[derive(Debug, Default)]
pub struct Fence {
    value: Mutex<u64>,
    cond: Condvar,
}

impl Fence {
    /// Creates a fence at value 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals completion up to `value`. Called from the I/O thread.
    pub fn signal(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
        }
        drop(current);
        self.cond.notify_all();
    }

    /// Blocks until the fence has been signaled with at least `value`.
    pub fn wait(&self, value: u64) {
        let mut current = self.value.lock();
        while *current < value {
            self.cond.wait(&mut current);
        }
    }

    /// Current fence value.
    #[must_use]
    pub fn value(&self) -> u64 {
        *self.value.lock()
    }
}
