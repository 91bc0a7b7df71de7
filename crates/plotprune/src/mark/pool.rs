//! Fixed-size fork-join worker pool with in-round barriers.
//!
//! Marking work is dispatched in synchronous fork-join rounds — one round per
//! bucket — with the calling thread participating as worker 0. There is no
//! task queue and no suspension inside a round except at the explicit barrier
//! points ([`JobCtx::sync`]) and the implicit end-of-round barrier.

use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};

type Job = Arc<dyn Fn(&JobCtx) + Send + Sync>;

/// Per-round view handed to each participating thread.
pub struct JobCtx<'a> {
    id: usize,
    count: usize,
    barrier: &'a Barrier,
}

impl JobCtx<'_> {
    /// This thread's id, `0..thread_count`.
    #[must_use]
    pub const fn thread_id(&self) -> usize {
        self.id
    }

    /// Number of threads in the round (the full pool, always).
    #[must_use]
    pub const fn thread_count(&self) -> usize {
        self.count
    }

    /// Blocks until every thread in the round reaches this point.
    ///
    /// Every thread of the pool must make the same sequence of `sync` calls
    /// within one job, or the round deadlocks.
    pub fn sync(&self) {
        self.barrier.wait();
    }

    /// Equal split of `total` items: this thread's `(offset, count, end)`.
    /// Items left over by the integer division go to the last thread.
    #[must_use]
    pub fn thread_offsets(&self, total: u64) -> (u64, u64, u64) {
        let per = total / self.count as u64;
        let offset = per * self.id as u64;
        let count = if self.id == self.count - 1 {
            total - offset
        } else {
            per
        };
        (offset, count, offset + count)
    }
}

/// A fixed team of threads running fork-join rounds.
///
/// The pool is created once per run and reused for every bucket of every
/// table. Jobs borrow their environment only for the duration of one round:
/// [`run`](Self::run) does not return until every thread has finished the job,
/// which is what makes the internal lifetime erasure sound.
pub struct WorkerPool {
    thread_count: usize,
    barrier: Arc<Barrier>,
    senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns a pool of `thread_count` threads (minimum 1; the caller counts
    /// as the first).
    #[must_use]
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        let barrier = Arc::new(Barrier::new(thread_count));
        let mut senders = Vec::with_capacity(thread_count - 1);
        let mut handles = Vec::with_capacity(thread_count - 1);
        for id in 1..thread_count {
            let (tx, rx) = channel::unbounded::<Job>();
            let shared_barrier = Arc::clone(&barrier);
            let handle = std::thread::Builder::new()
                .name(format!("plotprune-mark-{id}"))
                .spawn(move || {
                    let ctx = JobCtx {
                        id,
                        count: thread_count,
                        barrier: &shared_barrier,
                    };
                    for job in &rx {
                        // A panic here is a fatal invariant violation; abort
                        // instead of leaving the rest of the team at a
                        // barrier that will never release.
                        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(&ctx)))
                            .is_err()
                        {
                            std::process::abort();
                        }
                        // End-of-round barrier, paired with the one in run().
                        ctx.barrier.wait();
                    }
                })
                .expect("failed to spawn marking worker");
            senders.push(tx);
            handles.push(handle);
        }
        Self {
            thread_count,
            barrier,
            senders,
            handles,
        }
    }

    /// Number of threads in the pool.
    #[must_use]
    pub const fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Runs one fork-join round: every pool thread (the caller included, as
    /// worker 0) executes `job` with its own [`JobCtx`]. Returns once all of
    /// them have finished.
    pub fn run<F>(&self, job: F)
    where
        F: Fn(&JobCtx) + Send + Sync,
    {
        let job: Arc<dyn Fn(&JobCtx) + Send + Sync + '_> = Arc::new(job);
        // SAFETY: only the lifetime bound is erased; trait and auto traits are
        // identical. Every clone handed to a worker is consumed before the
        // end-of-round barrier below releases this frame, so the borrowed
        // environment outlives all uses.
        let job: Job = unsafe {
            std::mem::transmute::<Arc<dyn Fn(&JobCtx) + Send + Sync + '_>, Job>(job)
        };
        for sender in &self.senders {
            assert!(
                sender.send(Arc::clone(&job)).is_ok(),
                "marking worker terminated mid-run"
            );
        }
        let ctx = JobCtx {
            id: 0,
            count: self.thread_count,
            barrier: &self.barrier,
        };
        job(&ctx);
        drop(job);
        self.barrier.wait();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.senders.clear();
        if std::thread::panicking() {
            // Workers may be parked at a round barrier the panicking caller
            // never reached; joining would hang the unwind.
            return;
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[test]
    fn test_thread_offsets_remainder_to_last() {
        let pool = WorkerPool::new(4);
        let mut seen = vec![(0u64, 0u64); 4];
        let results: Vec<_> = {
            let collected = std::sync::Mutex::new(vec![(0u64, 0u64, 0u64); 4]);
            pool.run(|ctx| {
                let split = ctx.thread_offsets(10);
                collected.lock().unwrap()[ctx.thread_id()] = split;
            });
            collected.into_inner().unwrap()
        };
        for (i, (offset, count, end)) in results.iter().enumerate() {
            seen[i] = (*offset, *count);
            assert_eq!(offset + count, *end);
        }
        assert_eq!(seen, vec![(0, 2), (2, 2), (4, 2), (6, 4)]);
    }

    #[test]
    fn test_fork_join_runs_every_thread() {
        let pool = WorkerPool::new(4);
        let counter = AtomicUsize::new(0);
        pool.run(|_ctx| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(counter.load(Ordering::Relaxed), 4);

        // Pool is reusable for the next round.
        pool.run(|_ctx| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_sync_orders_phases() {
        // Every thread publishes before the barrier; after the barrier each
        // must observe all publications.
        let pool = WorkerPool::new(4);
        let published = AtomicU64::new(0);
        pool.run(|ctx| {
            published.fetch_or(1 << ctx.thread_id(), Ordering::SeqCst);
            ctx.sync();
            assert_eq!(published.load(Ordering::SeqCst), 0b1111);
        });
    }

    #[test]
    fn test_single_thread_pool() {
        let pool = WorkerPool::new(1);
        let counter = AtomicUsize::new(0);
        pool.run(|ctx| {
            assert_eq!(ctx.thread_count(), 1);
            ctx.sync(); // barrier of one must not block
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
