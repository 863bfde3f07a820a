//! Fork-join worker pool.
//!
//! Callers push a batch of jobs and then block in [`ThreadPool::wait_until_done`]
//! until every job has run. There is no ordering between jobs of a batch, so
//! the numeric kernels hand each job a disjoint `&mut` slice of the output.
//! [`ThreadPool::scope`] is the borrowing front end used by those kernels.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

const FALLBACK_WORKERS: usize = 8;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// `None` uses the hardware concurrency.
    pub workers: Option<usize>,
}

impl PoolConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: Some(workers),
        }
    }

    fn resolve(&self) -> usize {
        match self.workers {
            Some(n) if n > 0 => n,
            _ => thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(FALLBACK_WORKERS),
        }
    }
}

struct Queue {
    jobs: VecDeque<Job>,
    terminate: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    jobs_available: Condvar,
    remaining: AtomicUsize,
    done: Mutex<()>,
    all_done: Condvar,
    /// Panics of jobs pushed outside a scope, until taken.
    panicked: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Jobs never run while a pool lock is held, so a poisoned lock still
    // guards consistent state.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn finish_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _done = lock(&self.done);
            self.all_done.notify_all();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.terminate {
                    return;
                }
                queue = shared
                    .jobs_available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("thread pool job panicked");
            shared.panicked.fetch_add(1, Ordering::SeqCst);
        }
        shared.finish_one();
    }
}

/// A fixed set of worker threads draining one shared job queue.
///
/// The pool is an ordinary value: construct it, share it through an `Arc`
/// with the layers that need it, and it stops when dropped. Workers are
/// spawned by [`ThreadPool::start`] or lazily by the first pushed job.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    terminate: false,
                }),
                jobs_available: Condvar::new(),
                remaining: AtomicUsize::new(0),
                done: Mutex::new(()),
                all_done: Condvar::new(),
                panicked: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
            size: config.resolve(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.workers).is_empty()
    }

    /// Spawns the workers. Idempotent while the pool is running.
    pub fn start(&self) -> std::io::Result<()> {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return Ok(());
        }
        lock(&self.shared.queue).terminate = false;
        for index in 0..self.size {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("forkgrad-worker-{index}"))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }
        debug!(workers = self.size, "thread pool started");
        Ok(())
    }

    /// Lets queued jobs drain, then joins every worker.
    pub fn stop(&self) {
        let mut workers = lock(&self.workers);
        if workers.is_empty() {
            return;
        }
        lock(&self.shared.queue).terminate = true;
        self.shared.jobs_available.notify_all();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        debug!("thread pool stopped");
    }

    pub fn push<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_boxed(Box::new(job));
    }

    fn push_boxed(&self, job: Job) {
        if let Err(err) = self.start() {
            error!(%err, "could not spawn pool workers, running job inline");
            job();
            return;
        }
        {
            let mut queue = lock(&self.shared.queue);
            queue.jobs.push_back(job);
            self.shared.remaining.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.jobs_available.notify_one();
    }

    /// Blocks the calling thread until no pushed job is left unfinished.
    pub fn wait_until_done(&self) {
        let mut done = lock(&self.shared.done);
        while self.shared.remaining.load(Ordering::SeqCst) != 0 {
            done = self
                .shared
                .all_done
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of panicked [`ThreadPool::push`] jobs since the last call.
    /// Panics of scoped jobs are not counted here; the scope re-raises them.
    pub fn take_panicked(&self) -> usize {
        self.shared.panicked.swap(0, Ordering::SeqCst)
    }

    /// Runs `f`, letting it push jobs that borrow from the caller's stack,
    /// and returns only after all of them finished.
    ///
    /// # Panics
    ///
    /// Re-raises in the caller if any job pushed through this scope panicked.
    pub fn scope<'env, F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Scope<'_, 'env>) -> R,
    {
        let scope = Scope {
            pool: self,
            panicked: Arc::new(AtomicBool::new(false)),
            _env: PhantomData,
        };
        let result = {
            let _wait = WaitOnDrop(self);
            f(&scope)
        };
        if scope.panicked.load(Ordering::SeqCst) {
            panic!("a thread pool job panicked");
        }
        result
    }

    /// Items per job when `items` are spread evenly over the workers.
    pub fn chunk_len(&self, items: usize) -> usize {
        items.div_ceil(self.size).max(1)
    }

    /// Splits `data` into runs of whole rows, one run per job, and calls
    /// `f(first_row, run)` for each run in parallel.
    pub fn for_each_rows<T, F>(&self, data: &mut [T], row_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync,
    {
        if data.is_empty() || row_len == 0 {
            return;
        }
        let rows_per_job = self.chunk_len(data.len() / row_len);
        let f = &f;
        self.scope(|s| {
            for (i, run) in data.chunks_mut(rows_per_job * row_len).enumerate() {
                s.push(move || f(i * rows_per_job, run));
            }
        });
    }

    /// Like [`ThreadPool::for_each_rows`] over two buffers sharing a row
    /// count, e.g. a kernel gradient and its per-channel bias gradient.
    pub fn for_each_rows_zip<A, B, F>(
        &self,
        a: &mut [A],
        a_row_len: usize,
        b: &mut [B],
        b_row_len: usize,
        f: F,
    ) where
        A: Send,
        B: Send,
        F: Fn(usize, &mut [A], &mut [B]) + Sync,
    {
        if a.is_empty() || a_row_len == 0 || b_row_len == 0 {
            return;
        }
        let rows_per_job = self.chunk_len(a.len() / a_row_len);
        let f = &f;
        self.scope(|s| {
            let runs = a
                .chunks_mut(rows_per_job * a_row_len)
                .zip(b.chunks_mut(rows_per_job * b_row_len));
            for (i, (run_a, run_b)) in runs.enumerate() {
                s.push(move || f(i * rows_per_job, run_a, run_b));
            }
        });
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WaitOnDrop<'a>(&'a ThreadPool);

impl Drop for WaitOnDrop<'_> {
    fn drop(&mut self) {
        self.0.wait_until_done();
    }
}

/// Handle for pushing borrowing jobs inside [`ThreadPool::scope`].
pub struct Scope<'pool, 'env> {
    pool: &'pool ThreadPool,
    panicked: Arc<AtomicBool>,
    _env: PhantomData<&'env mut &'env ()>,
}

impl<'env> Scope<'_, 'env> {
    pub fn push<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'env,
    {
        let panicked = Arc::clone(&self.panicked);
        let job: Box<dyn FnOnce() + Send + 'env> = Box::new(move || {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                panicked.store(true, Ordering::SeqCst);
            }
        });
        // SAFETY: `ThreadPool::scope` does not return, normally or by
        // unwinding, before `wait_until_done` observed every pushed job
        // finish, so data borrowed for 'env outlives each job.
        let job: Job = unsafe { std::mem::transmute::<Box<dyn FnOnce() + Send + 'env>, Job>(job) };
        self.pool.push_boxed(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn pool(workers: usize) -> ThreadPool {
        ThreadPool::new(&PoolConfig::with_workers(workers))
    }

    #[test]
    fn counts_every_job_exactly_once() {
        let pool = pool(4);
        for n in [0usize, 1, 1000] {
            for _ in 0..5 {
                let counter = Arc::new(AtomicUsize::new(0));
                for _ in 0..n {
                    let counter = Arc::clone(&counter);
                    pool.push(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
                pool.wait_until_done();
                assert_eq!(counter.load(Ordering::SeqCst), n);
            }
        }
    }

    #[test]
    fn wait_without_jobs_returns_immediately() {
        let pool = pool(2);
        pool.wait_until_done();
        assert!(!pool.is_running());
    }

    #[test]
    fn scoped_jobs_write_disjoint_runs() {
        let pool = pool(3);
        let mut data = vec![0u64; 1001];
        pool.for_each_rows(&mut data, 1, |first, run| {
            for (i, v) in run.iter_mut().enumerate() {
                *v = (first + i) as u64 * 2;
            }
        });
        assert!(data.iter().enumerate().all(|(i, &v)| v == i as u64 * 2));
    }

    #[test]
    fn zipped_runs_stay_aligned() {
        let pool = pool(4);
        let mut rows = vec![0usize; 7 * 3];
        let mut heads = vec![0usize; 7];
        pool.for_each_rows_zip(&mut rows, 3, &mut heads, 1, |first, run, head| {
            for (r, h) in head.iter_mut().enumerate() {
                *h = first + r;
                run[r * 3..(r + 1) * 3].fill(first + r);
            }
        });
        assert_eq!(heads, (0..7).collect::<Vec<_>>());
        assert!(rows.chunks(3).enumerate().all(|(i, row)| row.iter().all(|&v| v == i)));
    }

    #[test]
    fn scope_borrows_shared_input() {
        let pool = pool(4);
        let input: Vec<u64> = (0..100).collect();
        let total = AtomicU64::new(0);
        pool.scope(|s| {
            for chunk in input.chunks(7) {
                let total = &total;
                s.push(move || {
                    total.fetch_add(chunk.iter().sum::<u64>(), Ordering::SeqCst);
                });
            }
        });
        assert_eq!(total.load(Ordering::SeqCst), 4950);
    }

    #[test]
    fn job_panic_surfaces_in_caller() {
        let pool = pool(2);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.scope(|s| {
                s.push(|| panic!("boom"));
                s.push(|| {});
            })
        }));
        assert!(outcome.is_err());
        // the pool keeps working afterwards
        let hits = AtomicUsize::new(0);
        pool.scope(|s| {
            s.push(|| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unscoped_panic_does_not_leak_into_a_scope() {
        let pool = pool(2);
        pool.push(|| panic!("detached"));
        pool.wait_until_done();

        let mut data = [0u8; 8];
        pool.for_each_rows(&mut data, 1, |first, run| {
            for (i, v) in run.iter_mut().enumerate() {
                *v = (first + i) as u8;
            }
        });
        assert_eq!(data, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(pool.take_panicked(), 1);
        assert_eq!(pool.take_panicked(), 0);
    }

    #[test]
    fn panicking_scope_body_waits_for_borrowing_jobs() {
        let pool = pool(3);
        let mut data = vec![0u32; 12];
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.scope(|s| {
                for (i, run) in data.chunks_mut(4).enumerate() {
                    s.push(move || {
                        thread::sleep(std::time::Duration::from_millis(20));
                        run.fill(i as u32 + 1);
                    });
                }
                panic!("scope body failed");
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(data, [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
        assert_eq!(pool.take_panicked(), 0);
    }

    #[test]
    fn stop_then_restart_on_next_push() {
        let pool = pool(2);
        pool.start().unwrap();
        assert!(pool.is_running());
        pool.stop();
        assert!(!pool.is_running());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.push(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait_until_done();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
