//! Worker pool lifecycle.
//!
//! A `WorkerPool` is a dedicated rayon thread pool created once per batch run
//! and released exactly once. `shutdown` is the normal release path; `Drop`
//! releases a pool that was never shut down (for example while unwinding) and
//! does nothing after `shutdown`.

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("A worker pool needs at least one worker.")]
    NoWorkers,
    #[error("Failed to start the worker pool: {0}")]
    Build(#[from] ThreadPoolBuildError),
}

/// One fewer than the logical CPU count, and never less than one.
pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

pub struct WorkerPool {
    pool: Option<ThreadPool>,
    workers: usize,
    exited: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        let exited = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exited);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("multifit-worker-{i}"))
            .exit_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()?;
        log::info!("Started worker pool with {workers} workers.");
        Ok(Self {
            pool: Some(pool),
            workers,
            exited,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `op` inside the pool, so rayon parallel iterators in `op` use its
    /// workers.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Number of worker threads that have exited so far.
    pub fn exited_workers(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.exited)
    }

    /// Releases the pool. Returns the number of workers released.
    pub fn shutdown(mut self) -> usize {
        self.release()
    }

    fn release(&mut self) -> usize {
        match self.pool.take() {
            Some(pool) => {
                drop(pool);
                log::info!("Released worker pool ({} workers).", self.workers);
                self.workers
            }
            None => 0,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.pool.is_some() {
            log::warn!("Worker pool dropped without an explicit shutdown; releasing it now.");
            self.release();
        }
    }
}
