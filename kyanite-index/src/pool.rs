//! # Worker Pool
//!
//! Bounded FIFO of closures drained by a fixed set of worker threads.
//! Used by the snapshot writer to fan out one task per graph node.
//!
//! Shutdown (on drop) lets the workers drain every queued task before
//! joining them; enqueuing on a stopped pool fails with `PoolStopped`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use kyanite_core::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    stop: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    condvar: Condvar,
}

/// Fixed-size thread pool with a shared FIFO task queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState { queue: VecDeque::new(), stop: false }),
            condvar: Condvar::new(),
        });

        let workers = (0..size.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(shared))
            })
            .collect();

        Self { shared, workers }
    }

    /// Pool sized to the hardware: `max(2, available parallelism)`.
    pub fn with_default_size() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::new(parallelism.max(2))
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting new work. Tasks already queued still run; the
    /// workers are joined when the pool drops.
    pub fn shutdown(&self) {
        self.shared.state.lock().stop = true;
        self.shared.condvar.notify_all();
    }

    /// Enqueue a task. Fails once shutdown has begun.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.stop {
                return Err(Error::PoolStopped);
            }
            state.queue.push_back(Box::new(job));
        }
        self.shared.condvar.notify_one();
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.condvar.notify_all();
        for worker in std::mem::take(&mut self.workers) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                // Drain remaining work before honoring the stop flag.
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.stop {
                    return;
                }
                shared.condvar.wait(&mut state);
            }
        };
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_all_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(4);
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
            // Drop waits for the queue to drain.
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_default_size_floor() {
        let pool = WorkerPool::with_default_size();
        assert!(pool.size() >= 2);
    }

    #[test]
    fn test_enqueue_after_shutdown_fails() {
        let pool = WorkerPool::new(2);
        pool.shutdown();
        let err = pool.execute(|| {}).unwrap_err();
        assert_eq!(err.error_code(), "POOL_STOPPED");
    }

    #[test]
    fn test_single_worker_preserves_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let pool = WorkerPool::new(1);
            for i in 0..10 {
                let order = Arc::clone(&order);
                pool.execute(move || order.lock().push(i)).unwrap();
            }
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }
}
