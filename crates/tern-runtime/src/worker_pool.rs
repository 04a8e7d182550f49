//! `WorkerPool`: the default `Schedule` implementation
//!
//! Spawns N OS threads at creation. Jobs go onto a lock-free MPMC queue;
//! the submitting thread unparks one worker round-robin. Idle workers
//! park with a short timeout so a missed unpark only costs latency.
//!
//! Receive-buffer continuations run here, never on a reactor thread.

use crossbeam_queue::SegQueue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;
use tern_core::error::{Result, TernError};
use tern_core::traits::{Job, Schedule};

const IDLE_PARK: Duration = Duration::from_millis(10);

/// Shared state between submitters and workers.
struct PoolInner {
    queue: SegQueue<Job>,
    /// Workers currently running a job.
    active: AtomicUsize,
    /// Jobs that panicked.
    panicked: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    threads: Vec<Thread>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    next_wake: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool with `n` workers (at least one).
    pub fn new(n: usize) -> Result<Self> {
        Self::spawn_with(n, |worker_id, inner| {
            thread::Builder::new()
                .name(format!("tern-worker-{}", worker_id))
                .spawn(move || worker_loop(inner, worker_id))
        })
    }

    /// Start workers through `spawn`. If one fails to start, the workers
    /// already running are stopped and joined before the error returns.
    fn spawn_with<F>(n: usize, mut spawn: F) -> Result<Self>
    where
        F: FnMut(usize, Arc<PoolInner>) -> std::io::Result<JoinHandle<()>>,
    {
        let n = n.max(1);
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            active: AtomicUsize::new(0),
            panicked: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            match spawn(worker_id, Arc::clone(&inner)) {
                Ok(h) => handles.push(h),
                Err(e) => {
                    tracing::error!(worker = worker_id, error = %e, "failed to spawn worker");
                    inner_shutdown(&inner, &handles);
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(TernError::from(e));
                }
            }
        }
        let threads = handles.iter().map(|h| h.thread().clone()).collect();
        tracing::debug!(workers = n, "worker pool started");

        Ok(Self {
            inner,
            threads,
            handles: parking_lot::Mutex::new(handles),
            next_wake: AtomicUsize::new(0),
        })
    }

    pub fn total_workers(&self) -> usize {
        self.threads.len()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Jobs that panicked since start
    pub fn panicked(&self) -> usize {
        self.inner.panicked.load(Ordering::Relaxed)
    }

    /// Stop accepting work, run what is queued, join the workers.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        inner_shutdown(&self.inner, &handles);
        let current = thread::current().id();
        for h in handles {
            // A job may shut the pool down from a worker thread.
            if h.thread().id() == current {
                continue;
            }
            if h.join().is_err() {
                tracing::warn!("worker thread exited by panic");
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

impl Schedule for WorkerPool {
    fn schedule(&self, job: Job) {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            // Late continuations still have to run; a detached thread
            // keeps shutdown from losing a wakeup.
            tern_core::ThreadPerJob.schedule(job);
            return;
        }
        self.inner.queue.push(job);
        let idx = self.next_wake.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[idx].unpark();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn inner_shutdown(inner: &PoolInner, handles: &[JoinHandle<()>]) {
    inner.shutdown.store(true, Ordering::SeqCst);
    for h in handles {
        h.thread().unpark();
    }
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    loop {
        match inner.queue.pop() {
            Some(job) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    inner.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(worker = worker_id, "continuation panicked");
                }
                inner.active.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                thread::park_timeout(IDLE_PARK);
            }
        }
    }
}
