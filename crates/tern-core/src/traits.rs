//! Scheduling seam
//!
//! Completion of a receive buffer never runs the waiting continuation on
//! the reactor thread; it hands it to a `Schedule` implementation instead.
//! `tern-runtime::WorkerPool` is the default implementation.

use std::sync::Arc;

/// A unit of deferred work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs off the calling thread
pub trait Schedule: Send + Sync {
    /// Queue `job` for execution on some other thread.
    ///
    /// Must not run `job` inline.
    fn schedule(&self, job: Job);
}

impl<S: Schedule + ?Sized> Schedule for Arc<S> {
    #[inline]
    fn schedule(&self, job: Job) {
        (**self).schedule(job)
    }
}

/// Spawns one OS thread per job.
///
/// Correct but slow; used where no pool is available (tests, tools).
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPerJob;

impl Schedule for ThreadPerJob {
    fn schedule(&self, job: Job) {
        if let Err(e) = std::thread::Builder::new()
            .name("tern-job".into())
            .spawn(job)
        {
            tracing::error!(error = %e, "failed to spawn job thread");
        }
    }
}
