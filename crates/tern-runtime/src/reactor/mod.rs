//! # Reactors: single-threaded event loops
//!
//! Each reactor runs on a dedicated OS thread. It:
//! 1. Drains closures posted through its `ReactorHandle`, in FIFO order
//! 2. Blocks in `epoll_wait` (an eventfd wakes it when work is posted)
//! 3. Dispatches readiness to the `IoHandler` registered for each fd
//!
//! Every socket belongs to exactly one reactor and is only touched on
//! that reactor's thread. A failure that kills the loop (epoll error, a
//! handler panic) is recorded on the shared state; `post` and
//! `post_and_wait` check it first and fail fast instead of queueing work
//! nobody will run.

mod event_loop;
mod sys;

pub use event_loop::{EventLoop, IoHandler, Token};
pub use sys::{Interest, Readiness};

use crate::oneshot::{oneshot, Pending};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sys::EventFd;
use tern_core::error::{Result, TernError};

/// A closure run on the reactor thread
pub type Work = Box<dyn FnOnce(&mut EventLoop) + Send + 'static>;

/// How often `post_and_wait` re-checks for a fatal loop error
const FATAL_POLL: Duration = Duration::from_millis(50);

thread_local! {
    static CURRENT_REACTOR: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the reactor owning the calling thread, if any
#[inline]
pub fn current_reactor_id() -> Option<usize> {
    CURRENT_REACTOR.with(|c| c.get())
}

/// State shared between a reactor thread and its handles.
pub(crate) struct ReactorShared {
    id: usize,
    pub(crate) queue: SegQueue<Work>,
    pub(crate) waker: EventFd,
    fatal: Mutex<Option<TernError>>,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl ReactorShared {
    #[inline]
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Mark the loop finished. Posts racing this either see the flag or
    /// have their work drained by `close_all`.
    fn mark_exited(&self) {
        self.running.store(false, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Drop work nobody will run. Captured resolvers and write requests
    /// report the stop to their waiters as they drop.
    pub(crate) fn discard_queued(&self) -> usize {
        let mut dropped = 0;
        while let Some(work) = self.queue.pop() {
            drop(work);
            dropped += 1;
        }
        dropped
    }

    fn record_fatal(&self, err: TernError) {
        tracing::error!(reactor = self.id, error = %err, "reactor failed");
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

/// Cloneable handle for posting work onto a reactor
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    pub(crate) fn from_shared(shared: Arc<ReactorShared>) -> Self {
        Self { shared }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Whether the calling thread is this reactor's thread
    #[inline]
    pub fn is_current(&self) -> bool {
        current_reactor_id() == Some(self.shared.id)
    }

    /// The recorded fatal error, if the loop died
    pub fn fatal_error(&self) -> Option<TernError> {
        self.shared.fatal.lock().clone()
    }

    /// Fail fast if the loop is dead or stopped
    pub fn check(&self) -> Result<()> {
        if let Some(err) = self.fatal_error() {
            return Err(match err {
                TernError::ReactorFailed(_) => err,
                other => TernError::ReactorFailed(other.to_string()),
            });
        }
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(TernError::ReactorStopped);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Queue `work` to run on the reactor thread.
    ///
    /// Work posted to one reactor runs strictly in submission order.
    pub fn post(&self, work: impl FnOnce(&mut EventLoop) + Send + 'static) -> Result<()> {
        if let Err(e) = self.check() {
            self.discard_stranded();
            return Err(e);
        }
        self.shared.queue.push(Box::new(work));
        fence(Ordering::SeqCst);
        if !self.shared.running.load(Ordering::SeqCst) {
            // The loop exited after `check`; nothing will pop this.
            self.discard_stranded();
            return Err(self.check().err().unwrap_or(TernError::ReactorStopped));
        }
        self.shared.waker.notify()
    }

    fn discard_stranded(&self) {
        let dropped = self.shared.discard_queued();
        if dropped > 0 {
            tracing::debug!(reactor = self.shared.id, dropped, "discarded work posted during exit");
        }
    }

    /// Run `f` on the reactor thread and block for its result.
    ///
    /// Must not be called from the reactor's own thread.
    pub fn post_and_wait<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut EventLoop) -> R + Send + 'static,
    {
        if self.is_current() {
            return Err(TernError::Config("post_and_wait called on its own reactor thread"));
        }
        let (resolver, mut pending) = oneshot();
        self.post(move |lp| resolver.resolve(f(lp)))?;
        self.wait_checked(&mut pending)
    }

    fn wait_checked<R>(&self, pending: &mut Pending<R>) -> Result<R> {
        loop {
            if let Some(result) = pending.wait_timeout(FATAL_POLL) {
                return result.map_err(|_| self.check().err().unwrap_or(TernError::ReactorStopped));
            }
            self.check()?;
        }
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("id", &self.shared.id)
            .field("running", &self.is_running())
            .finish()
    }
}

/// An owned reactor thread
pub struct Reactor {
    handle: ReactorHandle,
    thread: Option<JoinHandle<()>>,
    exited: Pending<usize>,
}

impl Reactor {
    /// Create the loop and start its thread.
    pub fn start(id: usize) -> Result<Self> {
        let shared = Arc::new(ReactorShared {
            id,
            queue: SegQueue::new(),
            waker: EventFd::new()?,
            fatal: Mutex::new(None),
            running: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
        });
        let mut lp = EventLoop::new(id, Arc::clone(&shared))?;
        let (exit_tx, exited) = oneshot();
        let thread_shared = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name(format!("tern-reactor-{}", id))
            .spawn(move || {
                CURRENT_REACTOR.with(|c| c.set(Some(id)));
                tracing::debug!(reactor = id, "reactor started");

                match catch_unwind(AssertUnwindSafe(|| lp.run())) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => thread_shared.record_fatal(TernError::ReactorFailed(e.to_string())),
                    Err(panic) => thread_shared.record_fatal(TernError::ReactorFailed(panic_message(&panic))),
                }
                thread_shared.mark_exited();

                let closed = match catch_unwind(AssertUnwindSafe(|| lp.close_all())) {
                    Ok(n) => n,
                    Err(_) => {
                        tracing::error!(reactor = id, "panic while closing handles");
                        0
                    }
                };
                tracing::debug!(reactor = id, closed, "reactor stopped");
                exit_tx.resolve(closed);
            })?;

        Ok(Self {
            handle: ReactorHandle::from_shared(shared),
            thread: Some(thread),
            exited,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> usize {
        self.handle.id()
    }

    /// Close every registered handle and wait up to `timeout` for the
    /// thread to exit. On timeout the thread is left detached.
    pub fn stop(mut self, timeout: Duration) -> Result<()> {
        self.stop_inner(timeout)
    }

    fn stop_inner(&mut self, timeout: Duration) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.handle.shared.stop_requested.store(true, Ordering::Release);
        if let Err(e) = self.handle.shared.waker.notify() {
            tracing::warn!(reactor = self.id(), error = %e, "failed to wake reactor for stop");
        }
        match self.exited.wait_timeout(timeout) {
            Some(_) => {
                if thread.join().is_err() {
                    tracing::warn!(reactor = self.id(), "reactor thread panicked on exit");
                }
                match self.handle.fatal_error() {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            None => {
                tracing::warn!(reactor = self.id(), ?timeout, "reactor did not stop in time");
                Err(TernError::ReactorFailed("stop timed out".into()))
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Err(e) = self.stop_inner(Duration::from_secs(5)) {
            tracing::warn!(reactor = self.id(), error = %e, "reactor dropped with error");
        }
    }
}

/// A fixed set of reactors, indexed from 0
pub struct ReactorGroup {
    reactors: Vec<Reactor>,
}

impl ReactorGroup {
    /// Start `n` reactors. If any fails to start, the ones already running
    /// are stopped again.
    pub fn start(n: usize) -> Result<Self> {
        let mut reactors = Vec::with_capacity(n);
        for id in 0..n {
            reactors.push(Reactor::start(id)?);
        }
        tracing::info!(reactors = n, "reactor group started");
        Ok(Self { reactors })
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    pub fn handle(&self, id: usize) -> Option<ReactorHandle> {
        self.reactors.get(id).map(Reactor::handle)
    }

    pub fn handles(&self) -> Vec<ReactorHandle> {
        self.reactors.iter().map(Reactor::handle).collect()
    }

    /// Stop every reactor; returns the first error seen.
    pub fn stop(self, timeout: Duration) -> Result<()> {
        let mut first = None;
        for reactor in self.reactors {
            if let Err(e) = reactor.stop(timeout) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_post_runs_in_order() {
        let reactor = Reactor::start(0).unwrap();
        let handle = reactor.handle();
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            handle.post(move |_| tx.send(i).unwrap()).unwrap();
        }
        let got: Vec<i32> = (0..100).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        reactor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_post_and_wait_returns_value_on_reactor_thread() {
        let reactor = Reactor::start(3).unwrap();
        let handle = reactor.handle();
        assert!(!handle.is_current());
        let (id, on_loop) = handle
            .post_and_wait(|lp| (lp.id(), current_reactor_id()))
            .unwrap();
        assert_eq!(id, 3);
        assert_eq!(on_loop, Some(3));
        reactor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_fatal_error_fails_fast() {
        let reactor = Reactor::start(0).unwrap();
        let handle = reactor.handle();
        handle.post(|_| panic!("loop exploded")).unwrap();

        let err = handle.post_and_wait(|_| 1).unwrap_err();
        assert!(matches!(err, TernError::ReactorFailed(_)), "{:?}", err);
        assert!(handle.fatal_error().is_some());
        assert!(handle.post(|_| {}).is_err());
        assert!(reactor.stop(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_post_after_stop_is_rejected() {
        let reactor = Reactor::start(0).unwrap();
        let handle = reactor.handle();
        reactor.stop(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.post(|_| {}).unwrap_err(), TernError::ReactorStopped);
        assert_eq!(handle.post_and_wait(|_| ()).unwrap_err(), TernError::ReactorStopped);
    }

    #[test]
    fn test_work_stranded_by_exit_is_dropped() {
        let reactor = Reactor::start(0).unwrap();
        let handle = reactor.handle();
        reactor.stop(Duration::from_secs(5)).unwrap();

        // Work pushed between a passing check and the loop's final drain.
        let (resolver, stranded) = crate::oneshot::oneshot::<()>();
        handle.shared.queue.push(Box::new(move |_| resolver.resolve(())));

        assert_eq!(handle.post(|_| {}).unwrap_err(), TernError::ReactorStopped);
        assert!(handle.shared.queue.is_empty());
        assert!(stranded.wait().is_err());
    }

    #[test]
    fn test_posts_racing_stop_never_leak() {
        let reactor = Reactor::start(0).unwrap();
        let handle = reactor.handle();
        let marker = Arc::new(());
        let poster = {
            let handle = handle.clone();
            let marker = Arc::clone(&marker);
            thread::spawn(move || loop {
                let held = Arc::clone(&marker);
                if handle.post(move |_| drop(held)).is_err() {
                    break;
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        reactor.stop(Duration::from_secs(5)).unwrap();
        poster.join().unwrap();
        // Every closure either ran or was dropped; none sits in the queue.
        assert!(handle.shared.queue.is_empty());
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_group_handles() {
        let group = ReactorGroup::start(3).unwrap();
        assert_eq!(group.len(), 3);
        let ids: Vec<usize> = group
            .handles()
            .iter()
            .map(|h| h.post_and_wait(|lp| lp.id()).unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(group.handle(3).is_none());
        group.stop(Duration::from_secs(5)).unwrap();
    }
}
