//! Single-slot completion cell
//!
//! Three states packed into one atomic pointer:
//!
//! ```text
//!   null            idle       no waiter, nothing ready
//!   COMPLETED       completed  data or a terminal condition is ready
//!   anything else   armed      a boxed continuation is waiting
//! ```
//!
//! Transitions are single CAS/swap operations, so the producer never takes
//! a lock to find out whether somebody is waiting. Arming an already armed
//! cell is reported back to the caller instead of overwriting the prior
//! continuation.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;
use tern_core::traits::Job;

/// Address used as the "completed" marker. Never dereferenced.
static COMPLETED_MARKER: u8 = 0;

#[inline]
fn completed() -> *mut Job {
    &COMPLETED_MARKER as *const u8 as *mut Job
}

/// Identifies one armed continuation for `CompletionCell::disarm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmToken(usize);

/// Result of `CompletionCell::arm`
pub enum ArmOutcome {
    /// Stored; it will be handed back by `complete` or `disarm`
    Armed(ArmToken),
    /// The cell was already completed; run the continuation now
    Ready(Job),
    /// Another continuation was already armed. The cell is now completed
    /// and both continuations are handed back.
    Conflict { new: Job, prior: Job },
}

pub struct CompletionCell {
    state: AtomicPtr<Job>,
}

impl CompletionCell {
    pub const fn new() -> Self {
        Self {
            state: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == completed()
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        let p = self.state.load(Ordering::Acquire);
        !p.is_null() && p != completed()
    }

    /// Move to completed; returns the armed continuation, if any.
    pub fn complete(&self) -> Option<Job> {
        let prior = self.state.swap(completed(), Ordering::AcqRel);
        Self::take(prior)
    }

    /// Register `continuation` to run on the next `complete`.
    pub fn arm(&self, continuation: Job) -> ArmOutcome {
        let boxed = Box::into_raw(Box::new(continuation));
        loop {
            match self.state.compare_exchange(
                std::ptr::null_mut(),
                boxed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ArmOutcome::Armed(ArmToken(boxed as usize)),
                Err(current) if current == completed() => {
                    // Safety: `boxed` was never published.
                    let job = unsafe { *Box::from_raw(boxed) };
                    return ArmOutcome::Ready(job);
                }
                Err(current) => {
                    // Armed twice: steal the prior one and mark completed.
                    if self
                        .state
                        .compare_exchange(current, completed(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let new = unsafe { *Box::from_raw(boxed) };
                        let prior = unsafe { *Box::from_raw(current) };
                        return ArmOutcome::Conflict { new, prior };
                    }
                    // Lost a race with `complete`/`reset`; look again.
                }
            }
        }
    }

    /// Armed back to idle, if the continuation behind `token` is still the
    /// one waiting. It is handed back unrun.
    pub fn disarm(&self, token: ArmToken) -> Option<Job> {
        let ptr = token.0 as *mut Job;
        match self
            .state
            .compare_exchange(ptr, std::ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(prior) => Self::take(prior),
            Err(_) => None,
        }
    }

    /// Completed back to idle. An armed continuation is left alone.
    pub fn reset(&self) -> bool {
        self.state
            .compare_exchange(completed(), std::ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take(ptr: *mut Job) -> Option<Job> {
        if ptr.is_null() || ptr == completed() {
            None
        } else {
            // Safety: only `arm` publishes non-marker pointers, and every
            // path that removes one from the cell takes it exactly once.
            Some(unsafe { *Box::from_raw(ptr) })
        }
    }
}

impl Default for CompletionCell {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompletionCell {
    fn drop(&mut self) {
        let ptr = std::mem::replace(self.state.get_mut(), std::ptr::null_mut());
        drop(Self::take(ptr));
    }
}

/// Set/reset signal that synchronous waiters block on
#[derive(Default)]
pub struct ManualResetEvent {
    set: Mutex<bool>,
    cond: Condvar,
}

impl ManualResetEvent {
    pub fn new(initial: bool) -> Self {
        Self {
            set: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// `false` if the timeout elapsed first
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                return *set;
            }
        }
        true
    }
}
