//! One-shot completion
//!
//! A `Resolver`/`Pending` pair carrying exactly one value. The waiting
//! side can block (`wait`, `wait_timeout`) or be polled as a `Future`.
//! Dropping the resolver unresolved completes the pending side with
//! `TernError::Aborted`.

use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tern_core::error::{Result, TernError};

enum State<T> {
    Empty,
    Ready(T),
    Taken,
    Abandoned,
}

struct Shared<T> {
    state: Mutex<(State<T>, Option<Waker>)>,
    cond: Condvar,
}

/// Completes the paired `Pending`
pub struct Resolver<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// Receives the value sent through the paired `Resolver`
pub struct Pending<T> {
    shared: Arc<Shared<T>>,
}

/// Create a connected pair
pub fn oneshot<T>() -> (Resolver<T>, Pending<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new((State::Empty, None)),
        cond: Condvar::new(),
    });
    (
        Resolver {
            shared: Some(Arc::clone(&shared)),
        },
        Pending { shared },
    )
}

impl<T> Resolver<T> {
    pub fn resolve(mut self, value: T) {
        if let Some(shared) = self.shared.take() {
            Self::finish(&shared, State::Ready(value));
        }
    }

    fn finish(shared: &Shared<T>, next: State<T>) {
        let waker = {
            let mut guard = shared.state.lock();
            guard.0 = next;
            guard.1.take()
        };
        shared.cond.notify_all();
        if let Some(w) = waker {
            w.wake();
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            Self::finish(&shared, State::Abandoned);
        }
    }
}

impl<T> Pending<T> {
    /// Take the value if it has arrived
    pub fn try_take(&mut self) -> Option<Result<T>> {
        let mut guard = self.shared.state.lock();
        Self::take_locked(&mut guard.0)
    }

    /// Block until the value arrives
    pub fn wait(self) -> Result<T> {
        let mut guard = self.shared.state.lock();
        loop {
            if let Some(r) = Self::take_locked(&mut guard.0) {
                return r;
            }
            self.shared.cond.wait(&mut guard);
        }
    }

    /// Block up to `timeout`; `None` if nothing arrived in time
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.state.lock();
        loop {
            if let Some(r) = Self::take_locked(&mut guard.0) {
                return Some(r);
            }
            if self.shared.cond.wait_until(&mut guard, deadline).timed_out() {
                return Self::take_locked(&mut guard.0);
            }
        }
    }

    fn take_locked(state: &mut State<T>) -> Option<Result<T>> {
        match std::mem::replace(state, State::Taken) {
            State::Ready(v) => Some(Ok(v)),
            State::Abandoned => {
                *state = State::Abandoned;
                Some(Err(TernError::Aborted))
            }
            State::Taken => Some(Err(TernError::Aborted)),
            State::Empty => {
                *state = State::Empty;
                None
            }
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.shared.state.lock();
        match Self::take_locked(&mut guard.0) {
            Some(r) => Poll::Ready(r),
            None => {
                guard.1 = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
