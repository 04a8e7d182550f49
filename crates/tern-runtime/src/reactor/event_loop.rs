//! The per-reactor event loop
//!
//! Owns the epoll instance and every registered handler. Only the reactor
//! thread ever touches an `EventLoop`; other threads reach it by posting
//! closures through a `ReactorHandle`.
//!
//! While a handler runs it is taken out of its registration slot, so a
//! handler can freely register, reconfigure, or deregister (itself
//! included) through the `&mut EventLoop` it is given.

use super::sys::{empty_events, Epoll, Interest, Readiness};
use super::{ReactorHandle, ReactorShared};
use std::any::Any;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use tern_core::error::{Result, TernError};

/// Identifies one registration on one loop. Never reused.
pub type Token = u64;

/// Reserved for the loop's own wakeup eventfd.
pub(crate) const WAKE_TOKEN: Token = 0;

const EVENT_BATCH: usize = 256;

/// Receives readiness for one registered fd.
///
/// The handler owns its fd. Dropping the handler closes it, which is how
/// the loop closes every socket on shutdown.
pub trait IoHandler: Send + 'static {
    fn ready(&mut self, lp: &mut EventLoop, token: Token, readiness: Readiness);

    /// Downcast support for `EventLoop::with_handler`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    handler: Option<Box<dyn IoHandler>>,
}

pub struct EventLoop {
    id: usize,
    epoll: Epoll,
    registrations: HashMap<Token, Registration>,
    next_token: Token,
    stopping: bool,
    shared: Arc<ReactorShared>,
}

impl EventLoop {
    pub(crate) fn new(id: usize, shared: Arc<ReactorShared>) -> Result<Self> {
        let epoll = Epoll::new()?;
        epoll.add(shared.waker.raw(), WAKE_TOKEN, Interest::READABLE)?;
        Ok(Self {
            id,
            epoll,
            registrations: HashMap::new(),
            next_token: WAKE_TOKEN + 1,
            stopping: false,
            shared,
        })
    }

    /// Index of the owning reactor
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Handle for posting back onto this loop
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle::from_shared(Arc::clone(&self.shared))
    }

    /// Number of live registrations
    pub fn registered(&self) -> usize {
        self.registrations.len()
    }

    /// Watch `fd` and route its readiness to `handler`.
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: Box<dyn IoHandler>,
    ) -> Result<Token> {
        if self.stopping {
            return Err(TernError::ReactorStopped);
        }
        let token = self.next_token;
        self.epoll.add(fd, token, interest)?;
        self.next_token += 1;
        self.registrations.insert(
            token,
            Registration {
                fd,
                interest,
                handler: Some(handler),
            },
        );
        Ok(token)
    }

    /// Change which readiness `token` is woken for
    pub fn set_interest(&mut self, token: Token, interest: Interest) -> Result<()> {
        let reg = self
            .registrations
            .get_mut(&token)
            .ok_or(TernError::ConnectionClosed)?;
        if reg.interest == interest {
            return Ok(());
        }
        self.epoll.modify(reg.fd, token, interest)?;
        reg.interest = interest;
        Ok(())
    }

    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.registrations.get(&token).map(|r| r.interest)
    }

    /// Stop watching `token` and hand back its handler.
    ///
    /// Returns `None` when called from inside that handler's own `ready`;
    /// the loop drops the handler once `ready` returns.
    pub fn deregister(&mut self, token: Token) -> Option<Box<dyn IoHandler>> {
        let reg = self.registrations.remove(&token)?;
        if let Err(e) = self.epoll.delete(reg.fd) {
            tracing::debug!(reactor = self.id, fd = reg.fd, error = %e, "epoll delete failed");
        }
        reg.handler
    }

    /// Run `f` against the concrete handler behind `token`.
    ///
    /// `None` if the token is unknown, the handler is currently running, or
    /// it is not an `H`.
    pub fn with_handler<H, R>(
        &mut self,
        token: Token,
        f: impl FnOnce(&mut H, &mut EventLoop) -> R,
    ) -> Option<R>
    where
        H: IoHandler,
    {
        let mut handler = self.registrations.get_mut(&token)?.handler.take()?;
        let result = handler.as_any_mut().downcast_mut::<H>().map(|h| f(h, self));
        self.restore(token, handler);
        result
    }

    /// Ask the loop to exit after the current turn.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    fn restore(&mut self, token: Token, handler: Box<dyn IoHandler>) {
        if let Some(reg) = self.registrations.get_mut(&token) {
            reg.handler = Some(handler);
        }
        // Otherwise it was deregistered meanwhile; dropping closes its fd.
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) {
        let handler = match self.registrations.get_mut(&token) {
            Some(reg) => reg.handler.take(),
            None => return,
        };
        if let Some(mut handler) = handler {
            handler.ready(self, token, readiness);
            self.restore(token, handler);
        }
    }

    fn run_posted(&mut self) {
        while let Some(work) = self.shared.queue.pop() {
            work(self);
        }
    }

    /// Reactor thread body. Returns when stopped or on a fatal error.
    pub(crate) fn run(&mut self) -> Result<()> {
        let mut events = empty_events(EVENT_BATCH);
        let mut ready = Vec::with_capacity(EVENT_BATCH);
        loop {
            // ── Step 1: posted work, strictly in submission order ──
            self.run_posted();
            if self.stopping || self.shared.stop_requested() {
                return Ok(());
            }

            // ── Step 2: wait for readiness ──
            match self.epoll.wait(&mut events, &mut ready, -1) {
                Ok(()) => {}
                Err(e) if e.errno() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e),
            }

            // ── Step 3: dispatch ──
            for &(token, readiness) in &ready {
                if token == WAKE_TOKEN {
                    self.shared.waker.drain();
                } else {
                    self.dispatch(token, readiness);
                }
            }
        }
    }

    /// Drop every handler, closing the fds they own.
    pub(crate) fn close_all(&mut self) -> usize {
        self.stopping = true;
        let tokens: Vec<Token> = self.registrations.keys().copied().collect();
        let count = tokens.len();
        for token in tokens {
            drop(self.deregister(token));
        }
        // Work posted after the last turn never runs; dropping it drops
        // any resolver inside so waiters see an error instead of hanging.
        self.shared.discard_queued();
        count
    }
}
