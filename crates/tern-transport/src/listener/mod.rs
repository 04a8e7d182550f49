//! Listener family
//!
//! A `Listener` owns the public endpoint on one reactor. Each accepted
//! socket goes through its `Dispatcher`: either it starts locally or it is
//! handed to another reactor.
//!
//! ```text
//!                  accept
//!   public port ───────────▶ Listener (reactor 0)
//!                               │ RoundRobin
//!              ┌────────────────┼─────────────────┐
//!              ▼                ▼                 ▼
//!          Connection      InProcessTarget     PipeTarget ──SCM_RIGHTS──▶ SecondaryListener
//!          (local)         (post to peer)                                  (reactor N)
//! ```
//!
//! `primary` adds the unix channel secondaries connect to; `secondary` is
//! the receiving end of that channel.

pub mod dispatch;
pub mod primary;
pub mod secondary;

pub use dispatch::{Choice, Dispatcher, HandoffTarget, InProcessTarget, PipeTarget, RoundRobin};
pub use primary::PipeAcceptor;
pub use secondary::SecondaryListener;

use crate::connection::{Connection, ConnectionContext};
use crate::net;
use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use tern_core::error::Result;
use tern_runtime::{EventLoop, Interest, IoHandler, Readiness, Token};

/// Accepting socket for the public endpoint
pub struct Listener {
    fd: OwnedFd,
    addr: SocketAddr,
    ctx: Arc<ConnectionContext>,
    dispatcher: Dispatcher,
    accepted: u64,
}

impl Listener {
    /// Bind `addr` and start accepting on `lp`. Must run on `lp`'s thread.
    pub fn bind(
        lp: &mut EventLoop,
        addr: SocketAddr,
        backlog: i32,
        ctx: Arc<ConnectionContext>,
        dispatcher: Dispatcher,
    ) -> Result<(Token, SocketAddr)> {
        let fd = net::tcp_listen(addr, backlog)?;
        let addr = net::local_addr(fd.as_fd())?;
        let raw = fd.as_raw_fd();
        let listener = Listener {
            fd,
            addr,
            ctx,
            dispatcher,
            accepted: 0,
        };
        let token = lp.register(raw, Interest::READABLE, Box::new(listener))?;
        tracing::info!(reactor = lp.id(), %addr, backlog, "listening");
        Ok((token, addr))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn add_target(&mut self, target: Box<dyn HandoffTarget>) {
        self.dispatcher.add(target);
    }

    pub fn targets(&self) -> usize {
        self.dispatcher.targets()
    }

    fn dispatch(&mut self, lp: &mut EventLoop, fd: OwnedFd) {
        self.accepted += 1;
        if let Some(fd) = self.dispatcher.route(fd) {
            if let Err(e) = Connection::start(lp, fd, &self.ctx) {
                tracing::warn!(reactor = lp.id(), error = %e, "failed to start connection");
            }
        }
    }
}

impl IoHandler for Listener {
    fn ready(&mut self, lp: &mut EventLoop, _token: Token, _readiness: Readiness) {
        loop {
            match net::accept(self.fd.as_fd()) {
                Ok(Some(fd)) => self.dispatch(lp, fd),
                Ok(None) => break,
                Err(e) if e.errno() == Some(libc::EINTR) => continue,
                Err(e) => {
                    // ECONNABORTED, EMFILE and friends: try again on the next wakeup.
                    tracing::warn!(addr = %self.addr, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
