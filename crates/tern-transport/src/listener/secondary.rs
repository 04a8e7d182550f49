//! Secondary side of the dispatch channel
//!
//! A secondary connects to the primary's unix socket, writes the pipe
//! token, then waits for handed-off sockets. Each message carries the
//! placeholder payload plus one descriptor, which becomes a `Connection`
//! on the secondary's reactor.

use crate::connection::{Connection, ConnectionContext};
use crate::net;
use std::any::Any;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use tern_core::constants::PIPE_TOKEN_LEN;
use tern_core::error::Result;
use tern_runtime::{EventLoop, Interest, IoHandler, Readiness, Token};

pub struct SecondaryListener {
    channel: OwnedFd,
    ctx: Arc<ConnectionContext>,
    received: u64,
}

impl SecondaryListener {
    /// Connect to the primary at `path`, present `token` and start
    /// receiving on `lp`.
    pub fn connect(
        lp: &mut EventLoop,
        path: &Path,
        token: &[u8; PIPE_TOKEN_LEN],
        ctx: Arc<ConnectionContext>,
    ) -> Result<Token> {
        let channel = net::unix_connect(path)?;
        net::write_all(channel.as_fd(), token)?;
        net::set_nonblocking(channel.as_fd())?;
        let raw = channel.as_raw_fd();
        let secondary = SecondaryListener {
            channel,
            ctx,
            received: 0,
        };
        let registered = lp.register(raw, Interest::READABLE, Box::new(secondary))?;
        tracing::info!(reactor = lp.id(), path = %path.display(), "secondary connected to primary");
        Ok(registered)
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

impl IoHandler for SecondaryListener {
    fn ready(&mut self, lp: &mut EventLoop, token: Token, _readiness: Readiness) {
        let mut fds = Vec::new();
        loop {
            match net::recv_fds(self.channel.as_fd(), &mut fds) {
                Ok(0) if fds.is_empty() => {
                    tracing::info!(reactor = lp.id(), received = self.received, "primary closed dispatch pipe");
                    lp.deregister(token);
                    return;
                }
                Ok(_) => {
                    for fd in fds.drain(..) {
                        self.received += 1;
                        if let Err(e) = Connection::start(lp, fd, &self.ctx) {
                            tracing::warn!(reactor = lp.id(), error = %e, "failed to start handed-off connection");
                        }
                    }
                }
                Err(e) if e.is_would_block() => return,
                Err(e) if e.errno() == Some(libc::EINTR) => continue,
                Err(e) => {
                    // Descriptors that did arrive close with `fds`.
                    tracing::warn!(reactor = lp.id(), error = %e, "handoff receive failed");
                    lp.deregister(token);
                    return;
                }
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
