//! Work distribution for accepted sockets
//!
//! `RoundRobin` decides who gets the next connection: the accepting
//! reactor itself or one of its handoff targets. It knows nothing about
//! how a socket travels; `HandoffTarget` implementations do that, either
//! by posting to a peer reactor in this process (`InProcessTarget`) or by
//! passing the descriptor over a unix channel (`PipeTarget`).

use crate::connection::{Connection, ConnectionContext};
use crate::net;
use std::fmt;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use tern_core::error::Result;
use tern_runtime::ReactorHandle;

/// Destination chosen for one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    /// Start it on the accepting reactor
    Local,
    /// Hand it to target `i`
    Remote(usize),
}

/// Rotates through the accepting reactor and every target
#[derive(Debug, Default, Clone)]
pub struct RoundRobin {
    index: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the destination for the next connection when `targets`
    /// remote destinations exist.
    pub fn next(&mut self, targets: usize) -> Choice {
        let slot = self.index % (targets + 1);
        self.index = (slot + 1) % (targets + 1);
        if slot == 0 {
            Choice::Local
        } else {
            Choice::Remote(slot - 1)
        }
    }

    /// Keep the rotation in range after target `removed` left.
    pub fn evicted(&mut self, removed: usize) {
        if self.index > removed + 1 {
            self.index -= 1;
        }
    }
}

/// Somewhere an accepted socket can be sent.
///
/// `hand_off` takes ownership; on error the socket has been closed.
pub trait HandoffTarget: Send {
    fn hand_off(&mut self, fd: OwnedFd) -> Result<()>;

    /// Whether an error from `hand_off` means this target is gone for good
    fn is_dead(&self, err: &tern_core::TernError) -> bool {
        net::is_disconnect(err)
    }

    fn describe(&self) -> String;
}

/// Peer reactor in the same process
pub struct InProcessTarget {
    reactor: ReactorHandle,
    ctx: Arc<ConnectionContext>,
}

impl InProcessTarget {
    pub fn new(reactor: ReactorHandle, ctx: Arc<ConnectionContext>) -> Self {
        Self { reactor, ctx }
    }
}

impl HandoffTarget for InProcessTarget {
    fn hand_off(&mut self, fd: OwnedFd) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        // A rejected post drops the closure and with it the socket.
        self.reactor.post(move |lp| {
            if let Err(e) = Connection::start(lp, fd, &ctx) {
                tracing::warn!(reactor = lp.id(), error = %e, "failed to start handed-off connection");
            }
        })
    }

    fn is_dead(&self, err: &tern_core::TernError) -> bool {
        matches!(err, tern_core::TernError::ReactorStopped | tern_core::TernError::ReactorFailed(_))
    }

    fn describe(&self) -> String {
        format!("reactor-{}", self.reactor.id())
    }
}

impl fmt::Debug for InProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessTarget")
            .field("reactor", &self.reactor.id())
            .finish()
    }
}

/// Secondary reached over a unix channel
#[derive(Debug)]
pub struct PipeTarget {
    channel: OwnedFd,
    sent: u64,
}

impl PipeTarget {
    pub fn new(channel: OwnedFd) -> Self {
        Self { channel, sent: 0 }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl HandoffTarget for PipeTarget {
    fn hand_off(&mut self, fd: OwnedFd) -> Result<()> {
        net::send_fd(self.channel.as_fd(), fd.as_fd())?;
        self.sent += 1;
        // The receiver holds its own duplicate now.
        drop(fd);
        Ok(())
    }

    fn describe(&self) -> String {
        use std::os::fd::AsRawFd;
        format!("pipe-fd-{}", self.channel.as_raw_fd())
    }
}

/// Rotation plus the targets it rotates over
#[derive(Default)]
pub struct Dispatcher {
    policy: RoundRobin,
    targets: Vec<Box<dyn HandoffTarget>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, target: Box<dyn HandoffTarget>) {
        tracing::debug!(target = %target.describe(), "dispatch target added");
        self.targets.push(target);
    }

    pub fn targets(&self) -> usize {
        self.targets.len()
    }

    /// Send `fd` to the next remote target, or give it back when the
    /// rotation says to keep it.
    pub fn route(&mut self, fd: OwnedFd) -> Option<OwnedFd> {
        let i = match self.policy.next(self.targets.len()) {
            Choice::Local => return Some(fd),
            Choice::Remote(i) => i,
        };
        let target = &mut self.targets[i];
        if let Err(e) = target.hand_off(fd) {
            tracing::warn!(target = %target.describe(), error = %e, "connection handoff failed");
            if target.is_dead(&e) {
                let gone = self.targets.remove(i);
                self.policy.evicted(i);
                tracing::info!(target = %gone.describe(), remaining = self.targets.len(), "dispatch target evicted");
            }
        }
        None
    }
}
