//! Primary side of the dispatch channel
//!
//! The primary binds a unix socket next to its public listener. Each
//! secondary connects and writes the 16-byte pipe token; once the token
//! matches, the channel joins the listener's rotation as a `PipeTarget`.
//! A channel presenting the wrong token is closed.

use super::dispatch::PipeTarget;
use super::Listener;
use crate::net;
use std::any::Any;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use tern_core::constants::PIPE_TOKEN_LEN;
use tern_core::error::{Result, TernError};
use tern_runtime::{EventLoop, Interest, IoHandler, Readiness, Token};

/// Accepts secondary channels on the unix socket
pub struct PipeAcceptor {
    fd: OwnedFd,
    path: PathBuf,
    listener: Token,
    token: [u8; PIPE_TOKEN_LEN],
}

impl PipeAcceptor {
    /// Bind `path` on `lp`; verified channels are added to the `Listener`
    /// registered as `listener` on the same loop.
    pub fn bind(lp: &mut EventLoop, path: &Path, listener: Token, token: [u8; PIPE_TOKEN_LEN]) -> Result<Token> {
        let fd = net::unix_listen(path)?;
        let raw = fd.as_raw_fd();
        let acceptor = PipeAcceptor {
            fd,
            path: path.to_path_buf(),
            listener,
            token,
        };
        let token = lp.register(raw, Interest::READABLE, Box::new(acceptor))?;
        tracing::info!(reactor = lp.id(), path = %path.display(), "dispatch pipe listening");
        Ok(token)
    }
}

impl IoHandler for PipeAcceptor {
    fn ready(&mut self, lp: &mut EventLoop, _token: Token, _readiness: Readiness) {
        loop {
            match net::accept(self.fd.as_fd()) {
                Ok(Some(fd)) => {
                    let raw = fd.as_raw_fd();
                    let handshake = Handshake {
                        fd: Some(fd),
                        listener: self.listener,
                        expected: self.token,
                        got: Vec::with_capacity(PIPE_TOKEN_LEN),
                    };
                    if let Err(e) = lp.register(raw, Interest::READABLE, Box::new(handshake)) {
                        tracing::warn!(error = %e, "failed to watch dispatch pipe");
                    }
                }
                Ok(None) => break,
                Err(e) if e.errno() == Some(libc::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "pipe accept failed");
                    break;
                }
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for PipeAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One channel waiting for its token
struct Handshake {
    fd: Option<OwnedFd>,
    listener: Token,
    expected: [u8; PIPE_TOKEN_LEN],
    got: Vec<u8>,
}

enum Step {
    Pending,
    Verified(OwnedFd),
    Rejected(TernError),
}

impl Handshake {
    fn read(&mut self) -> Step {
        let Some(fd) = self.fd.as_ref() else {
            return Step::Rejected(TernError::ConnectionClosed);
        };
        let mut buf = [0u8; PIPE_TOKEN_LEN];
        let want = PIPE_TOKEN_LEN - self.got.len();
        match unsafe { net::recv_raw(fd.as_fd(), buf.as_mut_ptr(), want) } {
            Ok(0) => return Step::Rejected(TernError::ConnectionClosed),
            Ok(n) => self.got.extend_from_slice(&buf[..n]),
            Err(e) if e.is_would_block() || e.errno() == Some(libc::EINTR) => return Step::Pending,
            Err(e) => return Step::Rejected(e),
        }
        if self.got.len() < PIPE_TOKEN_LEN {
            return Step::Pending;
        }
        if self.got != self.expected {
            return Step::Rejected(TernError::InvalidHandshake);
        }
        match self.fd.take() {
            Some(fd) => Step::Verified(fd),
            None => Step::Rejected(TernError::ConnectionClosed),
        }
    }
}

impl IoHandler for Handshake {
    fn ready(&mut self, lp: &mut EventLoop, token: Token, _readiness: Readiness) {
        match self.read() {
            Step::Pending => {}
            Step::Verified(fd) => {
                lp.deregister(token);
                let added = lp.with_handler::<Listener, _>(self.listener, move |listener, _| {
                    listener.add_target(Box::new(PipeTarget::new(fd)));
                    listener.targets()
                });
                match added {
                    Some(targets) => tracing::info!(targets, "secondary joined dispatch rotation"),
                    None => tracing::warn!("listener gone; dropping verified dispatch pipe"),
                }
            }
            Step::Rejected(e) => {
                tracing::warn!(error = %e, "dispatch pipe rejected");
                lp.deregister(token);
                self.fd = None;
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionContext, ConnectionIo, FrameFactory};
    use crate::date_header::DateHeaderValueManager;
    use crate::listener::Dispatcher;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tern_core::ThreadPerJob;
    use tern_runtime::{MemoryPool, Reactor, ReactorHandle};

    struct Ignore;

    impl FrameFactory for Ignore {
        fn start(&self, _io: ConnectionIo) {}
    }

    fn pipe_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tern-primary-{}-{}.sock", tag, std::process::id()))
    }

    fn setup(path: &Path, token: [u8; PIPE_TOKEN_LEN]) -> (Reactor, Token) {
        let reactor = Reactor::start(0).unwrap();
        let ctx = Arc::new(ConnectionContext::new(
            MemoryPool::new(),
            Arc::new(ThreadPerJob),
            Arc::new(Ignore),
            Arc::new(DateHeaderValueManager::new()),
        ));
        let path = path.to_path_buf();
        let listener = reactor
            .handle()
            .post_and_wait(move |lp| {
                let (listener, _) =
                    Listener::bind(lp, "127.0.0.1:0".parse().unwrap(), 8, ctx, Dispatcher::new())?;
                PipeAcceptor::bind(lp, &path, listener, token)?;
                Ok::<_, TernError>(listener)
            })
            .unwrap()
            .unwrap();
        (reactor, listener)
    }

    fn targets(handle: &ReactorHandle, listener: Token) -> usize {
        handle
            .post_and_wait(move |lp| lp.with_handler::<Listener, _>(listener, |l, _| l.targets()))
            .unwrap()
            .unwrap_or(0)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_matching_token_joins_rotation() {
        let path = pipe_path("ok");
        let token = *b"0123456789abcdef";
        let (reactor, listener) = setup(&path, token);
        let handle = reactor.handle();

        let pipe = net::unix_connect(&path).unwrap();
        // Token split across two writes.
        net::write_all(pipe.as_fd(), &token[..5]).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        net::write_all(pipe.as_fd(), &token[5..]).unwrap();

        assert!(wait_for(|| targets(&handle, listener) == 1));
        reactor.stop(Duration::from_secs(5)).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_wrong_token_is_closed() {
        let path = pipe_path("bad");
        let (reactor, listener) = setup(&path, *b"0123456789abcdef");
        let handle = reactor.handle();

        let pipe = net::unix_connect(&path).unwrap();
        net::write_all(pipe.as_fd(), b"fedcba9876543210").unwrap();

        // The primary hangs up on us.
        let mut buf = [0u8; 1];
        let n = unsafe { net::recv_raw(pipe.as_fd(), buf.as_mut_ptr(), 1) }.unwrap();
        assert_eq!(n, 0);
        assert_eq!(targets(&handle, listener), 0);
        reactor.stop(Duration::from_secs(5)).unwrap();
    }
}
