//! Send pipeline
//!
//! `SocketOutput::write` moves the caller's buffer into a write request
//! and posts it to the connection's reactor. The reactor appends it to the
//! connection's `WriteQueue` and sends from there, so writes on one
//! connection complete in submission order. The callback runs on the
//! reactor thread once the last byte of its buffer has been sent.

use crate::connection::{Connection, ConnectionId};
use crate::net;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use tern_core::error::{Result, TernError};
use tern_runtime::{ReactorHandle, Token};

pub(crate) type WriteCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// One buffer in flight. Owns the bytes until the send finishes.
///
/// The callback runs exactly once: on completion, on failure, or with
/// `ConnectionClosed` if the request is dropped unfinished.
pub(crate) struct WriteRequest {
    buffer: Vec<u8>,
    written: usize,
    callback: Option<WriteCallback>,
}

impl WriteRequest {
    pub(crate) fn new(buffer: Vec<u8>, callback: WriteCallback) -> Self {
        Self {
            buffer,
            written: 0,
            callback: Some(callback),
        }
    }

    pub(crate) fn fail(self, err: TernError) {
        self.finish(Err(err));
    }

    fn finish(mut self, result: Result<()>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for WriteRequest {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(TernError::ConnectionClosed));
        }
    }
}

/// Result of draining the queue as far as the socket allows
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flush {
    /// Everything sent. `shutdown` is set when a queued half-close is due.
    Drained { shutdown: bool },
    /// The socket buffer is full; wait for writable readiness.
    Blocked,
    /// The socket failed; all queued requests have been failed.
    Failed(TernError),
}

/// Reactor-side queue of pending writes for one connection
#[derive(Default)]
pub(crate) struct WriteQueue {
    pending: VecDeque<WriteRequest>,
    shutdown_after: bool,
}

impl WriteQueue {
    pub(crate) fn push(&mut self, req: WriteRequest) {
        self.pending.push_back(req);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Half-close once everything queued so far has been sent.
    pub(crate) fn shutdown_when_drained(&mut self) {
        self.shutdown_after = true;
    }

    pub(crate) fn flush(&mut self, fd: BorrowedFd<'_>) -> Flush {
        while let Some(front) = self.pending.front_mut() {
            if front.written < front.buffer.len() {
                match net::send(fd, &front.buffer[front.written..]) {
                    Ok(n) => front.written += n,
                    Err(e) if e.is_would_block() => return Flush::Blocked,
                    Err(e) if e.errno() == Some(libc::EINTR) => continue,
                    Err(e) => {
                        self.fail_all(e.clone());
                        return Flush::Failed(e);
                    }
                }
            }
            if front.written == front.buffer.len() {
                if let Some(done) = self.pending.pop_front() {
                    done.finish(Ok(()));
                }
            }
        }
        Flush::Drained {
            shutdown: std::mem::take(&mut self.shutdown_after),
        }
    }

    pub(crate) fn fail_all(&mut self, err: TernError) {
        self.shutdown_after = false;
        for req in self.pending.drain(..) {
            req.fail(err.clone());
        }
    }
}

/// Cloneable write handle for one connection
#[derive(Clone)]
pub struct SocketOutput {
    reactor: ReactorHandle,
    token: Token,
    id: ConnectionId,
}

impl SocketOutput {
    pub(crate) fn new(reactor: ReactorHandle, token: Token, id: ConnectionId) -> Self {
        Self { reactor, token, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue `buffer` for sending. `callback(result, state)` runs on the
    /// reactor thread after the buffer has been written or has failed.
    pub fn write<S, F>(&self, buffer: Vec<u8>, callback: F, state: S)
    where
        S: Send + 'static,
        F: FnOnce(Result<()>, S) + Send + 'static,
    {
        let request = WriteRequest::new(buffer, Box::new(move |result| callback(result, state)));
        // Shared so a rejected post can still complete the callback.
        let slot = Arc::new(Mutex::new(Some(request)));
        let posted = Arc::clone(&slot);
        let token = self.token;

        let result = self.reactor.post(move |lp| {
            let Some(request) = posted.lock().take() else { return };
            let mut request = Some(request);
            lp.with_handler::<Connection, _>(token, |conn, lp| {
                if let Some(req) = request.take() {
                    conn.enqueue_write(lp, token, req);
                }
            });
            if let Some(req) = request {
                req.fail(TernError::ConnectionClosed);
            }
        });

        if let Err(e) = result {
            if let Some(request) = slot.lock().take() {
                tracing::debug!(conn = %self.id, error = %e, "write rejected by reactor");
                request.fail(e);
            }
        }
    }

    /// Write and block until the reactor reports completion.
    ///
    /// Not for use on a reactor thread.
    pub fn write_blocking(&self, buffer: Vec<u8>) -> Result<()> {
        let (resolver, pending) = tern_runtime::oneshot();
        self.write(buffer, |result, resolver: tern_runtime::Resolver<Result<()>>| resolver.resolve(result), resolver);
        pending.wait()?
    }
}

impl std::fmt::Debug for SocketOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketOutput")
            .field("conn", &self.id)
            .field("reactor", &self.reactor.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    fn recorder() -> (Arc<Mutex<Vec<(usize, Result<()>)>>>, impl Fn(usize) -> WriteCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let make = move |i: usize| -> WriteCallback {
            let l = Arc::clone(&l);
            Box::new(move |r| l.lock().push((i, r)))
        };
        (log, make)
    }

    fn drain(fd: BorrowedFd<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match unsafe { net::recv_raw(fd, buf.as_mut_ptr(), buf.len()) } {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.is_would_block() => break,
                Err(e) => panic!("{}", e),
            }
        }
        out
    }

    #[test]
    fn test_queue_completes_in_order() {
        let (a, b) = net::socket_pair().unwrap();
        let (log, cb) = recorder();
        let mut q = WriteQueue::default();
        q.push(WriteRequest::new(b"first ".to_vec(), cb(1)));
        q.push(WriteRequest::new(Vec::new(), cb(2)));
        q.push(WriteRequest::new(b"second".to_vec(), cb(3)));

        assert_eq!(q.flush(a.as_fd()), Flush::Drained { shutdown: false });
        assert!(q.is_empty());
        let order: Vec<usize> = log.lock().iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(log.lock().iter().all(|(_, r)| r.is_ok()));
        assert_eq!(drain(b.as_fd()), b"first second");
    }

    #[test]
    fn test_blocked_queue_resumes() {
        let (a, b) = net::socket_pair().unwrap();
        let (log, cb) = recorder();
        let mut q = WriteQueue::default();
        let big = vec![0xEEu8; 4 << 20];
        q.push(WriteRequest::new(big.clone(), cb(1)));
        q.push(WriteRequest::new(b"tail".to_vec(), cb(2)));

        let mut received = Vec::new();
        loop {
            match q.flush(a.as_fd()) {
                Flush::Blocked => received.extend(drain(b.as_fd())),
                Flush::Drained { .. } => break,
                Flush::Failed(e) => panic!("{}", e),
            }
        }
        received.extend(drain(b.as_fd()));
        assert_eq!(received.len(), big.len() + 4);
        assert_eq!(&received[big.len()..], b"tail");
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_shutdown_waits_for_drain() {
        let (a, _b) = net::socket_pair().unwrap();
        let (_log, cb) = recorder();
        let mut q = WriteQueue::default();
        q.push(WriteRequest::new(b"x".to_vec(), cb(1)));
        q.shutdown_when_drained();
        assert_eq!(q.flush(a.as_fd()), Flush::Drained { shutdown: true });
        // One-shot.
        assert_eq!(q.flush(a.as_fd()), Flush::Drained { shutdown: false });
    }

    #[test]
    fn test_dropped_request_reports_closed() {
        let (log, cb) = recorder();
        let mut q = WriteQueue::default();
        q.push(WriteRequest::new(b"never sent".to_vec(), cb(7)));
        drop(q);
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], (7, Err(TernError::ConnectionClosed)));
    }

    #[test]
    fn test_write_to_stopped_reactor_calls_back() {
        let reactor = tern_runtime::Reactor::start(0).unwrap();
        let output = SocketOutput::new(reactor.handle(), 1, ConnectionId::next());
        reactor.stop(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(output.write_blocking(b"late".to_vec()), Err(TernError::ReactorStopped));
    }

    #[test]
    fn test_failure_fails_every_request() {
        let (a, b) = net::socket_pair().unwrap();
        drop(b);
        let (log, cb) = recorder();
        let mut q = WriteQueue::default();
        q.push(WriteRequest::new(b"one".to_vec(), cb(1)));
        q.push(WriteRequest::new(b"two".to_vec(), cb(2)));
        assert!(matches!(q.flush(a.as_fd()), Flush::Failed(_)));
        assert_eq!(q.len(), 0);
        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|(_, r)| r.is_err()));
    }
}
