//! Connection: one accepted socket bound to one reactor
//!
//! The reactor owns the `Connection` (it is the fd's `IoHandler`). Each
//! readable event pins a region of the receive buffer, fills it with one
//! `recv`, and completes it. Writes and control requests reach the
//! connection as posted closures, so they never race the read path.
//!
//! Request processing sees the connection only through `ConnectionIo`,
//! handed to the `FrameFactory` when the connection starts.

use crate::date_header::DateHeaderValueManager;
use crate::net;
use crate::receive_buffer::ReceiveBuffer;
use crate::socket_output::{Flush, SocketOutput, WriteQueue, WriteRequest};
use std::any::Any;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tern_core::error::{Result, TernError};
use tern_core::traits::Schedule;
use tern_runtime::{EventLoop, Interest, IoHandler, MemoryPool, ReactorHandle, Readiness, Token};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How a frame ends its use of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceEndType {
    /// Half-close after every queued write has been sent
    SocketShutdownSend,
    /// Leave the connection open for the next request
    ConnectionKeepAlive,
    /// Close the socket now
    SocketDisconnect,
}

/// Everything a frame needs to drive one connection
pub struct ConnectionIo {
    pub id: ConnectionId,
    pub input: Arc<ReceiveBuffer>,
    pub output: SocketOutput,
    pub control: ConnectionControl,
    pub date: Arc<DateHeaderValueManager>,
}

/// Receives every connection a reactor starts.
///
/// `start` runs on the reactor thread and must not block; frames do their
/// work from receive-buffer continuations.
pub trait FrameFactory: Send + Sync + 'static {
    fn start(&self, io: ConnectionIo);
}

/// Shared by every connection of a server
pub struct ConnectionContext {
    pub(crate) pool: MemoryPool,
    pub(crate) scheduler: Arc<dyn Schedule>,
    pub(crate) frames: Arc<dyn FrameFactory>,
    pub(crate) date: Arc<DateHeaderValueManager>,
    pub(crate) read_size: usize,
    pub(crate) no_delay: bool,
}

impl ConnectionContext {
    pub fn new(
        pool: MemoryPool,
        scheduler: Arc<dyn Schedule>,
        frames: Arc<dyn FrameFactory>,
        date: Arc<DateHeaderValueManager>,
    ) -> Self {
        Self {
            pool,
            scheduler,
            frames,
            date,
            read_size: tern_core::constants::DEFAULT_READ_SIZE,
            no_delay: true,
        }
    }

    pub fn read_size(mut self, size: usize) -> Self {
        self.read_size = size;
        self
    }

    pub fn no_delay(mut self, on: bool) -> Self {
        self.no_delay = on;
        self
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }
}

/// Reactor-side state of one connection
pub struct Connection {
    id: ConnectionId,
    fd: OwnedFd,
    input: Arc<ReceiveBuffer>,
    read_size: usize,
    writes: WriteQueue,
    paused: bool,
    read_closed: bool,
}

impl Connection {
    /// Register `fd` on `lp` and hand the new connection to the frames.
    /// Must run on `lp`'s thread.
    pub fn start(lp: &mut EventLoop, fd: OwnedFd, ctx: &ConnectionContext) -> Result<ConnectionId> {
        if ctx.no_delay {
            if let Err(e) = net::set_nodelay(fd.as_fd(), true) {
                // Not a TCP socket (tests use socket pairs).
                tracing::trace!(error = %e, "TCP_NODELAY not applied");
            }
        }
        let id = ConnectionId::next();
        let input = Arc::new(ReceiveBuffer::new(ctx.pool.clone(), Arc::clone(&ctx.scheduler)));
        let raw = fd.as_raw_fd();
        let conn = Connection {
            id,
            fd,
            input: Arc::clone(&input),
            read_size: ctx.read_size,
            writes: WriteQueue::default(),
            paused: false,
            read_closed: false,
        };
        let token = lp.register(raw, Interest::READABLE, Box::new(conn))?;
        tracing::debug!(reactor = lp.id(), conn = %id, fd = raw, "connection started");

        let reactor = lp.handle();
        ctx.frames.start(ConnectionIo {
            id,
            input,
            output: SocketOutput::new(reactor.clone(), token, id),
            control: ConnectionControl { reactor, token, id },
            date: Arc::clone(&ctx.date),
        });
        Ok(id)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn wanted(&self) -> Interest {
        Interest {
            readable: !self.paused && !self.read_closed,
            writable: !self.writes.is_empty(),
        }
    }

    fn update_interest(&self, lp: &mut EventLoop, token: Token) {
        if let Err(e) = lp.set_interest(token, self.wanted()) {
            tracing::debug!(conn = %self.id, error = %e, "interest update failed");
        }
    }

    fn on_readable(&mut self, lp: &mut EventLoop, token: Token) {
        let region = self.input.incoming_start(self.read_size);
        let result = unsafe { net::recv_raw(self.fd.as_fd(), region.as_mut_ptr(), region.len()) };
        match result {
            Ok(0) => {
                tracing::debug!(conn = %self.id, "peer closed send side");
                self.input.incoming_complete(0, None);
                self.read_closed = true;
                self.update_interest(lp, token);
            }
            Ok(n) => self.input.incoming_complete(n, None),
            Err(e) if e.is_would_block() || e.errno() == Some(libc::EINTR) => {
                self.input.incoming_deferred();
            }
            Err(e) => {
                tracing::debug!(conn = %self.id, error = %e, "read failed");
                self.input.incoming_complete(0, Some(e));
                self.close(lp, token);
            }
        }
    }

    fn flush(&mut self, lp: &mut EventLoop, token: Token) {
        match self.writes.flush(self.fd.as_fd()) {
            Flush::Drained { shutdown } => {
                if shutdown {
                    if let Err(e) = net::shutdown_write(self.fd.as_fd()) {
                        tracing::debug!(conn = %self.id, error = %e, "shutdown failed");
                    }
                }
            }
            Flush::Blocked => {}
            Flush::Failed(e) => {
                tracing::debug!(conn = %self.id, error = %e, "write failed");
                self.close(lp, token);
                return;
            }
        }
        self.update_interest(lp, token);
    }

    pub(crate) fn enqueue_write(&mut self, lp: &mut EventLoop, token: Token, req: WriteRequest) {
        let idle = self.writes.is_empty();
        self.writes.push(req);
        // A non-empty queue is already waiting for writable readiness.
        if idle {
            self.flush(lp, token);
        }
    }

    fn set_paused(&mut self, lp: &mut EventLoop, token: Token, paused: bool) {
        if self.paused != paused {
            self.paused = paused;
            self.update_interest(lp, token);
        }
    }

    fn end(&mut self, lp: &mut EventLoop, token: Token, how: ProduceEndType) {
        match how {
            ProduceEndType::ConnectionKeepAlive => {}
            ProduceEndType::SocketShutdownSend => {
                self.writes.shutdown_when_drained();
                if self.writes.is_empty() {
                    self.flush(lp, token);
                }
            }
            ProduceEndType::SocketDisconnect => self.close(lp, token),
        }
    }

    /// Deregister; the loop drops `self` (closing the fd) afterwards.
    fn close(&mut self, lp: &mut EventLoop, token: Token) {
        if let Some(handler) = lp.deregister(token) {
            drop(handler);
        }
    }
}

impl IoHandler for Connection {
    fn ready(&mut self, lp: &mut EventLoop, token: Token, readiness: Readiness) {
        if readiness.writable || (readiness.error && !self.writes.is_empty()) {
            self.flush(lp, token);
            if lp.interest(token).is_none() {
                return;
            }
        }
        let reading = !self.paused && !self.read_closed;
        if (readiness.readable || readiness.error) && reading {
            self.on_readable(lp, token);
        } else if readiness.hangup || readiness.error {
            // Level-triggered HUP/ERR would come back on every wait.
            tracing::debug!(
                conn = %self.id,
                paused = self.paused,
                read_closed = self.read_closed,
                error = readiness.error,
                "peer gone while not reading"
            );
            self.close(lp, token);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.writes.fail_all(TernError::ConnectionClosed);
        if !self.input.is_fin() {
            self.input.abort_awaiting();
        }
        tracing::debug!(conn = %self.id, fd = self.fd.as_raw_fd(), "connection closed");
    }
}

/// Pause, resume or end a connection from any thread
#[derive(Clone)]
pub struct ConnectionControl {
    reactor: ReactorHandle,
    token: Token,
    id: ConnectionId,
}

impl ConnectionControl {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Stop watching for input (backpressure)
    pub fn pause(&self) -> Result<()> {
        self.post(|conn, lp, token| conn.set_paused(lp, token, true))
    }

    pub fn resume(&self) -> Result<()> {
        self.post(|conn, lp, token| conn.set_paused(lp, token, false))
    }

    pub fn end(&self, how: ProduceEndType) -> Result<()> {
        if how == ProduceEndType::ConnectionKeepAlive {
            return Ok(());
        }
        self.post(move |conn, lp, token| conn.end(lp, token, how))
    }

    fn post(&self, f: impl FnOnce(&mut Connection, &mut EventLoop, Token) + Send + 'static) -> Result<()> {
        let token = self.token;
        let id = self.id;
        self.reactor.post(move |lp| {
            if lp.with_handler::<Connection, _>(token, |conn, lp| f(conn, lp, token)).is_none() {
                tracing::trace!(conn = %id, "control request for closed connection");
            }
        })
    }
}

impl fmt::Debug for ConnectionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionControl")
            .field("conn", &self.id)
            .field("token", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_header::DateHeaderValueManager;
    use parking_lot::Mutex;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;
    use tern_core::ThreadPerJob;
    use tern_runtime::Reactor;

    /// Captures the `ConnectionIo` of every started connection.
    #[derive(Default)]
    struct Capture {
        started: Mutex<Vec<ConnectionIo>>,
    }

    impl FrameFactory for Capture {
        fn start(&self, io: ConnectionIo) {
            self.started.lock().push(io);
        }
    }

    fn context(frames: Arc<Capture>) -> Arc<ConnectionContext> {
        Arc::new(ConnectionContext::new(
            MemoryPool::new(),
            Arc::new(ThreadPerJob),
            frames,
            Arc::new(DateHeaderValueManager::new()),
        ))
    }

    fn start_pair(reactor: &Reactor, ctx: &Arc<ConnectionContext>) -> UnixStream {
        let (ours, theirs) = UnixStream::pair().unwrap();
        theirs.set_nonblocking(true).unwrap();
        let fd = OwnedFd::from(theirs);
        let ctx = Arc::clone(ctx);
        reactor
            .handle()
            .post_and_wait(move |lp| Connection::start(lp, fd, &ctx))
            .unwrap()
            .unwrap();
        ours
    }

    fn take_io(capture: &Capture) -> ConnectionIo {
        capture.started.lock().pop().expect("connection started")
    }

    #[test]
    fn test_split_receive_reconstructs_request() {
        let reactor = Reactor::start(0).unwrap();
        let capture = Arc::new(Capture::default());
        let ctx = context(Arc::clone(&capture));
        let mut peer = start_pair(&reactor, &ctx);
        let io = take_io(&capture);

        peer.write_all(b"GET / HT").unwrap();
        let mut first = [0u8; 64];
        let n1 = io.input.read(&mut first).unwrap();

        peer.write_all(b"TP/1.1\r\n\r\n").unwrap();
        let mut second = [0u8; 64];
        let n2 = io.input.read(&mut second).unwrap();

        let mut all = first[..n1].to_vec();
        all.extend_from_slice(&second[..n2]);
        // A fast peer may land both writes in one receive.
        if all.len() < 18 {
            let n3 = io.input.read(&mut second).unwrap();
            all.extend_from_slice(&second[..n3]);
        }
        assert_eq!(all, b"GET / HTTP/1.1\r\n\r\n");
        reactor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_writes_arrive_in_order_then_shutdown() {
        let reactor = Reactor::start(0).unwrap();
        let capture = Arc::new(Capture::default());
        let ctx = context(Arc::clone(&capture));
        let mut peer = start_pair(&reactor, &ctx);
        let io = take_io(&capture);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20u8 {
            let order = Arc::clone(&order);
            io.output.write(
                vec![b'a' + i; 100],
                move |r, i| {
                    assert!(r.is_ok());
                    order.lock().push(i);
                },
                i,
            );
        }
        io.control.end(ProduceEndType::SocketShutdownSend).unwrap();

        let mut got = Vec::new();
        peer.read_to_end(&mut got).unwrap();
        assert_eq!(got.len(), 2000);
        for (i, chunk) in got.chunks(100).enumerate() {
            assert!(chunk.iter().all(|b| *b == b'a' + i as u8));
        }
        assert_eq!(*order.lock(), (0..20).collect::<Vec<u8>>());
        reactor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_peer_close_sets_fin() {
        let reactor = Reactor::start(0).unwrap();
        let capture = Arc::new(Capture::default());
        let ctx = context(Arc::clone(&capture));
        let peer = start_pair(&reactor, &ctx);
        let io = take_io(&capture);

        drop(peer);
        assert_eq!(io.input.read(&mut [0u8; 8]), Ok(0));
        assert!(io.input.is_fin());
        reactor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_disconnect_wakes_reader_and_fails_writes() {
        let reactor = Reactor::start(0).unwrap();
        let capture = Arc::new(Capture::default());
        let ctx = context(Arc::clone(&capture));
        let _peer = start_pair(&reactor, &ctx);
        let io = take_io(&capture);

        let input = Arc::clone(&io.input);
        let reader = std::thread::spawn(move || input.read(&mut [0u8; 8]));
        std::thread::sleep(Duration::from_millis(20));
        io.control.end(ProduceEndType::SocketDisconnect).unwrap();
        assert_eq!(reader.join().unwrap(), Err(TernError::Aborted));

        assert_eq!(io.output.write_blocking(b"late".to_vec()), Err(TernError::ConnectionClosed));
        assert_eq!(reactor.handle().post_and_wait(|lp| lp.registered()).unwrap(), 0);
        reactor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_pause_stops_reading() {
        let reactor = Reactor::start(0).unwrap();
        let capture = Arc::new(Capture::default());
        let ctx = context(Arc::clone(&capture));
        let mut peer = start_pair(&reactor, &ctx);
        let io = take_io(&capture);

        io.control.pause().unwrap();
        // Round-trip through the loop so the pause has been applied.
        reactor.handle().post_and_wait(|_| ()).unwrap();
        peer.write_all(b"held").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(io.input.available(), 0);

        io.control.resume().unwrap();
        let mut buf = [0u8; 8];
        let n = io.input.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"held");
        reactor.stop(Duration::from_secs(5)).unwrap();
    }

    fn wait_registered(reactor: &Reactor, want: usize) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if reactor.handle().post_and_wait(|lp| lp.registered()).unwrap() == want {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_hangup_while_paused_closes() {
        let reactor = Reactor::start(0).unwrap();
        let capture = Arc::new(Capture::default());
        let ctx = context(Arc::clone(&capture));
        let peer = start_pair(&reactor, &ctx);
        let io = take_io(&capture);

        io.control.pause().unwrap();
        reactor.handle().post_and_wait(|_| ()).unwrap();
        drop(peer);

        // Without this the loop would see EPOLLHUP on every wait.
        assert!(wait_registered(&reactor, 0));
        assert_eq!(io.input.get_result(), Err(TernError::Aborted));
        reactor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_hangup_after_fin_closes() {
        let reactor = Reactor::start(0).unwrap();
        let capture = Arc::new(Capture::default());
        let ctx = context(Arc::clone(&capture));
        let peer = start_pair(&reactor, &ctx);
        let io = take_io(&capture);

        peer.shutdown(std::net::Shutdown::Write).unwrap();
        assert_eq!(io.input.read(&mut [0u8; 8]), Ok(0));
        // Read side done; connection stays up for writes until the peer leaves.
        assert_eq!(reactor.handle().post_and_wait(|lp| lp.registered()).unwrap(), 1);
        drop(peer);
        assert!(wait_registered(&reactor, 0));
        assert_eq!(io.input.get_result(), Ok(()));
        reactor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_reactor_stop_closes_connections() {
        let reactor = Reactor::start(0).unwrap();
        let capture = Arc::new(Capture::default());
        let ctx = context(Arc::clone(&capture));
        let mut peer = start_pair(&reactor, &ctx);
        let io = take_io(&capture);

        reactor.stop(Duration::from_secs(5)).unwrap();
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(io.input.get_result(), Err(TernError::Aborted));
        // Blocks went back to the shared pool.
        drop(io);
        assert_eq!(ctx.pool().free_count(), ctx.pool().slab_count() * tern_core::constants::BLOCK_COUNT);
    }
}
