//! Receive buffer: the per-connection read primitive
//!
//! The reactor thread is the only producer. It asks for a write region
//! (`incoming_start`), lets `recv` fill it, and reports the byte count
//! (`incoming_complete`). Filled blocks form a chain in arrival order.
//!
//! Request processing is the only consumer. It inspects the chain through
//! a `Consumer` view, then reports how far it consumed and how far it
//! examined (`consuming_complete`). Consumed blocks go back to the pool.
//!
//! Waiting is a single-slot awaitable (`on_completed` / `get_result`).
//! A continuation never runs on the reactor thread; completion hands it to
//! the `Schedule` implementation. Arming twice delivers
//! `TernError::ConcurrentReads` to both waiters.
//!
//! ```text
//!   blocks:  [ head | ... | tail ]      pinned: Tail | Fresh(block)
//!              ^ consumer                  ^ producer writes here
//! ```

use crate::completion::{ArmOutcome, ArmToken, CompletionCell, ManualResetEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tern_core::error::{Result, TernError};
use tern_core::traits::{Job, Schedule};
use tern_runtime::{Block, MemoryPool};

/// Region the producer is currently filling
enum Pinned {
    /// Unused space at the end of the chain's tail block
    Tail,
    /// A leased block not yet in the chain
    Fresh(Block),
}

struct Chain {
    blocks: VecDeque<Block>,
    pinned: Option<Pinned>,
    fin: bool,
    error: Option<TernError>,
}

impl Chain {
    fn available(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    fn pinned_region(&self) -> Option<WriteRegion> {
        let block = match self.pinned.as_ref()? {
            Pinned::Tail => self.blocks.back()?,
            Pinned::Fresh(b) => b,
        };
        Some(WriteRegion {
            ptr: block.spare_ptr(),
            len: block.remaining(),
        })
    }
}

/// Writable memory handed to a native receive call.
///
/// Valid until the matching `incoming_complete` or `incoming_deferred`.
#[derive(Debug)]
pub struct WriteRegion {
    ptr: *mut u8,
    len: usize,
}

// Safety: the region is a raw view into pooled memory reserved for the
// single producer until it completes or defers.
unsafe impl Send for WriteRegion {}

impl WriteRegion {
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The owning buffer must still have this region pinned.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

pub struct ReceiveBuffer {
    pool: MemoryPool,
    scheduler: Arc<dyn Schedule>,
    chain: Mutex<Chain>,
    cell: CompletionCell,
    signal: ManualResetEvent,
}

impl ReceiveBuffer {
    pub fn new(pool: MemoryPool, scheduler: Arc<dyn Schedule>) -> Self {
        Self {
            pool,
            scheduler,
            chain: Mutex::new(Chain {
                blocks: VecDeque::new(),
                pinned: None,
                fin: false,
                error: None,
            }),
            cell: CompletionCell::new(),
            signal: ManualResetEvent::new(false),
        }
    }

    // ── Producer side (reactor thread) ──

    /// Reserve at least `min_size` writable bytes for the next receive.
    pub fn incoming_start(&self, min_size: usize) -> WriteRegion {
        let mut chain = self.chain.lock();
        if let Some(region) = chain.pinned_region() {
            return region;
        }
        let tail_fits = chain
            .blocks
            .back()
            .is_some_and(|tail| tail.is_pooled() && tail.remaining() >= min_size);
        chain.pinned = Some(if tail_fits {
            Pinned::Tail
        } else {
            Pinned::Fresh(self.pool.lease(min_size))
        });
        match chain.pinned_region() {
            Some(region) => region,
            None => WriteRegion {
                ptr: std::ptr::NonNull::dangling().as_ptr(),
                len: 0,
            },
        }
    }

    /// Report one finished receive. `count == 0` means the peer closed.
    pub fn incoming_complete(&self, count: usize, error: Option<TernError>) {
        let job = {
            let mut chain = self.chain.lock();
            match chain.pinned.take() {
                Some(Pinned::Tail) => {
                    if let Some(tail) = chain.blocks.back_mut() {
                        tail.commit(count);
                    }
                }
                Some(Pinned::Fresh(mut block)) => {
                    if count > 0 {
                        block.commit(count);
                        chain.blocks.push_back(block);
                    } else {
                        self.pool.release(block);
                    }
                }
                None => debug_assert_eq!(count, 0, "incoming_complete without incoming_start"),
            }
            if count == 0 {
                chain.fin = true;
            }
            if let Some(e) = error {
                chain.error = Some(e);
            }
            self.complete_locked()
        };
        self.run(job);
    }

    /// The receive found nothing to read. Releases the pinned region
    /// without signalling the consumer.
    pub fn incoming_deferred(&self) {
        let mut chain = self.chain.lock();
        if let Some(Pinned::Fresh(block)) = chain.pinned.take() {
            self.pool.release(block);
        }
    }

    /// Copy `data` into the chain and signal. Empty `data` marks fin.
    ///
    /// Producer-side; not to be interleaved with a pinned receive.
    pub fn incoming_data(&self, data: &[u8]) {
        let job = {
            let mut chain = self.chain.lock();
            debug_assert!(chain.pinned.is_none(), "incoming_data during a pinned receive");
            let mut rest = data;
            while !rest.is_empty() {
                let appended = match chain.blocks.back_mut() {
                    Some(tail) if tail.is_pooled() && tail.remaining() > 0 => {
                        tail.write(rest)
                    }
                    _ => 0,
                };
                if appended == 0 {
                    let mut block = self.pool.lease(1);
                    let n = block.write(rest);
                    chain.blocks.push_back(block);
                    rest = &rest[n..];
                } else {
                    rest = &rest[appended..];
                }
            }
            if data.is_empty() {
                chain.fin = true;
            }
            self.complete_locked()
        };
        self.run(job);
    }

    // ── Consumer side ──

    /// View of the unread bytes. Offsets are relative to the first
    /// unread byte and stay valid until `consuming_complete`.
    pub fn consuming_start(&self) -> Consumer<'_> {
        Consumer { buffer: self }
    }

    /// Drop `consumed` bytes and note that `examined` bytes were looked at.
    ///
    /// If everything available was examined and no terminal condition
    /// holds, the awaitable goes back to idle so the next wait suspends.
    pub fn consuming_complete(&self, consumed: usize, examined: usize) {
        let mut chain = self.chain.lock();
        let available = chain.available();
        let mut remaining = consumed.min(available);

        while remaining > 0 {
            let Some(front) = chain.blocks.front_mut() else { break };
            let take = front.len().min(remaining);
            front.consume(take);
            remaining -= take;
            if front.is_empty() && chain.blocks.len() > 1 {
                if let Some(block) = chain.blocks.pop_front() {
                    self.pool.release(block);
                }
            }
        }
        // Fully read blocks ahead of the tail go back to the pool.
        while chain.blocks.len() > 1 && chain.blocks.front().is_some_and(Block::is_empty) {
            if let Some(block) = chain.blocks.pop_front() {
                self.pool.release(block);
            }
        }

        if examined.max(consumed) >= available && !chain.fin && chain.error.is_none() {
            self.signal.reset();
            self.cell.reset();
        }
    }

    // ── Awaitable ──

    pub fn is_completed(&self) -> bool {
        self.cell.is_completed()
    }

    /// Run `continuation` (on the scheduler) once data or a terminal
    /// condition is available.
    pub fn on_completed(&self, continuation: Job) {
        self.arm(continuation);
    }

    /// Arm under the chain lock so a conflicting arm stores its error
    /// before any waiter can observe completion.
    fn arm(&self, continuation: Job) -> Option<ArmToken> {
        let mut chain = self.chain.lock();
        match self.cell.arm(continuation) {
            ArmOutcome::Armed(token) => Some(token),
            ArmOutcome::Ready(job) => {
                drop(chain);
                self.scheduler.schedule(job);
                None
            }
            ArmOutcome::Conflict { new, prior } => {
                tracing::warn!("second continuation armed on receive buffer");
                chain.error = Some(TernError::ConcurrentReads);
                self.signal.set();
                drop(chain);
                self.scheduler.schedule(new);
                self.scheduler.schedule(prior);
                None
            }
        }
    }

    /// Withdraw a continuation that has not run yet.
    fn disarm(&self, token: ArmToken) -> Option<Job> {
        let _chain = self.chain.lock();
        self.cell.disarm(token)
    }

    /// Block until completed, then surface any stored error.
    pub fn get_result(&self) -> Result<()> {
        if !self.is_completed() {
            self.signal.wait();
        }
        self.stored_result()
    }

    /// Force-complete with `Aborted` so a stuck consumer wakes.
    pub fn abort_awaiting(&self) {
        let job = {
            let mut chain = self.chain.lock();
            chain.error = Some(TernError::Aborted);
            self.complete_locked()
        };
        self.run(job);
    }

    /// Future resolving when the buffer next completes
    pub fn ready(&self) -> Ready<'_> {
        Ready {
            buffer: self,
            waker: None,
            armed: None,
        }
    }

    /// Blocking read of up to `dst.len()` bytes. `Ok(0)` at end of stream.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            let view = self.consuming_start();
            let n = view.copy_to(0, dst);
            if n > 0 {
                self.consuming_complete(n, n);
                return Ok(n);
            }
            let (fin, error) = {
                let chain = self.chain.lock();
                (chain.fin, chain.error.clone())
            };
            if let Some(e) = error {
                return Err(e);
            }
            if fin {
                return Ok(0);
            }
            self.consuming_complete(0, 0);
            self.get_result()?;
        }
    }

    /// Whether the peer has finished sending
    pub fn is_fin(&self) -> bool {
        self.chain.lock().fin
    }

    /// Bytes buffered and not yet consumed
    pub fn available(&self) -> usize {
        self.chain.lock().available()
    }

    fn stored_result(&self) -> Result<()> {
        match &self.chain.lock().error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Mark completed and release waiters. Caller holds the chain lock so
    /// a concurrent `consuming_complete` cannot rearm in between.
    fn complete_locked(&self) -> Option<Job> {
        let job = self.cell.complete();
        self.signal.set();
        job
    }

    fn run(&self, job: Option<Job>) {
        if let Some(job) = job {
            self.scheduler.schedule(job);
        }
    }
}

impl Drop for ReceiveBuffer {
    fn drop(&mut self) {
        let chain = self.chain.get_mut();
        if let Some(Pinned::Fresh(block)) = chain.pinned.take() {
            self.pool.release(block);
        }
        for block in chain.blocks.drain(..) {
            self.pool.release(block);
        }
    }
}

/// Read-only view over the unread bytes of a `ReceiveBuffer`
pub struct Consumer<'a> {
    buffer: &'a ReceiveBuffer,
}

impl Consumer<'_> {
    /// Bytes currently readable
    pub fn len(&self) -> usize {
        self.buffer.chain.lock().available()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes starting at `offset` into `dst`; returns bytes copied.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> usize {
        let chain = self.buffer.chain.lock();
        let mut skip = offset;
        let mut copied = 0;
        for block in &chain.blocks {
            let data = block.data();
            if skip >= data.len() {
                skip -= data.len();
                continue;
            }
            let src = &data[skip..];
            skip = 0;
            let n = src.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
            if copied == dst.len() {
                break;
            }
        }
        copied
    }

    /// Offset of the first occurrence of `needle`, searching across
    /// block boundaries.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        let chain = self.buffer.chain.lock();
        let mut window: VecDeque<u8> = VecDeque::with_capacity(needle.len());
        let bytes = chain.blocks.iter().flat_map(|b| b.data().iter().copied());
        for (pos, byte) in bytes.enumerate() {
            if window.len() == needle.len() {
                window.pop_front();
            }
            window.push_back(byte);
            if window.len() == needle.len() && window.iter().eq(needle.iter()) {
                return Some(pos + 1 - needle.len());
            }
        }
        None
    }

    /// All readable bytes, copied
    pub fn to_vec(&self) -> Vec<u8> {
        let chain = self.buffer.chain.lock();
        let mut out = Vec::with_capacity(chain.available());
        for block in &chain.blocks {
            out.extend_from_slice(block.data());
        }
        out
    }
}

/// Future returned by `ReceiveBuffer::ready`
///
/// Dropping it before it resolves withdraws its wakeup, so the buffer can
/// be awaited again.
pub struct Ready<'a> {
    buffer: &'a ReceiveBuffer,
    waker: Option<Arc<Mutex<Waker>>>,
    armed: Option<ArmToken>,
}

impl Future for Ready<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.buffer.is_completed() {
            this.armed = None;
            return Poll::Ready(this.buffer.stored_result());
        }
        match &this.waker {
            // Already armed; keep the latest waker current.
            Some(slot) => *slot.lock() = cx.waker().clone(),
            None => {
                let slot = Arc::new(Mutex::new(cx.waker().clone()));
                let wake = Arc::clone(&slot);
                this.waker = Some(slot);
                this.armed = this.buffer.arm(Box::new(move || wake.lock().wake_by_ref()));
            }
        }
        if this.buffer.is_completed() {
            this.armed = None;
            return Poll::Ready(this.buffer.stored_result());
        }
        Poll::Pending
    }
}

impl Drop for Ready<'_> {
    fn drop(&mut self) {
        let (Some(token), Some(slot)) = (self.armed.take(), self.waker.as_ref()) else {
            return;
        };
        // Our wakeup was already handed out; the token may name a newer one.
        if Arc::strong_count(slot) == 1 {
            return;
        }
        if self.buffer.disarm(token).is_some() {
            tracing::trace!("pending receive wait cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use tern_core::ThreadPerJob;

    /// Scheduler that records jobs instead of running them.
    #[derive(Default)]
    struct Recorder {
        jobs: parking_lot::Mutex<Vec<Job>>,
    }

    impl Schedule for Recorder {
        fn schedule(&self, job: Job) {
            self.jobs.lock().push(job);
        }
    }

    impl Recorder {
        fn run_all(&self) -> usize {
            let jobs = std::mem::take(&mut *self.jobs.lock());
            let n = jobs.len();
            for job in jobs {
                job();
            }
            n
        }
    }

    fn buffer_with(sched: Arc<dyn Schedule>) -> ReceiveBuffer {
        ReceiveBuffer::new(MemoryPool::new(), sched)
    }

    fn feed(buf: &ReceiveBuffer, data: &[u8]) {
        let mut region = buf.incoming_start(data.len().max(1));
        assert!(region.len() >= data.len());
        unsafe { region.as_mut_slice()[..data.len()].copy_from_slice(data) };
        buf.incoming_complete(data.len(), None);
    }

    #[test]
    fn test_continuation_is_scheduled_not_inline() {
        let rec = Arc::new(Recorder::default());
        let buf = buffer_with(rec.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        buf.on_completed(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        feed(&buf, b"abc");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(rec.run_all(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(buf.is_completed());
    }

    #[test]
    fn test_arm_after_data_schedules_immediately() {
        let rec = Arc::new(Recorder::default());
        let buf = buffer_with(rec.clone());
        feed(&buf, b"x");
        buf.on_completed(Box::new(|| {}));
        assert_eq!(rec.run_all(), 1);
    }

    #[test]
    fn test_double_arm_errors_both_waiters() {
        let rec = Arc::new(Recorder::default());
        let buf = Arc::new(buffer_with(rec.clone()));
        let results = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for _ in 0..2 {
            let buf2 = Arc::clone(&buf);
            let results = Arc::clone(&results);
            buf.on_completed(Box::new(move || results.lock().push(buf2.get_result())));
        }
        assert_eq!(rec.run_all(), 2);
        let results = results.lock();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| *r == Err(TernError::ConcurrentReads)));
    }

    #[test]
    fn test_examined_everything_rearms() {
        let rec = Arc::new(Recorder::default());
        let buf = buffer_with(rec.clone());
        feed(&buf, b"GET / HT");
        assert!(buf.is_completed());

        let view = buf.consuming_start();
        assert_eq!(view.find(b"\r\n\r\n"), None);
        let len = view.len();
        buf.consuming_complete(0, len);
        assert!(!buf.is_completed());
        assert_eq!(buf.available(), 8);

        feed(&buf, b"TP/1.1\r\n\r\n");
        assert!(buf.is_completed());
        assert_eq!(buf.consuming_start().find(b"\r\n\r\n"), Some(14));
    }

    #[test]
    fn test_partial_examine_stays_completed() {
        let buf = buffer_with(Arc::new(Recorder::default()));
        feed(&buf, b"hello world");
        buf.consuming_complete(5, 5);
        assert!(buf.is_completed());
        assert_eq!(buf.consuming_start().to_vec(), b" world");
    }

    #[test]
    fn test_fin_keeps_completed() {
        let buf = buffer_with(Arc::new(Recorder::default()));
        let _ = buf.incoming_start(16);
        buf.incoming_complete(0, None);
        assert!(buf.is_fin());
        buf.consuming_complete(0, 0);
        assert!(buf.is_completed());
        assert_eq!(buf.get_result(), Ok(()));
        assert_eq!(buf.read(&mut [0u8; 4]), Ok(0));
    }

    #[test]
    fn test_error_surfaces_from_get_result() {
        let buf = buffer_with(Arc::new(Recorder::default()));
        let _ = buf.incoming_start(16);
        buf.incoming_complete(0, Some(TernError::Os(104)));
        assert_eq!(buf.get_result(), Err(TernError::Os(104)));
    }

    #[test]
    fn test_deferred_returns_fresh_block() {
        let pool = MemoryPool::new();
        let buf = ReceiveBuffer::new(pool.clone(), Arc::new(Recorder::default()));
        let region = buf.incoming_start(2048);
        assert!(region.len() >= 2048);
        let free = pool.free_count();
        buf.incoming_deferred();
        assert_eq!(pool.free_count(), free + 1);
        assert!(!buf.is_completed());
    }

    #[test]
    fn test_tail_space_is_reused() {
        let pool = MemoryPool::new();
        let buf = ReceiveBuffer::new(pool.clone(), Arc::new(Recorder::default()));
        feed(&buf, b"one");
        let free = pool.free_count();
        feed(&buf, b"two");
        // Second receive landed in the same tail block.
        assert_eq!(pool.free_count(), free);
        assert_eq!(buf.consuming_start().to_vec(), b"onetwo");
    }

    #[test]
    fn test_consumed_blocks_return_to_pool() {
        let pool = MemoryPool::new();
        let buf = ReceiveBuffer::new(pool.clone(), Arc::new(Recorder::default()));
        let chunk = vec![b'a'; 3000];
        feed(&buf, &chunk);
        feed(&buf, &chunk);
        let free = pool.free_count();
        buf.consuming_complete(3000, 3000);
        assert_eq!(pool.free_count(), free + 1);
        drop(buf);
        assert_eq!(pool.free_count(), free + 2);
    }

    #[test]
    fn test_abort_wakes_blocked_reader() {
        let buf = Arc::new(buffer_with(Arc::new(ThreadPerJob)));
        let reader = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || buf.read(&mut [0u8; 8]))
        };
        std::thread::sleep(Duration::from_millis(20));
        buf.abort_awaiting();
        assert_eq!(reader.join().unwrap(), Err(TernError::Aborted));
    }

    #[test]
    fn test_split_request_reconstructs_exactly() {
        let buf = Arc::new(buffer_with(Arc::new(ThreadPerJob)));
        let (tx, rx) = mpsc::channel();
        let reader = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                let mut out = Vec::new();
                let mut chunk = [0u8; 64];
                for _ in 0..2 {
                    let n = buf.read(&mut chunk).unwrap();
                    out.extend_from_slice(&chunk[..n]);
                    tx.send(()).unwrap();
                }
                out
            })
        };
        feed(&buf, b"GET / HTTP");
        rx.recv().unwrap();
        feed(&buf, b"/1.1\r\n\r\n");
        rx.recv().unwrap();
        let out = reader.join().unwrap();
        assert_eq!(out, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_incoming_data_spans_blocks() {
        let buf = buffer_with(Arc::new(Recorder::default()));
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        buf.incoming_data(&data);
        assert_eq!(buf.available(), data.len());
        assert_eq!(buf.consuming_start().to_vec(), data);
        let mut middle = [0u8; 100];
        assert_eq!(buf.consuming_start().copy_to(4000, &mut middle), 100);
        assert_eq!(&middle[..], &data[4000..4100]);
    }

    #[test]
    fn test_ready_future_polls() {
        use std::task::Wake;
        struct Count(AtomicUsize);
        impl Wake for Count {
            fn wake(self: Arc<Self>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let rec = Arc::new(Recorder::default());
        let buf = buffer_with(rec.clone());
        let count = Arc::new(Count(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&count));
        let mut cx = Context::from_waker(&waker);

        let mut fut = buf.ready();
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        feed(&buf, b"!");
        rec.run_all();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn test_cancelled_ready_leaves_buffer_usable() {
        let rec = Arc::new(Recorder::default());
        let buf = buffer_with(rec.clone());
        struct Idle;
        impl std::task::Wake for Idle {
            fn wake(self: Arc<Self>) {}
        }
        let waker = Waker::from(Arc::new(Idle));
        let mut cx = Context::from_waker(&waker);

        let mut first = buf.ready();
        assert!(Pin::new(&mut first).poll(&mut cx).is_pending());
        drop(first);

        let mut second = buf.ready();
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());
        feed(&buf, b"ping");
        assert_eq!(rec.run_all(), 1);
        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Ready(Ok(())));
        assert_eq!(buf.consuming_start().to_vec(), b"ping");
    }

    #[test]
    fn test_conflicting_arm_stores_error_before_completion() {
        let buf = Arc::new(buffer_with(Arc::new(Recorder::default())));
        buf.on_completed(Box::new(|| {}));
        // Hold the chain lock so the second arm blocks before the cell moves.
        let guard = buf.chain.lock();
        let arming = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || buf.on_completed(Box::new(|| {})))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!buf.is_completed());
        drop(guard);
        arming.join().unwrap();
        assert!(buf.is_completed());
        assert_eq!(buf.get_result(), Err(TernError::ConcurrentReads));
    }

    proptest! {
        #[test]
        fn prop_bytes_are_conserved(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..5000), 1..12),
            takes in prop::collection::vec(1usize..6000, 1..40),
        ) {
            let buf = buffer_with(Arc::new(Recorder::default()));
            let expected: Vec<u8> = chunks.concat();
            let mut observed = Vec::new();
            let mut takes = takes.into_iter().cycle();

            for chunk in &chunks {
                // Producer may split a chunk across several receives.
                let mut rest = &chunk[..];
                while !rest.is_empty() {
                    let mut region = buf.incoming_start(1);
                    let n = region.len().min(rest.len());
                    unsafe { region.as_mut_slice()[..n].copy_from_slice(&rest[..n]) };
                    buf.incoming_complete(n, None);
                    rest = &rest[n..];
                }
                let want = takes.next().unwrap_or(1);
                let mut tmp = vec![0u8; want];
                let n = buf.consuming_start().copy_to(0, &mut tmp);
                observed.extend_from_slice(&tmp[..n]);
                buf.consuming_complete(n, n);
            }
            observed.extend(buf.consuming_start().to_vec());
            prop_assert_eq!(observed, expected);
        }
    }
}
