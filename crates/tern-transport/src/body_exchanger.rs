//! Request body hand-over
//!
//! The frame that parses a request pushes raw body bytes in with
//! `transfer`; the application pulls them out with `read_async`. Bytes are
//! kept in a chain of pooled blocks, so growing the buffer never copies
//! what is already stored.
//!
//! Reads are served strictly in arrival order. Once one read is queued,
//! every later read queues behind it even if bytes are already buffered.

use crate::receive_buffer::ReceiveBuffer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tern_runtime::{oneshot, Block, MemoryPool, Pending, Resolver};

/// Completed read: the caller's buffer and how many bytes were filled
pub type ReadResult = (Vec<u8>, usize);

struct QueuedRead {
    buffer: Vec<u8>,
    resolver: Resolver<ReadResult>,
}

#[derive(Default)]
struct State {
    blocks: VecDeque<Block>,
    available: usize,
    fin: bool,
    disposed: bool,
    reads: VecDeque<QueuedRead>,
}

impl State {
    fn append(&mut self, pool: &MemoryPool, mut data: &[u8]) {
        while !data.is_empty() {
            let n = match self.blocks.back_mut() {
                Some(tail) if tail.remaining() > 0 => tail.write(data),
                _ => {
                    let mut block = pool.lease(0);
                    let n = block.write(data);
                    self.blocks.push_back(block);
                    n
                }
            };
            self.available += n;
            data = &data[n..];
        }
    }

    /// Copy up to `dst.len()` buffered bytes out, releasing drained blocks.
    fn take_into(&mut self, pool: &MemoryPool, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = self.blocks.front_mut() else { break };
            let data = front.data();
            let n = data.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&data[..n]);
            front.consume(n);
            copied += n;
            if front.is_empty() {
                if let Some(block) = self.blocks.pop_front() {
                    pool.release(block);
                }
            }
        }
        self.available -= copied;
        copied
    }

    /// Whether a read issued now can complete without waiting
    fn can_satisfy(&self, len: usize) -> bool {
        len == 0 || self.available > 0 || self.fin || self.disposed
    }

    /// Pop every queued read that can complete, in order.
    fn drain_ready(&mut self, pool: &MemoryPool) -> Vec<(QueuedRead, usize)> {
        let mut done = Vec::new();
        while let Some(front) = self.reads.front() {
            if !self.can_satisfy(front.buffer.len()) {
                break;
            }
            let Some(mut read) = self.reads.pop_front() else { break };
            let n = self.take_into(pool, &mut read.buffer);
            done.push((read, n));
        }
        done
    }
}

pub struct BodyExchanger {
    pool: MemoryPool,
    state: Mutex<State>,
}

impl BodyExchanger {
    pub fn new(pool: MemoryPool) -> Self {
        Self {
            pool,
            state: Mutex::new(State::default()),
        }
    }

    /// Append body bytes and complete whatever queued reads they satisfy.
    /// `fin` marks the end of the body.
    pub fn transfer(&self, data: &[u8], fin: bool) {
        let done = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.append(&self.pool, data);
            state.fin |= fin;
            state.drain_ready(&self.pool)
        };
        complete(done);
    }

    /// Move `count` bytes out of `input` (they are consumed there) and
    /// append them here.
    pub fn transfer_from(&self, input: &ReceiveBuffer, count: usize, fin: bool) {
        let done = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            let view = input.consuming_start();
            let mut offset = 0;
            while offset < count {
                let mut block = match state.blocks.pop_back() {
                    Some(tail) if tail.remaining() > 0 => tail,
                    Some(full) => {
                        state.blocks.push_back(full);
                        self.pool.lease(0)
                    }
                    None => self.pool.lease(0),
                };
                let want = block.remaining().min(count - offset);
                let n = view.copy_to(offset, &mut block.spare_mut()[..want]);
                block.commit(n);
                if block.is_empty() {
                    self.pool.release(block);
                } else {
                    state.blocks.push_back(block);
                }
                state.available += n;
                offset += n;
                if n < want {
                    break;
                }
            }
            input.consuming_complete(offset, offset);
            state.fin |= fin;
            state.drain_ready(&self.pool)
        };
        complete(done);
    }

    /// Fill `buffer` with body bytes.
    ///
    /// Completes immediately with a copy when data is buffered, the body
    /// has ended, or `buffer` is empty, provided no earlier read is still
    /// waiting. Otherwise the read queues behind the others.
    pub fn read_async(&self, mut buffer: Vec<u8>) -> Pending<ReadResult> {
        let (resolver, pending) = oneshot();
        let mut state = self.state.lock();
        if state.reads.is_empty() && state.can_satisfy(buffer.len()) {
            let n = state.take_into(&self.pool, &mut buffer);
            drop(state);
            resolver.resolve((buffer, n));
        } else {
            state.reads.push_back(QueuedRead { buffer, resolver });
        }
        pending
    }

    /// Blocking form of `read_async`
    pub fn read(&self, buffer: Vec<u8>) -> tern_core::Result<ReadResult> {
        self.read_async(buffer).wait()
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    pub fn is_fin(&self) -> bool {
        self.state.lock().fin
    }

    pub fn queued_reads(&self) -> usize {
        self.state.lock().reads.len()
    }

    /// Return all blocks and abort queued reads.
    pub fn dispose(&self) {
        let (reads, blocks) = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.available = 0;
            (std::mem::take(&mut state.reads), std::mem::take(&mut state.blocks))
        };
        for block in blocks {
            self.pool.release(block);
        }
        // Dropping each resolver completes its read with `Aborted`.
        drop(reads);
    }
}

impl Drop for BodyExchanger {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn complete(done: Vec<(QueuedRead, usize)>) {
    for (read, n) in done {
        read.resolver.resolve((read.buffer, n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tern_core::error::TernError;
    use tern_core::ThreadPerJob;

    fn exchanger() -> BodyExchanger {
        BodyExchanger::new(MemoryPool::new())
    }

    fn text(result: ReadResult) -> Vec<u8> {
        let (mut buf, n) = result;
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_buffered_read_is_immediate() {
        let body = exchanger();
        body.transfer(b"hello world", false);
        let mut pending = body.read_async(vec![0; 5]);
        let got = pending.try_take().expect("immediate").unwrap();
        assert_eq!(text(got), b"hello");
        assert_eq!(body.available(), 6);
    }

    #[test]
    fn test_zero_length_read_is_immediate() {
        let body = exchanger();
        let mut pending = body.read_async(Vec::new());
        let (buf, n) = pending.try_take().expect("immediate").unwrap();
        assert!(buf.is_empty());
        assert_eq!(n, 0);
    }

    #[test]
    fn test_queued_reads_complete_in_order() {
        let body = exchanger();
        let mut r1 = body.read_async(vec![0; 4]);
        let mut r2 = body.read_async(vec![0; 4]);
        assert!(r1.try_take().is_none());
        assert_eq!(body.queued_reads(), 2);

        body.transfer(b"ab", false);
        assert_eq!(text(r1.try_take().expect("r1 first").unwrap()), b"ab");
        assert!(r2.try_take().is_none());

        body.transfer(b"cdef", false);
        assert_eq!(text(r2.try_take().expect("r2 second").unwrap()), b"cdef");
    }

    #[test]
    fn test_later_read_waits_behind_queued_one() {
        let body = exchanger();
        let mut r1 = body.read_async(vec![0; 3]);
        // A zero-length read would normally be immediate but must not
        // overtake r1.
        let mut r2 = body.read_async(Vec::new());
        assert!(r2.try_take().is_none());

        body.transfer(b"xyz", false);
        assert_eq!(text(r1.try_take().unwrap().unwrap()), b"xyz");
        assert_eq!(r2.try_take().unwrap().unwrap().1, 0);
    }

    #[test]
    fn test_fin_completes_waiting_reads_with_zero() {
        let body = exchanger();
        let mut r1 = body.read_async(vec![0; 8]);
        let mut r2 = body.read_async(vec![0; 8]);
        body.transfer(b"end", true);
        assert_eq!(text(r1.try_take().unwrap().unwrap()), b"end");
        assert_eq!(r2.try_take().unwrap().unwrap().1, 0);
        assert_eq!(body.read(vec![0; 8]).unwrap().1, 0);
    }

    #[test]
    fn test_large_body_spans_blocks() {
        let body = exchanger();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(3000) {
            body.transfer(chunk, false);
        }
        body.transfer(&[], true);
        let mut out = Vec::new();
        loop {
            let (buf, n) = body.read(vec![0; 1500]).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_transfer_from_receive_buffer() {
        let pool = MemoryPool::new();
        let input = ReceiveBuffer::new(pool.clone(), Arc::new(ThreadPerJob));
        input.incoming_data(b"body-bytes|next");
        let body = BodyExchanger::new(pool);
        body.transfer_from(&input, 10, true);
        assert_eq!(input.available(), 5);
        assert_eq!(text(body.read(vec![0; 32]).unwrap()), b"body-bytes");
        assert!(body.is_fin());
    }

    #[test]
    fn test_cross_thread_reader() {
        let body = Arc::new(exchanger());
        let reader = {
            let body = Arc::clone(&body);
            std::thread::spawn(move || text(body.read(vec![0; 16]).unwrap()))
        };
        std::thread::sleep(Duration::from_millis(20));
        body.transfer(b"late", false);
        assert_eq!(reader.join().unwrap(), b"late");
    }

    #[test]
    fn test_dispose_aborts_queued_reads() {
        let body = exchanger();
        let pending = body.read_async(vec![0; 4]);
        body.dispose();
        assert!(matches!(pending.wait(), Err(TernError::Aborted)));
        // Disposed: reads complete empty instead of hanging.
        assert_eq!(body.read(vec![0; 4]).unwrap().1, 0);
    }
}
