//! Block: a fixed-capacity view into slab memory
//!
//! ```text
//!   0          start            end                  capacity
//!   |  consumed  |   readable    |      writable       |
//! ```
//!
//! A slab-backed block never owns its bytes; it keeps the slab alive
//! through an `Arc`. Oversized requests get a heap-backed block that the
//! pool does not track.

use super::slab::Slab;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

enum Backing {
    Slab(Arc<Slab>),
    // Keeps the allocation alive; accessed only through `ptr`.
    Heap(#[allow(dead_code)] Box<[u8]>),
}

pub struct Block {
    ptr: NonNull<u8>,
    capacity: usize,
    start: usize,
    end: usize,
    backing: Backing,
}

// Safety: a Block is the unique owner of its byte range. Moving it to
// another thread moves that ownership along with it.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// Carve a block out of `slab` at `offset`.
    ///
    /// # Safety
    /// `offset..offset + capacity` must lie inside the slab and must not
    /// overlap any other live block.
    pub(crate) unsafe fn from_slab(slab: &Arc<Slab>, offset: usize, capacity: usize) -> Self {
        debug_assert!(offset + capacity <= slab.len());
        let ptr = NonNull::new_unchecked(slab.base().add(offset));
        Self {
            ptr,
            capacity,
            start: 0,
            end: 0,
            backing: Backing::Slab(Arc::clone(slab)),
        }
    }

    /// A standalone block not tracked by any pool
    pub fn standalone(capacity: usize) -> Self {
        let mut storage = vec![0u8; capacity.max(1)].into_boxed_slice();
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            capacity,
            start: 0,
            end: 0,
            backing: Backing::Heap(storage),
        }
    }

    /// Whether returning this block to a pool puts it back on the free stack
    #[inline]
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Slab(_))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Unread bytes (`end - start`)
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Writable bytes after `end`
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.end
    }

    /// Native address of the first byte; stride-aligned for slab blocks
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The unread bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(self.start), self.len()) }
    }

    /// The writable bytes past `end`
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.end), self.remaining()) }
    }

    /// Raw pointer to the writable region past `end`.
    ///
    /// For handing to a system call while the block sits in a shared chain.
    /// The caller must be the only writer of `end..capacity` until it calls
    /// `commit`.
    #[inline]
    pub fn spare_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(self.end) }
    }

    /// Mark `n` written bytes as readable
    #[inline]
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.remaining(), "commit past block capacity");
        self.end += n;
    }

    /// Mark `n` readable bytes as consumed
    #[inline]
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past block end");
        self.start += n;
    }

    /// Append as much of `src` as fits; returns bytes copied
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.spare_mut()[..n].copy_from_slice(&src[..n]);
        self.end += n;
        n
    }

    /// Reset cursors to an empty block
    #[inline]
    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("start", &self.start)
            .field("end", &self.end)
            .field("capacity", &self.capacity)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_cursors() {
        let mut b = Block::standalone(16);
        assert!(!b.is_pooled());
        assert_eq!(b.write(b"hello world, more than 16"), 16);
        assert_eq!(b.remaining(), 0);
        b.consume(6);
        assert_eq!(b.data(), b"world, m");
        b.reset();
        assert!(b.is_empty());
        assert_eq!(b.remaining(), 16);
    }

    #[test]
    fn test_commit_after_raw_write() {
        let mut b = Block::standalone(8);
        unsafe {
            std::ptr::copy_nonoverlapping(b"abc".as_ptr(), b.spare_ptr(), 3);
        }
        b.commit(3);
        assert_eq!(b.data(), b"abc");
    }

    #[test]
    #[should_panic(expected = "commit past block capacity")]
    fn test_commit_overflow_panics() {
        let mut b = Block::standalone(4);
        b.commit(5);
    }
}
