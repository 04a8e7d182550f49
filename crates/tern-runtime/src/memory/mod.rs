//! Block arena
//!
//! Slabs of `SLAB_LENGTH` bytes are carved into `BLOCK_COUNT` blocks of
//! `BLOCK_LENGTH` usable bytes, each starting on a `BLOCK_STRIDE` boundary.
//! Free blocks live on a lock-free queue shared by every reactor and
//! continuation thread.
//!
//! ```text
//!   slab:  | block 0 (4032) | 64 | block 1 (4032) | 64 | ... | block 31 | 64 |
//!          ^ stride-aligned      ^ stride-aligned
//! ```

mod block;
mod slab;

pub use block::Block;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tern_core::constants::{BLOCK_LENGTH, BLOCK_STRIDE, SLAB_LENGTH};
use tern_core::error::{Result, TernError};

struct PoolInner {
    free: SegQueue<Block>,
    slabs: Mutex<Vec<Arc<Slab>>>,
    slabs_allocated: AtomicUsize,
    disposed: AtomicBool,
}

/// Shared pool of fixed-size blocks
///
/// Cloning is cheap; every clone refers to the same free stack.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: SegQueue::new(),
                slabs: Mutex::new(Vec::new()),
                slabs_allocated: AtomicUsize::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Usable bytes of a pooled block
    #[inline]
    pub const fn block_len() -> usize {
        BLOCK_LENGTH
    }

    /// Lease a block with at least `min_size` writable bytes.
    ///
    /// Requests larger than a pooled block, and any request the arena
    /// cannot serve (disposed, or out of memory), get a standalone heap
    /// block.
    pub fn lease(&self, min_size: usize) -> Block {
        match self.try_lease(min_size) {
            Ok(block) => block,
            Err(e) => {
                tracing::debug!(error = %e, "using standalone block");
                Block::standalone(min_size.max(BLOCK_LENGTH))
            }
        }
    }

    /// Like `lease`, but reports `PoolDisposed` or a slab allocation
    /// failure instead of falling back.
    pub fn try_lease(&self, min_size: usize) -> Result<Block> {
        if min_size > BLOCK_LENGTH {
            return Ok(Block::standalone(min_size));
        }
        loop {
            if self.inner.disposed.load(Ordering::Acquire) {
                return Err(TernError::PoolDisposed);
            }
            if let Some(block) = self.inner.free.pop() {
                return Ok(block);
            }
            self.allocate_slab()?;
        }
    }

    /// Give a block back. Standalone blocks are simply dropped.
    pub fn release(&self, mut block: Block) {
        if !block.is_pooled() || self.inner.disposed.load(Ordering::Acquire) {
            return;
        }
        block.reset();
        self.inner.free.push(block);
    }

    /// Drop the free stack and the pool's slab references.
    ///
    /// Blocks still checked out keep their slab mapped until they are
    /// dropped, so a late reader never touches unmapped memory.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut dropped = 0usize;
        while self.inner.free.pop().is_some() {
            dropped += 1;
        }
        let slabs = std::mem::take(&mut *self.inner.slabs.lock());
        tracing::debug!(slabs = slabs.len(), free_blocks = dropped, "memory pool disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Slabs allocated over the pool's lifetime
    pub fn slab_count(&self) -> usize {
        self.inner.slabs_allocated.load(Ordering::Relaxed)
    }

    /// Blocks currently on the free stack
    pub fn free_count(&self) -> usize {
        self.inner.free.len()
    }

    fn allocate_slab(&self) -> Result<()> {
        let slab = Arc::new(Slab::allocate(SLAB_LENGTH)?);

        // Alignment guarantees every block's address is a stride multiple.
        let mut offset = slab.first_offset();
        let mut carved = 0usize;
        while offset + BLOCK_LENGTH <= slab.len() {
            // Safety: offsets advance by a full stride and stay in bounds.
            let block = unsafe { Block::from_slab(&slab, offset, BLOCK_LENGTH) };
            self.inner.free.push(block);
            offset += BLOCK_STRIDE;
            carved += 1;
        }

        self.inner.slabs.lock().push(slab);
        let total = self.inner.slabs_allocated.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(blocks = carved, slabs = total, "allocated slab");
        Ok(())
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("slabs", &self.slab_count())
            .field("free", &self.free_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
