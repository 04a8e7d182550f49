//! Slab allocation
//!
//! A slab is one large region carved into blocks. On unix it comes from an
//! anonymous `mmap` so its base is page aligned and never moves; elsewhere
//! it is a `std::alloc` allocation aligned to the block stride.
//!
//! Blocks hold an `Arc<Slab>`, so the region is unmapped only after the
//! pool has been disposed *and* the last checked-out block is gone.

use std::ptr::NonNull;
use tern_core::constants::BLOCK_STRIDE;
use tern_core::error::{Result, TernError};

pub(crate) struct Slab {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the slab is a plain byte region. Disjoint sub-ranges are handed
// to exactly one Block each; the slab itself never reads or writes them.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Offset of the first block so that every block's address is a
    /// multiple of the stride.
    #[inline]
    pub(crate) fn first_offset(&self) -> usize {
        let addr = self.base() as usize;
        (BLOCK_STRIDE - addr % BLOCK_STRIDE) % BLOCK_STRIDE
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl Slab {
            pub(crate) fn allocate(len: usize) -> Result<Self> {
                let base = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if base == libc::MAP_FAILED {
                    return Err(TernError::last_os_error());
                }
                let base = NonNull::new(base as *mut u8).ok_or(TernError::Os(libc::ENOMEM))?;
                Ok(Self { base, len })
            }
        }

        impl Drop for Slab {
            fn drop(&mut self) {
                let ret = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
                if ret != 0 {
                    tracing::warn!(len = self.len, "munmap of slab failed");
                }
            }
        }
    } else {
        use std::alloc::{alloc_zeroed, dealloc, Layout};

        impl Slab {
            fn layout(len: usize) -> Result<Layout> {
                Layout::from_size_align(len, BLOCK_STRIDE)
                    .map_err(|_| TernError::Config("invalid slab layout"))
            }

            pub(crate) fn allocate(len: usize) -> Result<Self> {
                let layout = Self::layout(len)?;
                let base = unsafe { alloc_zeroed(layout) };
                let base = NonNull::new(base).ok_or(TernError::Os(12))?;
                Ok(Self { base, len })
            }
        }

        impl Drop for Slab {
            fn drop(&mut self) {
                if let Ok(layout) = Self::layout(self.len) {
                    unsafe { dealloc(self.base.as_ptr(), layout) };
                }
            }
        }
    }
}
