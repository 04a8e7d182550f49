//! # tern-runtime
//!
//! Platform runtime underneath the tern transport.
//!
//! ## Modules
//!
//! - `memory` - Slab-backed block arena (`MemoryPool`, `Block`)
//! - `reactor` - Single-threaded epoll event loops and cross-thread posting
//! - `worker_pool` - Threads that run receive-buffer continuations
//! - `oneshot` - Blocking/future one-value completion
//!
//! Linux only: reactors use epoll and eventfd directly through `libc`.

pub mod memory;
pub mod oneshot;
pub mod reactor;
pub mod worker_pool;

pub use memory::{Block, MemoryPool};
pub use oneshot::{oneshot, Pending, Resolver};
pub use reactor::{
    current_reactor_id, EventLoop, Interest, IoHandler, Reactor, ReactorGroup, ReactorHandle,
    Readiness, Token,
};
pub use worker_pool::WorkerPool;
