//! # tern-core
//!
//! Core types shared by every tern crate.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Reactors, the block arena and sockets live in `tern-runtime` and
//! `tern-transport`.
//!
//! ## Modules
//!
//! - `error` - `TernError` and the `Result` alias
//! - `config` - Server configuration builder
//! - `clock` - Wall-clock abstraction used by the date cache
//! - `traits` - The `Schedule` seam for running continuations
//! - `logging` - `tracing` subscriber installation
//! - `env` - Environment variable utilities

pub mod error;
pub mod config;
pub mod clock;
pub mod traits;
pub mod logging;
pub mod env;

// Re-exports for convenience
pub use error::{Result, TernError};
pub use config::{DispatchMode, ServerConfig};
pub use clock::{MockClock, RealClock, SystemClock};
pub use traits::{Job, Schedule, ThreadPerJob};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_str, env_is_set};

/// Buffer sizing and server defaults
pub mod constants {
    use std::time::Duration;

    /// Distance between the starts of two blocks in a slab
    pub const BLOCK_STRIDE: usize = 4096;

    /// Bytes reserved at the end of every block
    pub const BLOCK_UNUSED: usize = 64;

    /// Usable bytes per block
    pub const BLOCK_LENGTH: usize = BLOCK_STRIDE - BLOCK_UNUSED;

    /// Blocks carved from one slab
    pub const BLOCK_COUNT: usize = 32;

    /// Bytes per slab
    pub const SLAB_LENGTH: usize = BLOCK_STRIDE * BLOCK_COUNT;

    /// Default accept-queue depth
    pub const DEFAULT_BACKLOG: i32 = 128;

    /// Default size requested from the receive buffer per native read
    pub const DEFAULT_READ_SIZE: usize = 2048;

    /// How often the cached date value is refreshed
    pub const DATE_TIMER_INTERVAL: Duration = Duration::from_secs(1);

    /// Idle time after which the date timer stops itself
    pub const DATE_IDLE_THRESHOLD: Duration = Duration::from_secs(10);

    /// Payload carried with every transferred socket handle.
    /// The transfer primitive cannot carry a zero-length payload.
    pub const HANDOFF_PLACEHOLDER: [u8; 4] = [1, 2, 3, 4];

    /// Length of the token a secondary presents when it attaches
    pub const PIPE_TOKEN_LEN: usize = 16;

    /// Maximum reactors (event-loop threads)
    pub const MAX_REACTORS: usize = 64;
}
