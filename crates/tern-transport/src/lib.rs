//! # tern-transport
//!
//! Connection transport underneath an HTTP server: it moves bytes between
//! sockets and request processing and leaves HTTP framing to its callers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │          FrameFactory (request processing)               │
//! │   input.on_completed(..)   ← continuation on WorkerPool  │
//! │   output.write(buf, cb)    ← posted to owning reactor    │
//! └───────────────┬─────────────────────────▲────────────────┘
//!                 │ ConnectionIo            │ completion
//! ┌───────────────▼─────────────────────────┴────────────────┐
//! │   ReceiveBuffer (block chain)   SocketOutput (WriteQueue) │
//! └───────────────┬─────────────────────────▲────────────────┘
//!                 │                         │ recv
//! ┌───────────────▼─────────────────────────┴────────────────┐
//! │   Reactor threads: Listener → RoundRobin → Connection     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tern_core::ServerConfig;
//! use tern_transport::{ConnectionIo, FrameFactory, TransportServer};
//!
//! struct Hello;
//!
//! impl FrameFactory for Hello {
//!     fn start(&self, io: ConnectionIo) {
//!         io.output.write(b"hello\n".to_vec(), |_, _: ()| {}, ());
//!     }
//! }
//!
//! let server = TransportServer::start(
//!     ServerConfig::from_env()?,
//!     "127.0.0.1:8080".parse()?,
//!     Arc::new(Hello),
//! )?;
//! ```

pub mod body_exchanger;
pub mod completion;
pub mod connection;
pub mod date_header;
pub mod listener;
pub mod net;
pub mod receive_buffer;
pub mod server;
pub mod socket_output;

pub use body_exchanger::BodyExchanger;
pub use completion::{CompletionCell, ManualResetEvent};
pub use connection::{
    Connection, ConnectionContext, ConnectionControl, ConnectionId, ConnectionIo, FrameFactory,
    ProduceEndType,
};
pub use date_header::{format_date, DateHeaderValueManager, DateHeaderValues};
pub use listener::{
    Dispatcher, HandoffTarget, InProcessTarget, Listener, PipeAcceptor, PipeTarget, RoundRobin,
    SecondaryListener,
};
pub use receive_buffer::{Consumer, ReceiveBuffer, WriteRegion};
pub use server::TransportServer;
pub use socket_output::SocketOutput;
