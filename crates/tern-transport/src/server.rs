//! Transport server wiring
//!
//! Starts every moving part of the transport and tears it down in a safe
//! order:
//!
//! ```text
//! start:  reactors → continuation pool → block arena → date cache → listeners
//! stop:   listeners → reactors (closes connections) → continuation pool
//!         → date cache → block arena
//! ```
//!
//! Reactor 0 owns the public listener. With `DispatchMode::InProcess` the
//! other reactors are `InProcessTarget`s; with `DispatchMode::Pipe` each of
//! them runs a `SecondaryListener` connected through the unix socket at
//! `pipe_path`.

use crate::connection::{ConnectionContext, FrameFactory};
use crate::date_header::DateHeaderValueManager;
use crate::listener::{Dispatcher, InProcessTarget, Listener, PipeAcceptor, SecondaryListener};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_core::clock::RealClock;
use tern_core::config::{DispatchMode, ServerConfig};
use tern_core::constants::PIPE_TOKEN_LEN;
use tern_core::error::{Result, TernError};
use tern_core::traits::Schedule;
use tern_runtime::{MemoryPool, ReactorGroup, ReactorHandle, Token, WorkerPool};

pub struct TransportServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    reactors: Option<ReactorGroup>,
    listeners: Vec<(ReactorHandle, Token)>,
    workers: Arc<WorkerPool>,
    pool: MemoryPool,
    date: Arc<DateHeaderValueManager>,
}

impl TransportServer {
    /// Bind `addr` and start serving connections through `frames`.
    pub fn start(config: ServerConfig, addr: SocketAddr, frames: Arc<dyn FrameFactory>) -> Result<Self> {
        config.validate()?;

        let reactors = ReactorGroup::start(config.thread_count)?;
        let workers = Arc::new(WorkerPool::new(config.continuation_threads)?);
        let pool = MemoryPool::new();
        let date = Arc::new(DateHeaderValueManager::with_clock(
            Arc::new(RealClock),
            config.date_interval,
            config.date_idle_threshold,
        ));
        let scheduler: Arc<dyn Schedule> = workers.clone();
        let ctx = Arc::new(
            ConnectionContext::new(pool.clone(), scheduler, frames, Arc::clone(&date))
                .read_size(config.read_size)
                .no_delay(config.no_delay),
        );

        let handles = reactors.handles();
        let (primary, secondaries) = handles
            .split_first()
            .ok_or(TernError::Config("thread_count must be at least 1"))?;

        let (listeners, local_addr) = match config.dispatch {
            DispatchMode::InProcess => {
                let mut dispatcher = Dispatcher::new();
                for h in secondaries {
                    dispatcher.add(Box::new(InProcessTarget::new(h.clone(), Arc::clone(&ctx))));
                }
                let backlog = config.backlog;
                let bind_ctx = Arc::clone(&ctx);
                let (token, local) =
                    primary.post_and_wait(move |lp| Listener::bind(lp, addr, backlog, bind_ctx, dispatcher))??;
                (vec![(primary.clone(), token)], local)
            }
            DispatchMode::Pipe => start_pipes(&config, addr, primary, secondaries, &ctx)?,
        };

        tracing::info!(
            %local_addr,
            reactors = config.thread_count,
            continuation_threads = config.continuation_threads,
            dispatch = ?config.dispatch,
            "transport server started"
        );

        Ok(Self {
            config,
            local_addr,
            reactors: Some(reactors),
            listeners,
            workers,
            pool,
            date,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn date(&self) -> &Arc<DateHeaderValueManager> {
        &self.date
    }

    pub fn reactor_count(&self) -> usize {
        self.reactors.as_ref().map_or(0, ReactorGroup::len)
    }

    /// Shut down; returns the first error any stage reported.
    pub fn stop(mut self) -> Result<()> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> Result<()> {
        let Some(reactors) = self.reactors.take() else {
            return Ok(());
        };
        let mut first: Option<TernError> = None;

        for (handle, token) in self.listeners.drain(..) {
            // Dropping the handler closes the socket.
            if let Err(e) = handle.post_and_wait(move |lp| drop(lp.deregister(token))) {
                tracing::warn!(reactor = handle.id(), error = %e, "failed to close listener");
                first.get_or_insert(e);
            }
        }
        if let Err(e) = reactors.stop(self.config.shutdown_timeout) {
            first.get_or_insert(e);
        }
        self.workers.shutdown();
        self.date.dispose();
        self.pool.dispose();
        tracing::info!(addr = %self.local_addr, "transport server stopped");

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop_inner() {
            tracing::warn!(error = %e, "transport server stopped with error");
        }
    }
}

fn start_pipes(
    config: &ServerConfig,
    addr: SocketAddr,
    primary: &ReactorHandle,
    secondaries: &[ReactorHandle],
    ctx: &Arc<ConnectionContext>,
) -> Result<(Vec<(ReactorHandle, Token)>, SocketAddr)> {
    let mut pipe_token = [0u8; PIPE_TOKEN_LEN];
    rand::thread_rng().fill(&mut pipe_token);

    let backlog = config.backlog;
    let path = config.pipe_path.clone();
    let bind_ctx = Arc::clone(ctx);
    let (listener, acceptor, local) = primary.post_and_wait(move |lp| {
        let (listener, local) = Listener::bind(lp, addr, backlog, bind_ctx, Dispatcher::new())?;
        let acceptor = PipeAcceptor::bind(lp, &path, listener, pipe_token)?;
        Ok::<_, TernError>((listener, acceptor, local))
    })??;

    let mut listeners = vec![(primary.clone(), listener), (primary.clone(), acceptor)];
    for h in secondaries {
        let path = config.pipe_path.clone();
        let ctx = Arc::clone(ctx);
        let token = h.post_and_wait(move |lp| SecondaryListener::connect(lp, &path, &pipe_token, ctx))??;
        listeners.push((h.clone(), token));
    }

    // Until a channel's token is verified, its share of connections stays
    // on the primary.
    let want = secondaries.len();
    let deadline = Instant::now() + config.shutdown_timeout;
    loop {
        let joined = primary
            .post_and_wait(move |lp| lp.with_handler::<Listener, _>(listener, |l, _| l.targets()))?
            .unwrap_or(0);
        if joined >= want {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!(joined, want, "not every secondary joined the dispatch rotation");
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok((listeners, local))
}
