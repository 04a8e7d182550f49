//! Server configuration

use crate::constants::{
    BLOCK_LENGTH, DATE_IDLE_THRESHOLD, DATE_TIMER_INTERVAL, DEFAULT_BACKLOG, DEFAULT_READ_SIZE,
    MAX_REACTORS,
};
use crate::env::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_str, env_is_set};
use crate::error::{Result, TernError};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How a primary listener hands accepted sockets to its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Post the owned socket straight onto the peer reactor
    InProcess,
    /// Transfer the OS handle over a unix domain socket
    Pipe,
}

impl FromStr for DispatchMode {
    type Err = TernError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "inprocess" | "in-process" | "local" => Ok(DispatchMode::InProcess),
            "pipe" | "ipc" => Ok(DispatchMode::Pipe),
            _ => Err(TernError::Config("dispatch must be `inprocess` or `pipe`")),
        }
    }
}

/// Configuration for a transport server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of reactor threads (defaults to CPU count)
    pub thread_count: usize,

    /// Threads running receive-buffer continuations
    pub continuation_threads: usize,

    /// Listen backlog
    pub backlog: i32,

    /// Set TCP_NODELAY on accepted sockets
    pub no_delay: bool,

    /// Bytes requested from the receive buffer per native read
    pub read_size: usize,

    /// How accepted sockets reach secondary reactors
    pub dispatch: DispatchMode,

    /// Unix socket path used by `DispatchMode::Pipe`
    pub pipe_path: PathBuf,

    /// Date cache refresh interval
    pub date_interval: Duration,

    /// Date cache idle threshold
    pub date_idle_threshold: Duration,

    /// How long `stop` waits for a reactor to close its handles
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            thread_count: num_cpus.min(MAX_REACTORS),
            continuation_threads: (num_cpus / 2).clamp(2, 8),
            backlog: DEFAULT_BACKLOG,
            no_delay: true,
            read_size: DEFAULT_READ_SIZE,
            dispatch: DispatchMode::InProcess,
            pipe_path: std::env::temp_dir().join(format!("tern-{}.sock", std::process::id())),
            date_interval: DATE_TIMER_INTERVAL,
            date_idle_threshold: DATE_IDLE_THRESHOLD,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `TERN_*` environment variables
    ///
    /// `TERN_THREADS`, `TERN_CONTINUATION_THREADS`, `TERN_BACKLOG`,
    /// `TERN_NO_DELAY`, `TERN_READ_SIZE`, `TERN_DISPATCH` (`inprocess` |
    /// `pipe`), `TERN_PIPE_PATH`, and the millisecond knobs
    /// `TERN_DATE_INTERVAL_MS`, `TERN_DATE_IDLE_MS`, `TERN_SHUTDOWN_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let base = Self::default();
        let mut config = Self {
            thread_count: env_get("TERN_THREADS", base.thread_count),
            continuation_threads: env_get("TERN_CONTINUATION_THREADS", base.continuation_threads),
            backlog: env_get("TERN_BACKLOG", base.backlog),
            no_delay: env_get_bool("TERN_NO_DELAY", base.no_delay),
            read_size: env_get("TERN_READ_SIZE", base.read_size),
            date_interval: env_get_millis("TERN_DATE_INTERVAL_MS", base.date_interval),
            date_idle_threshold: env_get_millis("TERN_DATE_IDLE_MS", base.date_idle_threshold),
            shutdown_timeout: env_get_millis("TERN_SHUTDOWN_TIMEOUT_MS", base.shutdown_timeout),
            ..base
        };
        if let Some(raw) = env_get_opt::<String>("TERN_DISPATCH") {
            config.dispatch = raw.parse()?;
        }
        if env_is_set("TERN_PIPE_PATH") {
            let path = env_get_str("TERN_PIPE_PATH", "");
            if path.is_empty() {
                return Err(TernError::Config("TERN_PIPE_PATH must not be empty"));
            }
            config.pipe_path = PathBuf::from(path);
        }
        config.validate()?;
        Ok(config)
    }

    /// Set number of reactor threads
    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n.min(MAX_REACTORS);
        self
    }

    /// Set number of continuation threads
    pub fn continuation_threads(mut self, n: usize) -> Self {
        self.continuation_threads = n;
        self
    }

    /// Set listen backlog
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enable: bool) -> Self {
        self.no_delay = enable;
        self
    }

    /// Set the per-read request size
    pub fn read_size(mut self, size: usize) -> Self {
        self.read_size = size;
        self
    }

    /// Select the dispatch transport
    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    /// Set the dispatch pipe path
    pub fn pipe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pipe_path = path.into();
        self
    }

    /// Set date cache interval and idle threshold
    pub fn date_timing(mut self, interval: Duration, idle_threshold: Duration) -> Self {
        self.date_interval = interval;
        self.date_idle_threshold = idle_threshold;
        self
    }

    /// Set the reactor shutdown timeout
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(TernError::Config("thread_count must be at least 1"));
        }
        if self.thread_count > MAX_REACTORS {
            return Err(TernError::Config("thread_count exceeds maximum"));
        }
        if self.continuation_threads == 0 {
            return Err(TernError::Config("continuation_threads must be at least 1"));
        }
        if self.backlog <= 0 {
            return Err(TernError::Config("backlog must be positive"));
        }
        if self.read_size == 0 || self.read_size > BLOCK_LENGTH {
            return Err(TernError::Config("read_size must fit in one block"));
        }
        if self.date_interval.is_zero() {
            return Err(TernError::Config("date_interval must be non-zero"));
        }
        Ok(())
    }
}
