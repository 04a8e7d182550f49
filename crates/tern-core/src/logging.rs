//! Logging setup
//!
//! Library code only emits `tracing` events. Binaries (and tests that want
//! output) call `init()` once to install a stderr subscriber.
//!
//! # Environment Variables
//!
//! - `TERN_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace, or 0..5
//! - `TERN_LOG_ANSI=0` - disable colored output
//! - `RUST_LOG` - full `EnvFilter` directives; wins over `TERN_LOG_LEVEL`

use crate::env::{env_get_bool, env_get_opt};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; unknown input maps to `Info`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the stderr subscriber from environment variables.
///
/// Safe to call more than once; only the first call has any effect.
pub fn init() {
    let level = env_get_opt::<String>("TERN_LOG_LEVEL")
        .map(|s| LogLevel::parse(&s))
        .unwrap_or(LogLevel::Info);
    init_with_level(level);
}

/// Install the stderr subscriber at a fixed default level
pub fn init_with_level(level: LogLevel) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let filter = EnvFilter::builder()
        .with_default_directive(level.filter().into())
        .from_env_lossy();

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(env_get_bool("TERN_LOG_ANSI", true))
        .with_thread_names(true)
        .try_init();

    // Another subscriber (e.g. a test harness) already owns the global slot.
    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}

/// Whether `init` has run
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Relaxed)
}
