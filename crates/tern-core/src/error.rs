//! Error types for the tern transport

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TernError>;

/// Errors that can occur in transport operations
///
/// `Clone` so one stored failure can be handed to every waiter that
/// observes it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TernError {
    /// OS error with errno
    #[error("os error: {}", os_message(.0))]
    Os(i32),

    /// A second continuation was armed while one was already pending
    #[error("concurrent reads are not supported")]
    ConcurrentReads,

    /// The awaitable was force-completed during teardown
    #[error("the operation was aborted")]
    Aborted,

    /// The connection was closed before the operation ran
    #[error("connection closed")]
    ConnectionClosed,

    /// The owning reactor hit a fatal error and no longer runs
    #[error("reactor failed: {0}")]
    ReactorFailed(String),

    /// The owning reactor was stopped
    #[error("reactor stopped")]
    ReactorStopped,

    /// The block arena was disposed
    #[error("memory pool disposed")]
    PoolDisposed,

    /// A socket handle could not be transferred to a peer
    #[error("handoff failed: {0}")]
    Handoff(String),

    /// A secondary presented a wrong pipe token
    #[error("invalid dispatch pipe handshake")]
    InvalidHandshake,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl TernError {
    /// Capture errno of the last failed system call
    pub fn last_os_error() -> Self {
        std::io::Error::last_os_error().into()
    }

    /// The errno carried by an `Os` error
    pub fn errno(&self) -> Option<i32> {
        match self {
            TernError::Os(code) => Some(*code),
            _ => None,
        }
    }

    /// Whether the error means "try again later" on a non-blocking fd
    pub fn is_would_block(&self) -> bool {
        matches!(self.errno(), Some(code) if code == EAGAIN || code == EWOULDBLOCK)
    }
}

impl From<std::io::Error> for TernError {
    fn from(e: std::io::Error) -> Self {
        TernError::Os(e.raw_os_error().unwrap_or(-1))
    }
}

fn os_message(code: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*code)
}

// Linux values; this crate does not depend on libc.
const EAGAIN: i32 = 11;
const EWOULDBLOCK: i32 = EAGAIN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = TernError::ConcurrentReads;
        assert_eq!(format!("{}", e), "concurrent reads are not supported");

        let e = TernError::ReactorFailed("epoll_wait".into());
        assert_eq!(format!("{}", e), "reactor failed: epoll_wait");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from_raw_os_error(11);
        let err: TernError = io.into();
        assert_eq!(err, TernError::Os(11));
        assert!(err.is_would_block());
        assert_eq!(err.errno(), Some(11));
    }

    #[test]
    fn test_non_os_errors_have_no_errno() {
        assert_eq!(TernError::Aborted.errno(), None);
        assert!(!TernError::Aborted.is_would_block());
    }
}
