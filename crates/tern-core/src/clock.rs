//! Wall-clock abstraction
//!
//! The date cache reads time through `SystemClock` so tests can drive it
//! with `MockClock` instead of sleeping for real seconds.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Source of the current UTC time
pub trait SystemClock: Send + Sync {
    /// Current UTC time
    fn utc_now(&self) -> DateTime<Utc>;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct RealClock;

impl SystemClock for RealClock {
    #[inline]
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
    reads: AtomicUsize,
}

impl MockClock {
    /// Start at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            reads: AtomicUsize::new(0),
        }
    }

    /// Start at the given unix timestamp (seconds)
    pub fn at_unix(secs: i64) -> Self {
        let now = Utc.timestamp_opt(secs, 0).single().unwrap_or_default();
        Self::new(now)
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Jump to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    /// How many times `utc_now` was called
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Default for MockClock {
    fn default() -> Self {
        // Sun, 06 Nov 1994 08:49:37 GMT
        Self::at_unix(784_111_777)
    }
}

impl SystemClock for MockClock {
    fn utc_now(&self) -> DateTime<Utc> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        *self.now.lock()
    }
}
