//! Cached `Date` header value
//!
//! Every response carries a `Date` header, but the value only changes once
//! a second. A background timer formats it off to the side and swaps the
//! shared snapshot in one atomic store, so readers see either the old or
//! the new value and never a half-written one.
//!
//! # Design
//!
//! The timer thread:
//! 1. Starts lazily on the first read and assigns a value inline, so no
//!    reader waits for the first tick
//! 2. Reformats the value every `interval`
//! 3. Exits once `idle_threshold` passes with no reads; the next read
//!    starts it again
//!
//! Start/stop transitions take a mutex. The read path does not.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use tern_core::clock::{RealClock, SystemClock};
use tern_core::constants::{DATE_IDLE_THRESHOLD, DATE_TIMER_INTERVAL};

const HEADER_PREFIX: &[u8] = b"\r\nDate: ";

/// One formatted timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateHeaderValues {
    /// `"\r\nDate: "` followed by the RFC 1123 date
    pub bytes: Vec<u8>,
    /// The bare RFC 1123 date
    pub string: String,
}

impl DateHeaderValues {
    pub fn new(now: DateTime<Utc>) -> Self {
        let string = format_date(now);
        let mut bytes = Vec::with_capacity(HEADER_PREFIX.len() + string.len());
        bytes.extend_from_slice(HEADER_PREFIX);
        bytes.extend_from_slice(string.as_bytes());
        Self { bytes, string }
    }
}

/// RFC 1123 date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn format_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

struct TimerState {
    running: bool,
    generation: u64,
    last_seen: DateTime<Utc>,
    thread: Option<Thread>,
}

struct Inner {
    clock: Arc<dyn SystemClock>,
    interval: Duration,
    idle_threshold: Duration,
    current: ArcSwapOption<DateHeaderValues>,
    had_requests: AtomicBool,
    running: AtomicBool,
    disposed: AtomicBool,
    timer: Mutex<TimerState>,
}

pub struct DateHeaderValueManager {
    inner: Arc<Inner>,
}

impl DateHeaderValueManager {
    /// Real clock, 1 s refresh, 10 s idle threshold
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock), DATE_TIMER_INTERVAL, DATE_IDLE_THRESHOLD)
    }

    pub fn with_clock(clock: Arc<dyn SystemClock>, interval: Duration, idle_threshold: Duration) -> Self {
        let last_seen = clock.utc_now();
        Self {
            inner: Arc::new(Inner {
                clock,
                interval,
                idle_threshold,
                current: ArcSwapOption::const_empty(),
                had_requests: AtomicBool::new(false),
                running: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                timer: Mutex::new(TimerState {
                    running: false,
                    generation: 0,
                    last_seen,
                    thread: None,
                }),
            }),
        }
    }

    /// The current value, starting the timer if it is idle.
    ///
    /// `None` after `dispose`; callers then use `format_date` directly.
    pub fn get_date_header_values(&self) -> Option<Arc<DateHeaderValues>> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return None;
        }
        inner.had_requests.store(true, Ordering::Release);
        if !inner.running.load(Ordering::Acquire) {
            Inner::start_timer(inner);
        }
        match inner.current.load_full() {
            Some(values) => Some(values),
            // The timer went idle between the check and the load.
            None => {
                Inner::start_timer(inner);
                inner.current.load_full()
            }
        }
    }

    /// The cached value, or one computed now if the cache is disposed
    pub fn values_or_now(&self) -> Arc<DateHeaderValues> {
        self.get_date_header_values()
            .unwrap_or_else(|| Arc::new(DateHeaderValues::new(self.inner.clock.utc_now())))
    }

    pub fn is_timer_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Stop the timer for good and clear the value.
    pub fn dispose(&self) {
        let mut timer = self.inner.timer.lock();
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        timer.running = false;
        timer.generation += 1;
        self.inner.running.store(false, Ordering::Release);
        self.inner.current.store(None);
        if let Some(t) = timer.thread.take() {
            t.unpark();
        }
        tracing::debug!("date cache disposed");
    }
}

impl Default for DateHeaderValueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DateHeaderValueManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn start_timer(this: &Arc<Inner>) {
        let mut timer = this.timer.lock();
        if this.disposed.load(Ordering::Acquire) || timer.running {
            return;
        }
        let now = this.clock.utc_now();
        this.current.store(Some(Arc::new(DateHeaderValues::new(now))));
        timer.last_seen = now;
        timer.generation += 1;
        let generation = timer.generation;

        let weak = Arc::downgrade(this);
        let interval = this.interval;
        let spawned = thread::Builder::new()
            .name("tern-date".into())
            .spawn(move || timer_loop(weak, generation, interval));
        match spawned {
            Ok(handle) => {
                timer.running = true;
                timer.thread = Some(handle.thread().clone());
                this.running.store(true, Ordering::Release);
                tracing::trace!(generation, "date timer started");
            }
            Err(e) => {
                // The inline value stays; the next read retries the start.
                tracing::warn!(error = %e, "failed to start date timer");
            }
        }
    }

    /// One tick. Returns `false` when the timer for `generation` is done.
    fn on_timer(&self, generation: u64) -> bool {
        let now = self.clock.utc_now();
        let mut timer = self.timer.lock();
        if timer.generation != generation || !timer.running {
            return false;
        }
        self.current.store(Some(Arc::new(DateHeaderValues::new(now))));

        if self.had_requests.swap(false, Ordering::AcqRel) {
            timer.last_seen = now;
            return true;
        }
        let idle = (now - timer.last_seen).to_std().unwrap_or(Duration::ZERO);
        if idle >= self.idle_threshold {
            timer.running = false;
            timer.thread = None;
            timer.last_seen = now;
            self.running.store(false, Ordering::Release);
            self.current.store(None);
            tracing::trace!(generation, ?idle, "date timer stopped after idle period");
            return false;
        }
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        let timer = self.timer.lock();
        timer.running && timer.generation == generation
    }
}

fn timer_loop(inner: Weak<Inner>, generation: u64, interval: Duration) {
    loop {
        let deadline = Instant::now() + interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
            match inner.upgrade() {
                Some(inner) if inner.is_current(generation) => {}
                _ => return,
            }
        }
        let Some(inner) = inner.upgrade() else { return };
        if !inner.on_timer(generation) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tern_core::clock::MockClock;

    const HOUR: Duration = Duration::from_secs(3600);

    fn manager(clock: &Arc<MockClock>, interval: Duration) -> DateHeaderValueManager {
        DateHeaderValueManager::with_clock(clock.clone(), interval, Duration::from_secs(10))
    }

    fn generation(mgr: &DateHeaderValueManager) -> u64 {
        mgr.inner.timer.lock().generation
    }

    #[test]
    fn test_rfc1123_format() {
        let when = Utc.timestamp_opt(784_111_777, 0).unwrap();
        assert_eq!(format_date(when), "Sun, 06 Nov 1994 08:49:37 GMT");
        let values = DateHeaderValues::new(when);
        assert_eq!(values.bytes, b"\r\nDate: Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_first_read_is_inline() {
        let clock = Arc::new(MockClock::default());
        let mgr = manager(&clock, HOUR);
        assert!(!mgr.is_timer_running());
        let values = mgr.get_date_header_values().unwrap();
        assert_eq!(values.string, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert!(mgr.is_timer_running());
    }

    #[test]
    fn test_tick_refreshes_value() {
        let clock = Arc::new(MockClock::default());
        let mgr = manager(&clock, HOUR);
        mgr.get_date_header_values();
        clock.advance(Duration::from_secs(1));
        assert!(mgr.inner.on_timer(generation(&mgr)));
        assert_eq!(mgr.get_date_header_values().unwrap().string, "Sun, 06 Nov 1994 08:49:38 GMT");
    }

    #[test]
    fn test_idle_stop_then_fresh_restart() {
        let clock = Arc::new(MockClock::default());
        let mgr = manager(&clock, HOUR);
        mgr.get_date_header_values();
        let gen = generation(&mgr);

        // First tick consumes the request flag.
        assert!(mgr.inner.on_timer(gen));
        clock.advance(Duration::from_secs(11));
        assert!(!mgr.inner.on_timer(gen));
        assert!(!mgr.is_timer_running());
        assert!(mgr.inner.current.load_full().is_none());

        clock.advance(Duration::from_secs(30));
        let values = mgr.get_date_header_values().unwrap();
        assert_eq!(values.string, format_date(clock.utc_now()));
        assert!(mgr.is_timer_running());
        assert!(generation(&mgr) > gen);
        // The stale timer generation is ignored.
        assert!(!mgr.inner.on_timer(gen));
    }

    #[test]
    fn test_reads_keep_timer_alive() {
        let clock = Arc::new(MockClock::default());
        let mgr = manager(&clock, HOUR);
        mgr.get_date_header_values();
        let gen = generation(&mgr);
        for _ in 0..5 {
            clock.advance(Duration::from_secs(11));
            mgr.get_date_header_values();
            assert!(mgr.inner.on_timer(gen));
        }
        assert!(mgr.is_timer_running());
    }

    #[test]
    fn test_dispose_returns_none() {
        let clock = Arc::new(MockClock::default());
        let mgr = manager(&clock, HOUR);
        mgr.get_date_header_values();
        mgr.dispose();
        assert!(mgr.is_disposed());
        assert!(mgr.get_date_header_values().is_none());
        assert!(!mgr.is_timer_running());
        assert_eq!(mgr.values_or_now().string, "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_readers_straddling_ticks_see_whole_values() {
        let clock = Arc::new(MockClock::default());
        let mgr = Arc::new(manager(&clock, Duration::from_millis(1)));
        let stop = Arc::new(AtomicBool::new(false));

        let ticker = {
            let clock = Arc::clone(&clock);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    clock.advance(Duration::from_secs(1));
                    thread::sleep(Duration::from_micros(200));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let v = mgr.values_or_now();
                        assert_eq!(v.string.len(), 29);
                        assert!(v.bytes.starts_with(HEADER_PREFIX));
                        assert_eq!(&v.bytes[HEADER_PREFIX.len()..], v.string.as_bytes());
                        assert!(DateTime::parse_from_rfc2822(&v.string).is_ok(), "{}", v.string);
                    }
                })
            })
            .collect();
        for r in readers {
            r.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        ticker.join().unwrap();
    }
}
