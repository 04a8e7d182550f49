//! epoll and eventfd wrappers

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tern_core::error::{Result, TernError};

/// Which readiness a registration wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { readable: false, writable: false };
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };

    pub fn with_readable(self, on: bool) -> Self {
        Self { readable: on, ..self }
    }

    pub fn with_writable(self, on: bool) -> Self {
        Self { writable: on, ..self }
    }

    fn bits(self) -> u32 {
        let mut bits = 0u32;
        if self.readable {
            bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.writable {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

/// What the kernel reported for one fd
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Both directions closed. Reported whatever the interest mask.
    pub hangup: bool,
    /// Pending socket error. Reported whatever the interest mask.
    pub error: bool,
}

impl Readiness {
    fn from_bits(bits: u32) -> Self {
        let has = |flag: i32| bits & flag as u32 != 0;
        Self {
            readable: has(libc::EPOLLIN) || has(libc::EPOLLRDHUP),
            writable: has(libc::EPOLLOUT),
            hangup: has(libc::EPOLLHUP),
            error: has(libc::EPOLLERR),
        }
    }
}

pub(crate) struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub(crate) fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(TernError::last_os_error());
        }
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    fn ctl(&self, op: i32, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(TernError::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, Interest::NONE)
    }

    /// Wait for events; `timeout_ms < 0` blocks indefinitely.
    /// Returns `(token, readiness)` pairs through `out`.
    pub(crate) fn wait(
        &self,
        events: &mut [libc::epoll_event],
        out: &mut Vec<(u64, Readiness)>,
        timeout_ms: i32,
    ) -> Result<()> {
        out.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(TernError::last_os_error());
        }
        for ev in &events[..n as usize] {
            // Copy out of the (packed on x86_64) struct before use.
            let bits = ev.events;
            let token = ev.u64;
            out.push((token, Readiness::from_bits(bits)));
        }
        Ok(())
    }
}

pub(crate) fn empty_events(n: usize) -> Vec<libc::epoll_event> {
    vec![libc::epoll_event { events: 0, u64: 0 }; n]
}

/// eventfd used to wake a reactor blocked in `epoll_wait`.
///
/// Multiple `notify` calls before the reactor drains coalesce into a
/// single wakeup (eventfd counter semantics).
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub(crate) fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(TernError::last_os_error());
        }
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = TernError::last_os_error();
            // Counter saturated: a wakeup is already pending.
            if err.is_would_block() {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}
