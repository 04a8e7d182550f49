//! Raw socket helpers
//!
//! Thin wrappers over the system calls the transport needs. Every fd is
//! created non-blocking and close-on-exec and returned as an `OwnedFd`.
//!
//! Socket options and shutdown go through `nix`; the calls `nix` does not
//! cover the way we need them (accept4 flags, `SCM_RIGHTS` framing) use
//! `libc` directly.

use nix::errno::Errno;
use nix::sys::socket::{self, sockopt, Shutdown};
use std::mem::{size_of, zeroed};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use tern_core::constants::HANDOFF_PLACEHOLDER;
use tern_core::error::{Result, TernError};

/// Most handles accepted from one `recvmsg`
const MAX_FDS_PER_MESSAGE: usize = 8;

#[inline]
pub(crate) fn errno_err(e: Errno) -> TernError {
    TernError::Os(e as i32)
}

/// Whether an error means the peer end of a channel is gone
pub fn is_disconnect(err: &TernError) -> bool {
    matches!(
        err.errno().map(Errno::from_raw),
        Some(Errno::EPIPE | Errno::ECONNRESET | Errno::ENOTCONN)
    )
}

fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(TernError::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> Result<usize> {
    if ret < 0 {
        Err(TernError::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn from_sockaddr(storage: &libc::sockaddr_storage) -> Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(TernError::Os(libc::EAFNOSUPPORT)),
    }
}

/// Create, bind and listen on a TCP endpoint.
pub fn tcp_listen(addr: SocketAddr, backlog: i32) -> Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let raw = cvt(unsafe {
        libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    })?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(errno_err)?;

    let (storage, len) = to_sockaddr(&addr);
    cvt(unsafe { libc::bind(fd.as_raw_fd(), &storage as *const _ as *const libc::sockaddr, len) })?;
    cvt(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
    Ok(fd)
}

/// Address a socket is bound to
pub fn local_addr(fd: BorrowedFd<'_>) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockname(fd.as_raw_fd(), &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    from_sockaddr(&storage)
}

/// Accept one pending connection; `None` when the queue is empty.
pub fn accept(listener: BorrowedFd<'_>) -> Result<Option<OwnedFd>> {
    let ret = unsafe {
        libc::accept4(
            listener.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    match cvt(ret) {
        Ok(fd) => Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) })),
        Err(e) if e.is_would_block() => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn set_nodelay(fd: BorrowedFd<'_>, on: bool) -> Result<()> {
    socket::setsockopt(&fd, sockopt::TcpNoDelay, &on).map_err(errno_err)
}

pub fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Receive into raw memory. `Ok(0)` means the peer closed.
///
/// # Safety
/// `buf` must be valid for `len` writable bytes.
pub unsafe fn recv_raw(fd: BorrowedFd<'_>, buf: *mut u8, len: usize) -> Result<usize> {
    cvt_size(libc::recv(fd.as_raw_fd(), buf as *mut libc::c_void, len, 0))
}

/// Send without raising SIGPIPE
pub fn send(fd: BorrowedFd<'_>, data: &[u8]) -> Result<usize> {
    cvt_size(unsafe {
        libc::send(
            fd.as_raw_fd(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    })
}

/// Half-close: no more sends
pub fn shutdown_write(fd: BorrowedFd<'_>) -> Result<()> {
    socket::shutdown(fd.as_raw_fd(), Shutdown::Write).map_err(errno_err)
}

/// Bind a unix stream listener, replacing a stale socket file.
pub fn unix_listen(path: &Path) -> Result<OwnedFd> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(OwnedFd::from(listener))
}

/// Connect to a unix stream listener. The returned stream is blocking.
pub fn unix_connect(path: &Path) -> Result<OwnedFd> {
    let stream = UnixStream::connect(path)?;
    Ok(OwnedFd::from(stream))
}

/// Write all of `data` to a blocking fd
pub fn write_all(fd: BorrowedFd<'_>, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match send(fd, data) {
            Ok(0) => return Err(TernError::ConnectionClosed),
            Ok(n) => data = &data[n..],
            Err(e) if e.errno() == Some(libc::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Control-message buffer aligned for `cmsghdr`
#[repr(C, align(8))]
struct CmsgBuf([u8; 128]);

/// Transfer `fd` over a unix channel together with the placeholder payload.
pub fn send_fd(channel: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<()> {
    let payload = HANDOFF_PLACEHOLDER;
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut control = CmsgBuf([0; 128]);
    let space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
    debug_assert!(space <= control.0.len());

    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(TernError::Handoff("no room for control message".into()));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd.as_raw_fd());
    }

    let sent = cvt_size(unsafe { libc::sendmsg(channel.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) })?;
    if sent != payload.len() {
        return Err(TernError::Handoff(format!("short handoff write: {} bytes", sent)));
    }
    Ok(())
}

/// Read one handoff message; transferred handles are pushed to `out`.
///
/// Returns payload bytes read (`0` once the channel is closed).
pub fn recv_fds(channel: BorrowedFd<'_>, out: &mut Vec<OwnedFd>) -> Result<usize> {
    let mut payload = [0u8; HANDOFF_PLACEHOLDER.len()];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut control = CmsgBuf([0; 128]);
    let space = unsafe { libc::CMSG_SPACE((MAX_FDS_PER_MESSAGE * size_of::<RawFd>()) as u32) } as usize;

    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space.min(control.0.len()) as _;

    let n = cvt_size(unsafe { libc::recvmsg(channel.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) })?;

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize).saturating_sub(header) / size_of::<RawFd>();
                for i in 0..count {
                    let fd = std::ptr::read_unaligned(data.add(i));
                    out.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        tracing::warn!("handoff control message truncated");
    }
    Ok(n)
}

/// `socketpair(AF_UNIX, SOCK_STREAM)`, both ends non-blocking
pub fn socket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    cvt(unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
