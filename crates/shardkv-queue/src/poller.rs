//! Readiness facility
//!
//! One epoll instance per service unit. Sockets are registered when
//! their queue is created; the interest mask grows additively as push
//! and pop operations arm write and read readiness, and is cleared only
//! when the queue closes. The hot wait path discovers readiness through
//! nonblocking syscall results; the poller carries the registration
//! state and answers explicit `poll` calls.

use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;

use crate::socket;

/// Readiness directions a queue has armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(2);

    #[inline]
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn epoll_bits(self) -> u32 {
        let mut bits = 0;
        if self.contains(Interest::READABLE) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Interest::WRITABLE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    fn from_epoll_bits(bits: u32) -> Self {
        let mut interest = Interest::NONE;
        if bits & (libc::EPOLLIN as u32 | libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0 {
            interest |= Interest::READABLE;
        }
        if bits & (libc::EPOLLOUT as u32 | libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0 {
            interest |= Interest::WRITABLE;
        }
        interest
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// A readiness event: the registration token plus the ready directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub ready: Interest,
}

const MAX_EVENTS: usize = 64;

/// Epoll wrapper owning the epoll fd.
#[derive(Debug)]
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.epoll_bits(),
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Register a socket under `token` with an initial interest mask.
    pub fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    /// Replace the interest mask of a registered socket.
    pub fn reregister(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Harvest ready events. `timeout_ms` of zero polls without
    /// sleeping; negative blocks until an event arrives.
    pub fn poll(&self, timeout_ms: i32) -> io::Result<Vec<Event>> {
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        Ok(raw[..n as usize]
            .iter()
            .map(|ev| Event {
                token: ev.u64,
                ready: Interest::from_epoll_bits(ev.events),
            })
            .collect())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        socket::close(self.epfd);
    }
}
