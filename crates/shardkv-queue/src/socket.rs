//! Nonblocking TCP socket wrappers
//!
//! Thin safe wrappers over the `libc` socket calls the fabric needs.
//! Every socket is created nonblocking and close-on-exec; callers see
//! `io::Result`, with would-block surfacing as
//! `io::ErrorKind::WouldBlock`.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_len(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sin
}

fn socketaddr_from(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(sin.sin_port),
    )
}

/// Open a nonblocking IPv4 stream socket.
pub fn tcp_socket() -> io::Result<RawFd> {
    let fd = cvt(unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;
    Ok(fd)
}

pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let opt: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    let opt: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn bind(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sin = sockaddr_in(addr);
    cvt(unsafe {
        libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

/// Accept one connection. The returned fd is nonblocking with
/// `TCP_NODELAY` left to the caller.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddrV4)> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let new_fd = cvt(unsafe {
        libc::accept4(
            fd,
            &mut sin as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    Ok((new_fd, socketaddr_from(&sin)))
}

/// Start a nonblocking connect. `Ok(true)` means the connection is
/// already established, `Ok(false)` that it is in progress.
pub fn connect(fd: RawFd, addr: SocketAddrV4) -> io::Result<bool> {
    let sin = sockaddr_in(addr);
    let ret = unsafe {
        libc::connect(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => Ok(false),
        _ => Err(err),
    }
}

/// Nonblocking check for write readiness.
pub fn poll_writable(fd: RawFd) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let n = cvt(unsafe { libc::poll(&mut pfd, 1, 0) })?;
    Ok(n > 0 && pfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0)
}

/// Consume and report the pending socket error, if any.
pub fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_len(unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) })
}

/// `MSG_NOSIGNAL` so a peer reset surfaces as `EPIPE` instead of
/// killing the process.
pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_len(unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    })
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Ok(socketaddr_from(&sin))
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_addr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 12345);
        let sin = sockaddr_in(addr);
        assert_eq!(socketaddr_from(&sin), addr);
    }

    #[test]
    fn test_bind_ephemeral_and_getsockname() {
        let fd = tcp_socket().unwrap();
        set_reuseaddr(fd).unwrap();
        bind(fd, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        listen(fd, 16).unwrap();
        let bound = local_addr(fd).unwrap();
        assert_eq!(*bound.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(bound.port(), 0);
        close(fd);
    }

    #[test]
    fn test_accept_would_block_on_idle_listener() {
        let fd = tcp_socket().unwrap();
        bind(fd, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        listen(fd, 16).unwrap();
        let err = accept(fd).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        close(fd);
    }
}
