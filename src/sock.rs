//! Low level socket setup shared by the listener and worker threads.

use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{FromRawFd, OwnedFd};

use anyhow::{Context, Result};

/// Set TCP NODELAY via a standard sync call.
///
/// Used on the listening socket; incoming connections inherit it.
///
/// # Errors
///
/// System setsockopt errors.
pub fn set_nodelay(fd: libc::c_int) -> Result<()> {
    let flag: libc::c_int = 1; // Enable TCP_NODELAY (disable Nagle)
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP, // Protocol
            libc::TCP_NODELAY, // Option
            (&raw const flag).cast::<libc::c_void>(),
            libc::socklen_t::try_from(std::mem::size_of::<libc::c_int>())?,
        )
    };

    if ret == -1 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(())
}

fn set_opt(fd: libc::c_int, level: libc::c_int, opt: libc::c_int) -> Result<()> {
    let flag: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            (&raw const flag).cast::<libc::c_void>(),
            libc::socklen_t::try_from(std::mem::size_of::<libc::c_int>())?,
        )
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Create a nonblocking listening socket with `SO_REUSEPORT` set.
///
/// Every worker thread binds its own listener on the same (ip, port) pair and
/// lets the kernel distribute incoming connections between them.
///
/// # Errors
///
/// Socket/bind/listen failures.
pub fn reuseport_listener(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("socket()");
    }
    // Take ownership immediately so error paths below close the fd.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR).context("setsockopt(SO_REUSEADDR)")?;
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT).context("setsockopt(SO_REUSEPORT)")?;
    set_nodelay(fd)?;

    match addr {
        SocketAddr::V4(a) => {
            let sa = libc::sockaddr_in {
                sin_family: libc::sa_family_t::try_from(libc::AF_INET)?,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            let ret = unsafe {
                libc::bind(
                    fd,
                    (&raw const sa).cast::<libc::sockaddr>(),
                    libc::socklen_t::try_from(std::mem::size_of::<libc::sockaddr_in>())?,
                )
            };
            if ret < 0 {
                return Err(std::io::Error::last_os_error()).context(format!("bind({addr})"));
            }
        }
        SocketAddr::V6(a) => {
            let sa = libc::sockaddr_in6 {
                sin6_family: libc::sa_family_t::try_from(libc::AF_INET6)?,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            let ret = unsafe {
                libc::bind(
                    fd,
                    (&raw const sa).cast::<libc::sockaddr>(),
                    libc::socklen_t::try_from(std::mem::size_of::<libc::sockaddr_in6>())?,
                )
            };
            if ret < 0 {
                return Err(std::io::Error::last_os_error()).context(format!("bind({addr})"));
            }
        }
    }

    if unsafe { libc::listen(fd, 1024) } < 0 {
        return Err(std::io::Error::last_os_error()).context("listen()");
    }
    Ok(TcpListener::from(owned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn two_listeners_same_port() {
        let first = reuseport_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        // A second bind on the same port must succeed thanks to SO_REUSEPORT.
        let second = reuseport_listener(addr).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), addr.port());
    }

    #[test]
    fn listener_is_nonblocking() {
        let l = reuseport_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(l.as_raw_fd() >= 0);
        match l.accept() {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }
}
