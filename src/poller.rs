//! Readiness multiplexer wrapping epoll.
//!
//! Each worker thread owns one `Poller`. Connections are registered with
//! `EPOLLONESHOT` so a socket that becomes ready is reported exactly once and
//! stays quiet until it is re-armed, which keeps a connection from being
//! dispatched to two threads at the same time.
//!
//! The connection slot id is packed into `epoll_event.u64` as the dispatch
//! token, with the listening socket on a reserved token.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Token for the listening socket. Connection tokens count up from 0.
pub const TOKEN_LISTENER: u64 = u64::MAX;

/// Readiness interest, and the readiness reported back by `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITE: Self = Self {
        readable: false,
        writable: true,
    };
    pub const BOTH: Self = Self {
        readable: true,
        writable: true,
    };

    fn epoll_bits(self, oneshot: bool) -> u32 {
        let mut ev = libc::EPOLLRDHUP as u32;
        if self.readable {
            ev |= libc::EPOLLIN as u32;
        }
        if self.writable {
            ev |= libc::EPOLLOUT as u32;
        }
        if oneshot {
            ev |= libc::EPOLLONESHOT as u32;
        }
        ev
    }
}

/// One readiness report from `wait`.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the socket errored. When readable data is also
    /// pending the owner drains it first and observes EOF from the read.
    pub hangup: bool,
}

/// epoll instance plus the live-registration counter the shutdown sequence
/// drains against.
pub struct Poller {
    epfd: OwnedFd,
    live: AtomicUsize,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            live: AtomicUsize::new(0),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, bits: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: bits,
            u64: token,
        };
        let ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &raw mut ev
        };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, ptr) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register a connection socket. One-shot: after the first readiness
    /// report the registration is disarmed until `modify` re-arms it.
    pub fn add(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest.epoll_bits(true))?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Register the listening socket. Level triggered and never disarmed, so
    /// a pending accept backlog keeps waking the worker. Does not count as a
    /// live connection.
    pub fn add_listener(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            TOKEN_LISTENER,
            libc::EPOLLIN as u32,
        )
    }

    /// Re-arm (or change) the interest set for a connection.
    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest.epoll_bits(true))
    }

    /// Drop a connection from the interest set.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)?;
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// Remove the listening socket. Used at shutdown so no new connections
    /// arrive while draining.
    pub fn remove_listener(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Block until at least one registered fd is ready or the timeout
    /// expires, and push the reports into `events`.
    ///
    /// Returns the number of events. Zero means the timeout fired; the worker
    /// uses that tick for idle-connection housekeeping.
    pub fn wait(&self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize> {
        events.clear();
        const MAX_EVENTS: usize = 1024;
        let mut raw: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let ms = libc::c_int::try_from(timeout.as_millis().min(i32::MAX as u128))
            .unwrap_or(libc::c_int::MAX);
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                raw.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        for ev in raw.iter().take(usize::try_from(n).unwrap_or(0)) {
            let hangup =
                ev.events & (libc::EPOLLHUP as u32 | libc::EPOLLERR as u32 | libc::EPOLLRDHUP as u32)
                    != 0;
            events.push(Event {
                token: ev.u64,
                readable: ev.events & libc::EPOLLIN as u32 != 0,
                writable: ev.events & libc::EPOLLOUT as u32 != 0,
                hangup,
            });
        }
        Ok(events.len())
    }
}
