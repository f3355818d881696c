//! Kernel zero-copy transfer primitives.
//!
//! `async_splice` moves bytes between two descriptors and consumes them
//! from the source; `async_tee` duplicates bytes while leaving the source
//! buffer intact. Both run non-blocking and resolve readiness through the
//! reactor, with a `poll(2)` probe to tell which side actually blocked.

use nix::errno::Errno;
use nix::fcntl::{SpliceFFlags, splice, tee};
use std::io::{self, Result as IoResult};
use std::os::unix::prelude::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};

/// Upper bound for a single splice/tee request. The kernel moves at most
/// one pipe buffer per call, so this only needs to be comfortably larger.
const MAX_CHUNK: usize = 1 << 30;

/// How much a transfer is allowed to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Keep moving until end of stream.
    Unbounded,
    /// Move at most this many bytes. `Limited(0)` completes immediately.
    Limited(u64),
}

impl Budget {
    fn spent(&self) -> bool {
        matches!(self, Budget::Limited(0))
    }

    fn request(&self) -> usize {
        match *self {
            Budget::Unbounded => MAX_CHUNK,
            Budget::Limited(n) => n.min(MAX_CHUNK as u64) as usize,
        }
    }

    fn consume(&mut self, n: u64) {
        if let Budget::Limited(remain) = self {
            *remain -= n.min(*remain);
        }
    }
}

/// Why a transfer stopped, paired with the byte count it reached.
#[derive(Debug)]
pub enum Stop {
    /// The budget was exhausted (or the request was complete).
    Done,
    /// Zero bytes moved with no error: the source hit end of stream.
    Eof,
    /// The source had nothing more to offer without blocking.
    WouldBlock,
    /// A non-retryable error. Transient outcomes (EAGAIN, EINTR) never
    /// surface here.
    Fault(io::Error),
}

/// A descriptor usable by the zero-copy paths.
///
/// Pipes and other pollable descriptors are registered with the reactor
/// and drive real readiness waits. Regular files cannot be registered
/// with epoll at all, but `poll(2)` reports them perpetually ready, so
/// they ride along as `Always` and never suspend.
pub enum Descriptor<'a> {
    Registered(&'a AsyncFd<OwnedFd>),
    Always(BorrowedFd<'a>),
}

impl<'a> Descriptor<'a> {
    fn fd(&self) -> BorrowedFd<'_> {
        match self {
            Descriptor::Registered(io) => io.get_ref().as_fd(),
            Descriptor::Always(fd) => *fd,
        }
    }

    async fn readable(&self) -> IoResult<Option<AsyncFdReadyGuard<'a, OwnedFd>>> {
        match self {
            Descriptor::Registered(io) => Ok(Some(io.readable().await?)),
            Descriptor::Always(_) => Ok(None),
        }
    }

    async fn writable(&self) -> IoResult<Option<AsyncFdReadyGuard<'a, OwnedFd>>> {
        match self {
            Descriptor::Registered(io) => Ok(Some(io.writable().await?)),
            Descriptor::Always(_) => Ok(None),
        }
    }
}

/// Consuming zero-copy move from `src` to `dst`.
///
/// `EINTR` is retried immediately without touching the budget. Zero bytes
/// moved with no error is end of stream. `block_on_empty` selects what an
/// empty source means: the bridge waits for more data, a fan-out pass
/// hands control back to its caller.
pub async fn async_splice(
    src: &Descriptor<'_>,
    dst: &Descriptor<'_>,
    mut budget: Budget,
    block_on_empty: bool,
) -> (u64, Stop) {
    if budget.spent() {
        return (0, Stop::Done);
    }

    let mut read_ready = match src.readable().await {
        Ok(guard) => guard,
        Err(e) => return (0, Stop::Fault(e)),
    };
    let mut write_ready = match dst.writable().await {
        Ok(guard) => guard,
        Err(e) => return (0, Stop::Fault(e)),
    };

    let flags =
        SpliceFFlags::SPLICE_F_NONBLOCK | SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_MORE;
    let mut moved = 0u64;

    loop {
        match splice(src.fd(), None, dst.fd(), None, budget.request(), flags) {
            Ok(0) => break (moved, Stop::Eof),
            Ok(n) => {
                moved += n as u64;
                budget.consume(n as u64);
                if budget.spent() {
                    break (moved, Stop::Done);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) if e == Errno::EWOULDBLOCK => {
                // Tokio may arm epoll in edge-triggered mode, so cached
                // readiness cannot be cleared blindly; a zero-timeout
                // poll(2) is level-triggered and tells which side is the
                // one that actually blocked.
                let (readable, writable) =
                    match poll_readiness(src.fd().as_raw_fd(), dst.fd().as_raw_fd()) {
                        Ok(state) => state,
                        Err(e) => break (moved, Stop::Fault(e)),
                    };

                if !readable {
                    if let Some(guard) = read_ready.as_mut() {
                        guard.clear_ready();
                    }
                    if !block_on_empty {
                        break (moved, Stop::WouldBlock);
                    }
                    read_ready = match src.readable().await {
                        Ok(guard) => guard,
                        Err(e) => break (moved, Stop::Fault(e)),
                    };
                }

                if !writable {
                    if let Some(guard) = write_ready.as_mut() {
                        guard.clear_ready();
                    }
                    write_ready = match dst.writable().await {
                        Ok(guard) => guard,
                        Err(e) => break (moved, Stop::Fault(e)),
                    };
                }
            }
            Err(e) => break (moved, Stop::Fault(io::Error::from_raw_os_error(e as i32))),
        }
    }
}

/// Non-consuming duplication of up to `limit` bytes from the head of the
/// `src` pipe buffer into `dst`.
///
/// This is a single kernel attempt once the destination is writable:
/// `tee(2)` always duplicates from the head of the source buffer, so a
/// retry after partial progress would hand the destination the same bytes
/// twice. The only retried case is `EAGAIN` with zero progress, and only
/// when the probe shows the destination is the blocked side.
pub async fn async_tee(
    src: &AsyncFd<OwnedFd>,
    dst: &AsyncFd<OwnedFd>,
    limit: Option<u64>,
) -> (u64, Stop) {
    let len = match limit {
        Some(0) => return (0, Stop::Done),
        Some(n) => n.min(MAX_CHUNK as u64) as usize,
        None => MAX_CHUNK,
    };

    let mut read_ready = match src.readable().await {
        Ok(guard) => guard,
        Err(e) => return (0, Stop::Fault(e)),
    };
    let mut write_ready = match dst.writable().await {
        Ok(guard) => guard,
        Err(e) => return (0, Stop::Fault(e)),
    };

    loop {
        match tee(src.get_ref(), dst.get_ref(), len, SpliceFFlags::SPLICE_F_NONBLOCK) {
            Ok(0) => break (0, Stop::Eof),
            Ok(n) => break (n as u64, Stop::Done),
            Err(Errno::EINTR) => continue,
            Err(e) if e == Errno::EWOULDBLOCK => {
                let (readable, writable) = match poll_readiness(src.as_raw_fd(), dst.as_raw_fd()) {
                    Ok(state) => state,
                    Err(e) => break (0, Stop::Fault(e)),
                };

                if !readable {
                    read_ready.clear_ready();
                    break (0, Stop::WouldBlock);
                }

                if !writable {
                    write_ready.clear_ready();
                    write_ready = match dst.writable().await {
                        Ok(guard) => guard,
                        Err(e) => break (0, Stop::Fault(e)),
                    };
                }
            }
            Err(e) => break (0, Stop::Fault(io::Error::from_raw_os_error(e as i32))),
        }
    }
}

/// Zero-timeout poll of both descriptors. Level-triggered and free of any
/// registration, unlike the reactor's cached readiness.
fn poll_readiness(reader: RawFd, writer: RawFd) -> IoResult<(bool, bool)> {
    use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, poll, pollfd};

    let mut fds = [
        pollfd {
            fd: reader,
            events: POLLIN,
            revents: 0,
        },
        pollfd {
            fd: writer,
            events: POLLOUT,
            revents: 0,
        },
    ];

    let ret = unsafe { poll(&mut fds[0], 2, 0) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }

    if fds[0].revents & POLLNVAL != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "fd of reader is invalid",
        ));
    }
    if fds[1].revents & POLLNVAL != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "fd of writer is invalid",
        ));
    }

    // POLLHUP/POLLERR count as ready: the next attempt will observe the
    // condition (EOF or an errno) instead of parking forever.
    let is_read_ready = fds[0].revents & (POLLIN | POLLERR | POLLHUP) != 0;
    let is_write_ready = fds[1].revents & (POLLOUT | POLLERR | POLLHUP) != 0;

    Ok((is_read_ready, is_write_ready))
}
