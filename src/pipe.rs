//! Pipe and fifo endpoints.
//!
//! Each endpoint owns exactly one descriptor, registered with the reactor
//! and opened non-blocking. `pipe` builds an anonymous pair; the fifo
//! constructors cover the named-pipe open semantics, including the
//! read-write guard that keeps a write-only open from failing while no
//! reader exists yet.

use std::io::{self, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, pipe2, read, write};
use std::os::unix::prelude::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Read end of a pipe or fifo.
#[derive(Debug)]
pub struct PipeReader {
    io: AsyncFd<OwnedFd>,
}

/// Write end of a pipe or fifo.
#[derive(Debug)]
pub struct PipeWriter {
    io: AsyncFd<OwnedFd>,
}

impl PipeReader {
    fn new(fd: OwnedFd) -> IoResult<Self> {
        Ok(Self {
            io: AsyncFd::new(fd)?,
        })
    }

    /// The reactor-registered descriptor driving readiness waits.
    pub fn readiness(&self) -> &AsyncFd<OwnedFd> {
        &self.io
    }

    /// Close the descriptor, releasing it exactly once.
    pub fn close(self) -> IoResult<()> {
        close_fd(self.io.into_inner())
    }
}

impl PipeWriter {
    fn new(fd: OwnedFd) -> IoResult<Self> {
        Ok(Self {
            io: AsyncFd::new(fd)?,
        })
    }

    /// The reactor-registered descriptor driving readiness waits.
    pub fn readiness(&self) -> &AsyncFd<OwnedFd> {
        &self.io
    }

    /// Close the descriptor, releasing it exactly once.
    pub fn close(self) -> IoResult<()> {
        close_fd(self.io.into_inner())
    }
}

impl AsFd for PipeReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.io.get_ref().as_fd()
    }
}

impl AsFd for PipeWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.io.get_ref().as_fd()
    }
}

fn close_fd(fd: OwnedFd) -> IoResult<()> {
    // SAFETY: ownership of the descriptor is forfeited here; nothing else
    // can close it again.
    if unsafe { libc::close(fd.into_raw_fd()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<IoResult<()>> {
        loop {
            let mut guard = match self.io.poll_read_ready(cx) {
                Poll::Ready(ready) => ready?,
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| read(inner.get_ref(), unfilled).map_err(io::Error::from)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        loop {
            let mut guard = match self.io.poll_write_ready(cx) {
                Poll::Ready(ready) => ready?,
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| write(inner.get_ref(), buf).map_err(io::Error::from)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        // Pipes hold no user-space buffer.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Create an anonymous pipe pair, non-blocking and close-on-exec.
pub fn pipe() -> IoResult<(PipeReader, PipeWriter)> {
    let (rd, wr) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    Ok((PipeReader::new(rd)?, PipeWriter::new(wr)?))
}

/// Open the fifo at `path` read-only without blocking. The fifo must
/// already exist.
pub fn open<P: AsRef<Path>>(path: P) -> IoResult<PipeReader> {
    PipeReader::new(fifo_fd(path.as_ref(), OFlag::O_RDONLY, Mode::empty())?)
}

/// Open the fifo at `path` read-write, creating it with `0666` (before
/// umask) when absent. Returns both endpoints; each owns its own
/// descriptor.
pub fn create<P: AsRef<Path>>(path: P) -> IoResult<(PipeReader, PipeWriter)> {
    let fd = fifo_fd(
        path.as_ref(),
        OFlag::O_RDWR | OFlag::O_CREAT,
        Mode::from_bits_truncate(0o666),
    )?;
    let wr = fd.try_clone()?;
    Ok((PipeReader::new(fd)?, PipeWriter::new(wr)?))
}

/// Open a fifo with explicit flags, always in non-blocking mode.
///
/// With `O_CREAT` the fifo is created via `mkfifo` with `mode` when it
/// does not already exist. The access mode decides which endpoints come
/// back: `O_RDONLY` a reader, `O_WRONLY` a writer, `O_RDWR` both (the
/// writer on a duplicated descriptor, so each endpoint owns its own).
pub fn open_fifo<P: AsRef<Path>>(
    path: P,
    flags: OFlag,
    mode: Mode,
) -> IoResult<(Option<PipeReader>, Option<PipeWriter>)> {
    let fd = fifo_fd(path.as_ref(), flags, mode)?;
    endpoints(fd, flags & OFlag::O_ACCMODE)
}

/// Open a fifo the blocking way, waiting until a peer shows up.
///
/// A plain write-only fifo open parks until a reader appears (and the
/// mirror case for read-only). The park happens on the blocking pool; the
/// descriptor is switched to non-blocking before it is wired to the
/// reactor.
pub async fn open_fifo_async<P: Into<PathBuf>>(
    path: P,
    flags: OFlag,
    mode: Mode,
) -> IoResult<(Option<PipeReader>, Option<PipeWriter>)> {
    let path = path.into();
    let fd = tokio::task::spawn_blocking(move || -> IoResult<OwnedFd> {
        ensure_fifo(&path, flags, mode)?;
        let open_flags = ((flags & !OFlag::O_CREAT) | OFlag::O_CLOEXEC) & !OFlag::O_NONBLOCK;
        open_raw(&path, open_flags)
    })
    .await
    .map_err(io::Error::other)??;

    fcntl(&fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    endpoints(fd, flags & OFlag::O_ACCMODE)
}

fn fifo_fd(path: &Path, flags: OFlag, mode: Mode) -> IoResult<OwnedFd> {
    ensure_fifo(path, flags, mode)?;

    let access = flags & OFlag::O_ACCMODE;
    let open_flags = (flags & !OFlag::O_CREAT) | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC;

    // A write-only non-blocking open fails with ENXIO until a reader
    // exists; a transient read-write open keeps one on the fifo across
    // the real open.
    let _guard = if access == OFlag::O_WRONLY {
        Some(open_raw(path, OFlag::O_RDWR | OFlag::O_CLOEXEC)?)
    } else {
        None
    };

    open_raw(path, open_flags)
}

fn ensure_fifo(path: &Path, flags: OFlag, mode: Mode) -> IoResult<()> {
    if !flags.contains(OFlag::O_CREAT) {
        return Ok(());
    }
    match std::fs::metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            mkfifo(path, mode)?;
            tracing::debug!(path = %path.display(), ?mode, "created fifo");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn open_raw(path: &Path, flags: OFlag) -> IoResult<OwnedFd> {
    use std::os::unix::fs::OpenOptionsExt;

    let access = flags & OFlag::O_ACCMODE;
    let mut options = std::fs::OpenOptions::new();
    options.read(access == OFlag::O_RDONLY || access == OFlag::O_RDWR);
    options.write(access == OFlag::O_WRONLY || access == OFlag::O_RDWR);
    options.custom_flags((flags & !OFlag::O_ACCMODE).bits());
    Ok(options.open(path)?.into())
}

fn endpoints(
    fd: OwnedFd,
    access: OFlag,
) -> IoResult<(Option<PipeReader>, Option<PipeWriter>)> {
    if access == OFlag::O_RDWR {
        let wr = fd.try_clone()?;
        Ok((Some(PipeReader::new(fd)?), Some(PipeWriter::new(wr)?)))
    } else if access == OFlag::O_WRONLY {
        Ok((None, Some(PipeWriter::new(fd)?)))
    } else {
        Ok((Some(PipeReader::new(fd)?), None))
    }
}
