//! Point-to-point bridging between pipe endpoints and generic streams.
//!
//! `receive_from` and `send_to` take the kernel zero-copy path whenever
//! the peer stream exposes a raw descriptor and fall back to an ordinary
//! buffered copy loop when it does not. The two paths are
//! indistinguishable in outcome; only throughput differs.

use std::any::Any;
use std::io::Result as IoResult;
use std::os::unix::prelude::{AsRawFd, BorrowedFd};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pipe::{PipeReader, PipeWriter};
use crate::splice::{Budget, Descriptor, Stop, async_splice};

/// Buffer size for the user-space fallback loop.
const FALLBACK_BUFFER_SIZE: usize = 64 * 1024;

/// A byte source the bridge can pull from.
///
/// Implemented for every async reader; the bridge probes for the raw
/// descriptor capability at runtime.
pub trait SpliceRead: AsyncRead + Send + Unpin {
    fn as_any(&self) -> &dyn Any;

    /// Raw descriptor capability, when the stream has one.
    fn descriptor(&self) -> Option<Descriptor<'_>>;
}

impl<T> SpliceRead for T
where
    T: AsyncRead + Send + Unpin + 'static,
{
    // Specialization is still unstable, so capability probing goes
    // through dyn Any instead.
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn descriptor(&self) -> Option<Descriptor<'_>> {
        if let Some(reader) = self.as_any().downcast_ref::<PipeReader>() {
            Some(Descriptor::Registered(reader.readiness()))
        } else if let Some(file) = self.as_any().downcast_ref::<tokio::fs::File>() {
            // Regular files refuse epoll registration but poll as always
            // ready, which is exactly what Descriptor::Always models.
            // SAFETY: the descriptor stays open for the borrow of `self`.
            Some(Descriptor::Always(unsafe {
                BorrowedFd::borrow_raw(file.as_raw_fd())
            }))
        } else {
            None
        }
    }
}

/// A byte sink the bridge can push into. Mirror of [`SpliceRead`].
pub trait SpliceWrite: AsyncWrite + Send + Unpin {
    fn as_any(&self) -> &dyn Any;

    /// Raw descriptor capability, when the stream has one.
    fn descriptor(&self) -> Option<Descriptor<'_>>;
}

impl<T> SpliceWrite for T
where
    T: AsyncWrite + Send + Unpin + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn descriptor(&self) -> Option<Descriptor<'_>> {
        if let Some(writer) = self.as_any().downcast_ref::<PipeWriter>() {
            Some(Descriptor::Registered(writer.readiness()))
        } else if let Some(file) = self.as_any().downcast_ref::<tokio::fs::File>() {
            // SAFETY: the descriptor stays open for the borrow of `self`.
            Some(Descriptor::Always(unsafe {
                BorrowedFd::borrow_raw(file.as_raw_fd())
            }))
        } else {
            None
        }
    }
}

impl PipeWriter {
    /// Pull bytes from `src` into this pipe until end of stream, or until
    /// `limit` bytes have moved. A limit of zero is an immediate no-op.
    pub async fn receive_from<R>(&mut self, src: &mut R, limit: Option<u64>) -> IoResult<u64>
    where
        R: SpliceRead + ?Sized,
    {
        let budget = match limit {
            Some(0) => return Ok(0),
            Some(n) => Budget::Limited(n),
            None => Budget::Unbounded,
        };

        if let Some(desc) = <R as SpliceRead>::descriptor(src) {
            let dst = Descriptor::Registered(self.readiness());
            let (moved, stop) = async_splice(&desc, &dst, budget, true).await;
            return match stop {
                Stop::Fault(e) => Err(e),
                _ => Ok(moved),
            };
        }

        copy_buffered(src, self, limit).await
    }
}

impl PipeReader {
    /// Push bytes from this pipe into `dst` until end of stream.
    pub async fn send_to<W>(&mut self, dst: &mut W) -> IoResult<u64>
    where
        W: SpliceWrite + ?Sized,
    {
        if let Some(desc) = <W as SpliceWrite>::descriptor(dst) {
            let src = Descriptor::Registered(self.readiness());
            let (moved, stop) = async_splice(
                &src,
                &desc,
                Budget::Unbounded,
                true,
            )
            .await;
            return match stop {
                Stop::Fault(e) => Err(e),
                _ => Ok(moved),
            };
        }

        copy_buffered(self, dst, None).await
    }
}

async fn copy_buffered<R, W>(src: &mut R, dst: &mut W, limit: Option<u64>) -> IoResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; FALLBACK_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let want = match limit {
            Some(limit) if total >= limit => break,
            Some(limit) => (limit - total).min(buf.len() as u64) as usize,
            None => buf.len(),
        };
        let len = src.read(&mut buf[..want]).await?;
        if len == 0 {
            break;
        }
        dst.write_all(&buf[..len]).await?;
        total += len as u64;
    }
    dst.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use std::io::Cursor;

    #[tokio::test]
    async fn zero_limit_short_circuits_both_paths() {
        let (_pipe_reader, mut pipe_writer) = pipe().unwrap();

        let mut cursor = Cursor::new(vec![1u8; 128]);
        let moved = pipe_writer.receive_from(&mut cursor, Some(0)).await.unwrap();
        assert_eq!(moved, 0);
        assert_eq!(cursor.position(), 0);

        let (mut other_reader, _other_writer) = pipe().unwrap();
        let moved = pipe_writer
            .receive_from(&mut other_reader, Some(0))
            .await
            .unwrap();
        assert_eq!(moved, 0);
    }

    #[tokio::test]
    async fn fallback_copy_is_bounded_and_complete() {
        let (mut reader, mut writer) = pipe().unwrap();
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();

        let mut cursor = Cursor::new(data.clone());
        let moved = writer.receive_from(&mut cursor, Some(1000)).await.unwrap();
        assert_eq!(moved, 1000);
        drop(writer);

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, &data[..1000]);
    }
}
