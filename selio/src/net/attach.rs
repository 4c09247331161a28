use std::{os::fd::RawFd, sync::Arc};

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::sys;
use crate::{
  error::{Error, Result, is_would_block},
  pool::{BufferPool, PooledBuf},
  reactor::{Interest, Selectable, SelectorManager},
};

/// Chunk size of the default pool.
const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Pumps bytes between async readers/writers and a connected stream
/// descriptor.
///
/// The attachment borrows the descriptor: it sets it non-blocking and
/// registers it with the selector, but never closes it. Dropping the
/// attachment deregisters it.
pub struct StreamAttachment {
  fd: RawFd,
  selectable: Arc<Selectable>,
  selector: SelectorManager,
  pool: Arc<BufferPool>,
}

impl StreamAttachment {
  pub fn new(selector: &SelectorManager, fd: RawFd) -> Result<Self> {
    sys::set_nonblocking(fd)?;
    sys::disable_sigpipe(fd)?;
    let selectable = selector.selectable(fd)?;

    Ok(Self {
      fd,
      selectable,
      selector: selector.clone(),
      pool: BufferPool::new(2, DEFAULT_CHUNK_SIZE),
    })
  }

  /// Pool the pumps take their chunk buffers from.
  pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
    self.pool = pool;
    self
  }

  /// Copies `reader` into the descriptor until `reader` is exhausted, then
  /// half-closes the write side. Returns the number of bytes written.
  ///
  /// Fails with [`Error::Unflushed`] if the descriptor stopped accepting
  /// bytes first. `remaining` then counts everything not written: the rest
  /// of the current chunk plus whatever `reader` still had.
  pub async fn write_from<R>(&self, mut reader: R) -> Result<u64>
  where
    R: AsyncRead + Unpin,
  {
    let mut chunk = self.borrow().await;
    let mut written = 0u64;

    let outcome = 'pump: loop {
      let n = match reader.read(&mut chunk[..]).await {
        Ok(0) => break Ok(()),
        Ok(n) => n,
        Err(err) => break Err(Error::from(err)),
      };

      let mut offset = 0;
      while offset < n {
        match self.write_some(&chunk[offset..n]).await {
          Ok(k) => {
            offset += k;
            written += k as u64;
          }
          Err(cause) => {
            let unread = drain(&mut reader, &mut chunk).await;
            break 'pump Err(Error::Unflushed {
              remaining: n - offset + unread,
              cause: Some(Box::new(cause)),
            });
          }
        }
      }
    };

    drop(chunk);
    self.shutdown(libc::SHUT_WR);
    tracing::debug!(fd = self.fd, written, "write pump finished");
    outcome.map(|()| written)
  }

  /// Copies the descriptor into `writer` until end of stream, then closes
  /// `writer` and half-closes the read side. Returns the number of bytes
  /// read.
  pub async fn read_into<W>(&self, mut writer: W) -> Result<u64>
  where
    W: AsyncWrite + Unpin,
  {
    let mut buf = self.borrow().await;
    let mut read = 0u64;

    let outcome = loop {
      let n = match self.read_some(&mut buf).await {
        Ok(0) => break Ok(()),
        Ok(n) => n,
        Err(err) => break Err(err),
      };
      if let Err(err) = writer.write_all(&buf[..n]).await {
        break Err(Error::from(err));
      }
      read += n as u64;
    };

    drop(buf);
    let closed = writer.close().await.map_err(Error::from);
    self.shutdown(libc::SHUT_RD);
    tracing::debug!(fd = self.fd, read, "read pump finished");
    outcome.and(closed).map(|()| read)
  }

  pub fn fd(&self) -> RawFd {
    self.fd
  }

  async fn borrow(&self) -> PooledBuf {
    loop {
      if let Some(buf) = self.pool.try_borrow() {
        return buf;
      }
      self.pool.released().await;
    }
  }

  async fn write_some(&self, buf: &[u8]) -> Result<usize> {
    loop {
      match retry_interrupted!(sys::send(self.fd, buf)) {
        Ok(0) => return Err(Error::PeerClosed),
        Ok(n) => return Ok(n),
        Err(err) if is_would_block(&err) => {
          self.selector.select(&self.selectable, Interest::WRITE).await?;
        }
        Err(err) => return Err(err.into()),
      }
    }
  }

  async fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
    loop {
      match retry_interrupted!(sys::recv(self.fd, buf)) {
        Ok(n) => return Ok(n),
        Err(err) if is_would_block(&err) => {
          self.selector.select(&self.selectable, Interest::READ).await?;
        }
        Err(err) => return Err(err.into()),
      }
    }
  }

  fn shutdown(&self, how: libc::c_int) {
    if let Err(err) = sys::shutdown(self.fd, how) {
      tracing::warn!(fd = self.fd, %err, "stream shutdown failed");
    }
  }
}

/// Reads `reader` to its end, returning how many bytes it still held. A read
/// error ends the count.
async fn drain<R>(reader: &mut R, scratch: &mut [u8]) -> usize
where
  R: AsyncRead + Unpin,
{
  let mut unread = 0;
  loop {
    match reader.read(scratch).await {
      Ok(0) | Err(_) => return unread,
      Ok(n) => unread += n,
    }
  }
}

impl Drop for StreamAttachment {
  fn drop(&mut self) {
    self.selector.deregister(&self.selectable);
  }
}
