//! Reusable receive buffers.
//!
//! A [`BufferPool`] hands out fixed-size buffers as [`PooledBuf`]s. A
//! `PooledBuf` goes back to its pool when it is dropped, which makes the
//! release exactly-once on every path: success, error, or a receive future
//! that was cancelled while suspended.
//!
//! Buffers are allocated lazily, so a large default capacity costs nothing
//! until the buffers are actually needed.
//!
//! ```
//! use selio::BufferPool;
//!
//! let pool = BufferPool::new(2, 1500);
//! let buf = pool.try_borrow().expect("pool has room");
//! assert_eq!(buf.len(), 1500);
//! assert_eq!(pool.available(), 1);
//! drop(buf);
//! assert_eq!(pool.available(), 2);
//! ```

use std::{
  fmt,
  future::Future,
  ops::{Deref, DerefMut},
  pin::Pin,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  task::{Context, Poll, Waker},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// Largest UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

pub struct BufferPool {
  capacity: usize,
  buffer_size: usize,
  free_tx: Sender<Box<[u8]>>,
  free_rx: Receiver<Box<[u8]>>,
  /// Buffers currently checked out.
  outstanding: AtomicUsize,
  waiters: Mutex<Vec<Waker>>,
}

impl BufferPool {
  pub const DEFAULT_CAPACITY: usize = 64;
  pub const DEFAULT_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE;

  /// Creates a pool of at most `capacity` buffers of `buffer_size` bytes.
  ///
  /// # Panics
  ///
  /// Panics if `capacity` or `buffer_size` is zero.
  pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
    assert!(capacity > 0, "BufferPool::new: capacity must be > 0");
    assert!(buffer_size > 0, "BufferPool::new: buffer_size must be > 0");

    let (free_tx, free_rx) = crossbeam_channel::bounded(capacity);
    Arc::new(Self {
      capacity,
      buffer_size,
      free_tx,
      free_rx,
      outstanding: AtomicUsize::new(0),
      waiters: Mutex::new(Vec::new()),
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn buffer_size(&self) -> usize {
    self.buffer_size
  }

  /// Number of buffers that can be borrowed right now.
  pub fn available(&self) -> usize {
    self.capacity - self.outstanding.load(Ordering::Acquire)
  }

  /// Borrows a buffer, or returns `None` if all of them are checked out.
  pub fn try_borrow(self: &Arc<Self>) -> Option<PooledBuf> {
    self
      .outstanding
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
        (n < self.capacity).then_some(n + 1)
      })
      .ok()?;

    let buf = match self.free_rx.try_recv() {
      Ok(buf) => buf,
      Err(_) => vec![0u8; self.buffer_size].into_boxed_slice(),
    };

    Some(PooledBuf { buf: Some(buf), pool: Arc::clone(self) })
  }

  /// Resolves once at least one buffer is available.
  pub fn released(&self) -> Released<'_> {
    Released { pool: self }
  }

  fn release(&self, buf: Box<[u8]>) {
    // Back on the free list before the slot is given up, so a borrower that
    // wins the slot finds the buffer.
    let _ = self.free_tx.try_send(buf);
    let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "BufferPool::release: more releases than borrows");

    for waker in self.waiters.lock().drain(..) {
      waker.wake();
    }
  }
}

impl fmt::Debug for BufferPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BufferPool")
      .field("capacity", &self.capacity)
      .field("buffer_size", &self.buffer_size)
      .field("available", &self.available())
      .finish()
  }
}

/// Future returned by [`BufferPool::released`].
pub struct Released<'a> {
  pool: &'a BufferPool,
}

impl Future for Released<'_> {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    if self.pool.available() > 0 {
      return Poll::Ready(());
    }

    self.pool.waiters.lock().push(cx.waker().clone());

    // A release may have slipped in between the check and the push.
    if self.pool.available() > 0 {
      Poll::Ready(())
    } else {
      Poll::Pending
    }
  }
}

/// A buffer borrowed from a [`BufferPool`].
///
/// Derefs to the whole buffer (`buffer_size` bytes). Returned to the pool
/// on drop.
pub struct PooledBuf {
  buf: Option<Box<[u8]>>,
  pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    self.buf.as_deref().expect("PooledBuf used after release")
  }
}

impl DerefMut for PooledBuf {
  fn deref_mut(&mut self) -> &mut [u8] {
    self.buf.as_deref_mut().expect("PooledBuf used after release")
  }
}

impl Drop for PooledBuf {
  fn drop(&mut self) {
    if let Some(buf) = self.buf.take() {
      self.pool.release(buf);
    }
  }
}
