//! Readiness reactor.
//!
//! A [`SelectorManager`] owns one OS poller and one background thread that
//! blocks in it. Tasks hand it a [`Selectable`] plus an [`Interest`] through
//! [`SelectorManager::select`] and are woken once the OS reports that
//! readiness. Interests are armed one-shot: a fired interest is dropped from
//! the pending set and has to be selected again, which is exactly what the
//! retry loops in `net` do after a would-block.

mod interest;
mod selectable;
pub(crate) mod sys;

pub use interest::Interest;
pub use selectable::Selectable;

use std::{
  collections::HashMap,
  fmt,
  future::Future,
  io,
  os::fd::RawFd,
  pin::Pin,
  sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
  },
  task::{Context, Poll, Waker},
  thread::{self, JoinHandle},
  time::Duration,
};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use selectable::SelectableState;
use sys::{Event, Events, OsPoller, ReadinessPoll};

/// Tuning knobs of a [`SelectorManager`].
#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
  events_capacity: usize,
  poll_timeout: Option<Duration>,
}

impl Default for ReactorConfig {
  fn default() -> Self {
    Self { events_capacity: 512, poll_timeout: None }
  }
}

impl ReactorConfig {
  /// Maximum number of events fetched by one poll call.
  ///
  /// # Panics
  ///
  /// Panics if `capacity` is zero.
  pub fn events_capacity(mut self, capacity: usize) -> Self {
    assert!(capacity > 0, "ReactorConfig: events_capacity must be > 0");
    self.events_capacity = capacity;
    self
  }

  /// Upper bound for one blocking poll call. Unbounded by default: the
  /// poll thread is woken explicitly on close.
  pub fn poll_timeout(mut self, timeout: Duration) -> Self {
    self.poll_timeout = Some(timeout);
    self
  }
}

#[derive(Debug)]
enum Status {
  Running,
  Closed,
  Failed(Arc<io::Error>),
}

struct Inner {
  /// Taken on close, so the poller descriptor goes away with the thread.
  poller: RwLock<Option<Arc<OsPoller>>>,
  table: Mutex<HashMap<u64, Arc<Selectable>>>,
  status: Mutex<Status>,
  next_key: AtomicU64,
  thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running reactor. Cheap to clone.
#[derive(Clone)]
pub struct SelectorManager {
  inner: Arc<Inner>,
}

impl SelectorManager {
  pub fn new() -> Result<Self> {
    Self::with_config(ReactorConfig::default())
  }

  pub fn with_config(config: ReactorConfig) -> Result<Self> {
    let poller = Arc::new(OsPoller::new()?);

    let inner = Arc::new(Inner {
      poller: RwLock::new(Some(Arc::clone(&poller))),
      table: Mutex::new(HashMap::new()),
      status: Mutex::new(Status::Running),
      next_key: AtomicU64::new(0),
      thread: Mutex::new(None),
    });

    let weak = Arc::downgrade(&inner);
    let handle = thread::Builder::new()
      .name("selio-selector".into())
      .spawn(move || run(weak, poller, config))?;
    *inner.thread.lock() = Some(handle);

    tracing::debug!(
      events_capacity = config.events_capacity,
      "selector started"
    );
    Ok(Self { inner })
  }

  /// Registers `fd` with this reactor.
  ///
  /// The descriptor must be non-blocking and stay open until it is
  /// [deregistered](Self::deregister).
  pub fn selectable(&self, fd: RawFd) -> Result<Arc<Selectable>> {
    self.inner.check()?;

    let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
    let selectable = Arc::new(Selectable::new(fd, key));
    self.inner.table.lock().insert(key, Arc::clone(&selectable));

    tracing::trace!(fd, key, "selectable registered");
    Ok(selectable)
  }

  /// Resolves once `selectable` is ready for `interest`, which has to be
  /// either [`Interest::READ`] or [`Interest::WRITE`].
  pub fn select(
    &self,
    selectable: &Arc<Selectable>,
    interest: Interest,
  ) -> Select {
    assert!(
      interest == Interest::READ || interest == Interest::WRITE,
      "select takes a single interest, got {interest:?}"
    );
    Select {
      inner: Arc::clone(&self.inner),
      selectable: Arc::clone(selectable),
      interest,
      parked_at: None,
    }
  }

  /// Removes `selectable` from the reactor. Tasks waiting on it fail with
  /// [`Error::SocketClosed`]. Calling this twice is a no-op.
  pub fn deregister(&self, selectable: &Selectable) {
    let wakers = {
      let mut state = selectable.lock();
      if state.closed {
        return;
      }
      state.closed = true;
      state.pending = Interest::NONE;

      if state.registered {
        state.registered = false;
        if let Some(poller) = self.inner.poller.read().as_ref() {
          match poller.delete(selectable.fd()) {
            Err(err) if err.raw_os_error() != Some(libc::ENOENT) => {
              tracing::warn!(
                fd = selectable.fd(),
                %err,
                "failed to deregister"
              );
            }
            _ => {}
          }
        }
      }
      state.take_wakers()
    };

    self.inner.table.lock().remove(&selectable.key());
    tracing::trace!(fd = selectable.fd(), "selectable deregistered");
    wakers.into_iter().for_each(Waker::wake);
  }

  /// Stops the poll thread and releases the poller. Waiting tasks fail with
  /// [`Error::ReactorClosed`]. Calling this twice is a no-op.
  pub fn close(&self) {
    {
      let mut status = self.inner.status.lock();
      if matches!(*status, Status::Running) {
        *status = Status::Closed;
      }
    }

    let poller = self.inner.poller.write().take();
    if let Some(Err(err)) = poller.as_ref().map(|poller| poller.notify()) {
      tracing::warn!(%err, "failed to wake the selector thread");
    }

    let handle = self.inner.thread.lock().take();
    if let Some(handle) = handle {
      if handle.thread().id() != thread::current().id()
        && handle.join().is_err()
      {
        tracing::warn!("selector thread panicked");
      }
    }

    self.inner.wake_all();
    if poller.is_some() {
      tracing::debug!("selector closed");
    }
  }

  pub fn is_closed(&self) -> bool {
    !matches!(*self.inner.status.lock(), Status::Running)
  }
}

impl fmt::Debug for SelectorManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SelectorManager")
      .field("status", &*self.inner.status.lock())
      .field("registered", &self.inner.table.lock().len())
      .finish()
  }
}

impl Inner {
  fn check(&self) -> Result<()> {
    match &*self.status.lock() {
      Status::Running => Ok(()),
      Status::Closed => Err(Error::ReactorClosed),
      Status::Failed(err) => Err(Error::ReactorFailed(Arc::clone(err))),
    }
  }

  /// Arms `interest` (the full pending set) for `selectable`.
  fn arm(
    &self,
    selectable: &Selectable,
    state: &mut SelectableState,
    interest: Interest,
  ) -> Result<()> {
    let poller = self.poller.read();
    let Some(poller) = poller.as_ref() else {
      return Err(self.check().err().unwrap_or(Error::ReactorClosed));
    };

    if state.registered {
      poller.modify(selectable.fd(), selectable.key(), interest)?;
    } else {
      poller.add(selectable.fd(), selectable.key(), interest)?;
      state.registered = true;
    }
    state.pending = interest;
    Ok(())
  }

  fn dispatch(&self, event: Event) {
    let Some(selectable) = self.table.lock().get(&event.key).cloned() else {
      return;
    };

    let wakers = {
      let mut state = selectable.lock();
      let fired = event.interest.intersect(state.pending);
      if fired.is_none() {
        return;
      }
      tracing::trace!(fd = selectable.fd(), ?fired, "readiness");
      let mut wakers = state.fire(fired);

      // epoll disarms the whole descriptor after any event.
      let remaining = state.pending;
      if !remaining.is_none() {
        if let Err(err) = self.arm(&selectable, &mut state, remaining) {
          tracing::warn!(fd = selectable.fd(), %err, "failed to re-arm");
          // Let the waiters find out from their next syscall.
          wakers.extend(state.fire(remaining));
        }
      }
      wakers
    };

    wakers.into_iter().for_each(Waker::wake);
  }

  fn fail(&self, err: io::Error) {
    *self.status.lock() = Status::Failed(Arc::new(err));
    self.wake_all();
  }

  fn wake_all(&self) {
    let selectables: Vec<_> = self.table.lock().values().cloned().collect();
    for selectable in selectables {
      let wakers = selectable.lock().take_wakers();
      wakers.into_iter().for_each(Waker::wake);
    }
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    // The last handle is gone: stop the thread without joining it, this may
    // run on the selector thread itself.
    if let Some(poller) = self.poller.get_mut().take() {
      *self.status.get_mut() = Status::Closed;
      let _ = poller.notify();
    }
  }
}

fn run(weak: Weak<Inner>, poller: Arc<OsPoller>, config: ReactorConfig) {
  let mut events = Events::with_capacity(config.events_capacity);

  loop {
    let result =
      retry_interrupted!(events.wait_on(&poller, config.poll_timeout));

    let Some(inner) = weak.upgrade() else { break };

    if let Err(err) = result {
      tracing::warn!(%err, "selector poll failed");
      inner.fail(err);
      break;
    }
    if inner.check().is_err() {
      break;
    }

    if events.notified() {
      if let Err(err) = poller.acknowledge() {
        tracing::warn!(%err, "failed to acknowledge selector wake-up");
      }
    }
    for event in events.iter() {
      inner.dispatch(event);
    }
  }

  tracing::debug!("selector thread exited");
}

/// Future returned by [`SelectorManager::select`].
#[must_use = "futures do nothing unless polled"]
pub struct Select {
  inner: Arc<Inner>,
  selectable: Arc<Selectable>,
  interest: Interest,
  /// Epoch of the direction when this select first parked.
  parked_at: Option<u64>,
}

impl Future for Select {
  type Output = Result<()>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
    let this = self.get_mut();
    let interest = this.interest;
    let mut state = this.selectable.lock();

    if state.closed {
      return Poll::Ready(Err(Error::SocketClosed));
    }
    this.inner.check()?;

    // Only a fire after this select parked counts, never an older one.
    let epoch = state.waiter(interest).epoch;
    match this.parked_at {
      Some(parked_at) if parked_at != epoch => return Poll::Ready(Ok(())),
      Some(_) => {}
      None => this.parked_at = Some(epoch),
    }

    if !state.pending.contains(interest) {
      let armed = state.pending | interest;
      this.inner.arm(&this.selectable, &mut state, armed)?;
    }
    state.waiter(interest).park(cx.waker());

    tracing::trace!(fd = this.selectable.fd(), ?interest, "would block");
    Poll::Pending
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::{FutureExt, executor::block_on};
  use std::os::fd::AsRawFd;
  use std::sync::atomic::AtomicUsize;
  use sys::tests::create_socket_pair;

  fn write_byte(fd: RawFd) {
    let byte = 1u8;
    syscall!(write(fd, &byte as *const u8 as *const libc::c_void, 1))
      .expect("write");
  }

  #[test]
  fn select_read_after_peer_writes() {
    let selector = SelectorManager::new().unwrap();
    let (a, b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    let mut select = selector.select(&selectable, Interest::READ);
    assert!((&mut select).now_or_never().is_none());
    assert_eq!(selectable.interest(), Interest::READ);

    write_byte(b.as_raw_fd());
    block_on(select).unwrap();
    assert!(selectable.interest().is_none());

    selector.close();
  }

  struct CountingWaker(AtomicUsize);

  impl std::task::Wake for CountingWaker {
    fn wake(self: Arc<Self>) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  /// Gives the poll thread up to a second to make `done` true.
  fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
      if done() {
        return;
      }
      thread::sleep(Duration::from_millis(5));
    }
    panic!("poll thread never got there");
  }

  #[test]
  fn every_parked_reader_is_resumed() {
    let selector = SelectorManager::new().unwrap();
    let (a, b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    let counters: Vec<_> =
      (0..2).map(|_| Arc::new(CountingWaker(AtomicUsize::new(0)))).collect();
    let wakers: Vec<_> =
      counters.iter().map(|c| Waker::from(Arc::clone(c))).collect();
    let mut selects: Vec<_> = (0..2)
      .map(|_| Box::pin(selector.select(&selectable, Interest::READ)))
      .collect();

    for (select, waker) in selects.iter_mut().zip(&wakers) {
      let mut cx = Context::from_waker(waker);
      assert!(select.as_mut().poll(&mut cx).is_pending());
    }

    write_byte(b.as_raw_fd());
    wait_until(|| counters.iter().all(|c| c.0.load(Ordering::SeqCst) > 0));

    for (i, counter) in counters.iter().enumerate() {
      assert_eq!(counter.0.load(Ordering::SeqCst), 1, "reader {i} not woken");
    }
    for (select, waker) in selects.iter_mut().zip(&wakers) {
      let mut cx = Context::from_waker(waker);
      assert!(matches!(select.as_mut().poll(&mut cx), Poll::Ready(Ok(()))));
    }
    selector.close();
  }

  #[test]
  fn readiness_is_not_handed_to_a_later_select() {
    let selector = SelectorManager::new().unwrap();
    let (a, b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    let mut cancelled = selector.select(&selectable, Interest::READ);
    assert!((&mut cancelled).now_or_never().is_none());
    write_byte(b.as_raw_fd());
    wait_until(|| selectable.interest().is_none());
    drop(cancelled);

    // Consume the byte, so the socket is no longer readable.
    let mut byte = 0u8;
    let buf = &mut byte as *mut u8 as *mut libc::c_void;
    syscall!(read(a.as_raw_fd(), buf, 1)).expect("read");

    let mut next = selector.select(&selectable, Interest::READ);
    assert!((&mut next).now_or_never().is_none());
    assert!(selectable.interest().is_readable());
    selector.close();
  }

  #[test]
  fn failure_reaches_waiters_and_new_registrations() {
    let selector = SelectorManager::new().unwrap();
    let (a, _b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    let mut read = selector.select(&selectable, Interest::READ);
    assert!((&mut read).now_or_never().is_none());

    selector.inner.fail(io::Error::from_raw_os_error(libc::EBADF));

    match block_on(read) {
      Err(Error::ReactorFailed(err)) => {
        assert_eq!(err.raw_os_error(), Some(libc::EBADF))
      }
      other => panic!("expected a reactor failure, got {other:?}"),
    }
    assert!(selector.is_closed());
    assert!(matches!(
      selector.selectable(a.as_raw_fd()),
      Err(Error::ReactorFailed(_))
    ));
    assert!(matches!(
      block_on(selector.select(&selectable, Interest::WRITE)),
      Err(Error::ReactorFailed(_))
    ));
  }

  #[test]
  fn write_is_ready_on_a_fresh_socket() {
    let selector = SelectorManager::new().unwrap();
    let (a, _b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    block_on(selector.select(&selectable, Interest::WRITE)).unwrap();
    selector.close();
  }

  #[test]
  fn read_and_write_resume_independently() {
    let selector = SelectorManager::new().unwrap();
    let (a, b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    let mut read = selector.select(&selectable, Interest::READ);
    assert!((&mut read).now_or_never().is_none());

    // The write side fires while read stays parked and armed.
    block_on(selector.select(&selectable, Interest::WRITE)).unwrap();
    assert!((&mut read).now_or_never().is_none());
    assert!(selectable.interest().is_readable());

    write_byte(b.as_raw_fd());
    block_on(read).unwrap();
    selector.close();
  }

  #[test]
  fn deregister_fails_waiters() {
    let selector = SelectorManager::new().unwrap();
    let (a, _b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    let mut read = selector.select(&selectable, Interest::READ);
    assert!((&mut read).now_or_never().is_none());

    selector.deregister(&selectable);
    selector.deregister(&selectable);
    assert!(selectable.is_closed());
    assert!(matches!(block_on(read), Err(Error::SocketClosed)));
    selector.close();
  }

  #[test]
  fn close_fails_pending_select() {
    let selector = SelectorManager::new().unwrap();
    let (a, _b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    let closer = selector.clone();
    let handle = thread::spawn(move || {
      thread::sleep(Duration::from_millis(50));
      closer.close();
    });

    let res = block_on(selector.select(&selectable, Interest::READ));
    handle.join().unwrap();
    assert!(matches!(res, Err(Error::ReactorClosed)));
  }

  #[test]
  fn closed_selector_rejects_new_work() {
    let selector = SelectorManager::new().unwrap();
    let (a, _b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    selector.close();
    selector.close();
    assert!(selector.is_closed());
    assert!(matches!(
      selector.selectable(a.as_raw_fd()),
      Err(Error::ReactorClosed)
    ));
    assert!(matches!(
      block_on(selector.select(&selectable, Interest::WRITE)),
      Err(Error::ReactorClosed)
    ));
  }

  #[test]
  fn poll_timeout_keeps_the_loop_alive() {
    let config = ReactorConfig::default()
      .events_capacity(4)
      .poll_timeout(Duration::from_millis(5));
    let selector = SelectorManager::with_config(config).unwrap();
    let (a, b) = create_socket_pair().unwrap();
    let selectable = selector.selectable(a.as_raw_fd()).unwrap();

    thread::sleep(Duration::from_millis(30));
    write_byte(b.as_raw_fd());
    block_on(selector.select(&selectable, Interest::READ)).unwrap();
    selector.close();
  }
}
