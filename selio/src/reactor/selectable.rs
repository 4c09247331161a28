use std::{fmt, os::fd::RawFd, task::Waker};

use parking_lot::{Mutex, MutexGuard};

use super::Interest;

/// A descriptor registered with a [`SelectorManager`](super::SelectorManager).
///
/// Read and write readiness are tracked separately: a task waiting for
/// WRITE is never resumed by a READ event and the other way around. The
/// selectable doesn't own the descriptor.
pub struct Selectable {
  fd: RawFd,
  key: u64,
  state: Mutex<SelectableState>,
}

#[derive(Default)]
pub(crate) struct Waiter {
  /// Every task parked on this direction.
  pub(crate) wakers: Vec<Waker>,
  /// Bumped each time this direction fires. A `select` that saw an older
  /// value has been resumed.
  pub(crate) epoch: u64,
}

impl Waiter {
  pub(crate) fn park(&mut self, waker: &Waker) {
    if !self.wakers.iter().any(|parked| parked.will_wake(waker)) {
      self.wakers.push(waker.clone());
    }
  }
}

#[derive(Default)]
pub(crate) struct SelectableState {
  /// Whether the descriptor was handed to the OS poller yet.
  pub(crate) registered: bool,
  /// Interests currently armed with the OS poller.
  pub(crate) pending: Interest,
  pub(crate) read: Waiter,
  pub(crate) write: Waiter,
  pub(crate) closed: bool,
}

impl SelectableState {
  /// `interest` must be exactly READ or WRITE.
  pub(crate) fn waiter(&mut self, interest: Interest) -> &mut Waiter {
    if interest == Interest::READ {
      &mut self.read
    } else {
      assert_eq!(interest, Interest::WRITE, "select takes a single interest");
      &mut self.write
    }
  }

  /// Marks `fired` ready and takes the wakers that should run.
  pub(crate) fn fire(&mut self, fired: Interest) -> Vec<Waker> {
    let mut wakers = Vec::with_capacity(2);
    self.pending = self.pending.remove(fired);

    if fired.is_readable() {
      self.read.epoch += 1;
      wakers.append(&mut self.read.wakers);
    }
    if fired.is_writable() {
      self.write.epoch += 1;
      wakers.append(&mut self.write.wakers);
    }
    wakers
  }

  /// Every parked waker, for failing them all at once.
  pub(crate) fn take_wakers(&mut self) -> Vec<Waker> {
    let mut wakers = std::mem::take(&mut self.read.wakers);
    wakers.append(&mut self.write.wakers);
    wakers
  }
}

impl Selectable {
  pub(crate) fn new(fd: RawFd, key: u64) -> Self {
    Self { fd, key, state: Mutex::new(SelectableState::default()) }
  }

  pub fn fd(&self) -> RawFd {
    self.fd
  }

  pub(crate) fn key(&self) -> u64 {
    self.key
  }

  /// Interests currently armed with the OS poller.
  pub fn interest(&self) -> Interest {
    self.state.lock().pending
  }

  /// Whether the selectable was deregistered.
  pub fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, SelectableState> {
    self.state.lock()
  }
}

impl fmt::Debug for Selectable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("Selectable")
      .field("fd", &self.fd)
      .field("key", &self.key)
      .field("pending", &state.pending)
      .field("closed", &state.closed)
      .finish()
  }
}
