//! OS readiness pollers.
//!
//! `epoll` on Linux, `kqueue` on the BSDs and Apple platforms. Both are
//! driven in one-shot mode: once an interest fires it has to be armed again,
//! which is what lets the selector hand out exactly one wake-up per
//! registration.

#[cfg(linux)]
mod notifier;
mod util;

/// Key reserved for notification events.
pub(crate) const NOTIFY_KEY: u64 = u64::MAX;

#[cfg(linux)]
mod epoll;
#[cfg(linux)]
pub(crate) use epoll::OsPoller;

#[cfg(kqueue)]
mod kqueue;
#[cfg(kqueue)]
pub(crate) use kqueue::OsPoller;


use std::io;
use std::os::fd::RawFd;
use std::mem;
use std::time::Duration;

use super::Interest;

/// Trait for OS-specific readiness polling implementations
///
/// - **epoll**: one registration per fd carrying both read and write
/// - **kqueue**: read and write are separate filters
///
/// The trait takes [`Interest`] flags so both fit behind it.
pub trait ReadinessPoll {
  /// The native event type used by this implementation
  type NativeEvent: Copy;

  /// Add interest for a file descriptor. Fails with `EEXIST` if `fd` is
  /// already registered.
  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  /// Re-arm interest for a registered file descriptor. Fails with `ENOENT`
  /// if `fd` was never added.
  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  /// Remove all interest for a file descriptor. Fails with `ENOENT` if `fd`
  /// isn't registered.
  fn delete(&self, fd: RawFd) -> io::Result<()>;

  /// Wait for events, filling the provided buffer. Returns the number of
  /// events received.
  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize>;

  /// Wake up a blocking `wait` from another thread.
  fn notify(&self) -> io::Result<()>;

  /// Reset the notification after `wait` reported it.
  fn acknowledge(&self) -> io::Result<()>;

  fn event_key(event: &Self::NativeEvent) -> u64;

  /// kqueue reports one filter per event, epoll may report both.
  fn event_interest(event: &Self::NativeEvent) -> Interest;
}

/// A readiness event reported by the poller
#[derive(Debug, Clone, Copy)]
pub struct Event {
  pub key: u64,
  pub interest: Interest,
}

/// Reusable buffer of native events.
pub struct Events {
  events: Vec<<OsPoller as ReadinessPoll>::NativeEvent>,
  /// Entries filled by the last wait.
  len: usize,
}

impl Events {
  pub fn with_capacity(capacity: usize) -> Self {
    assert!(capacity > 0, "Events::with_capacity: capacity must be > 0");
    // SAFETY: native events are plain C structs, all zeroes is valid.
    let empty = unsafe { mem::zeroed() };
    Self { events: vec![empty; capacity], len: 0 }
  }

  /// Polls `poller` into this buffer, replacing the previous batch.
  pub fn wait_on(
    &mut self,
    poller: &OsPoller,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    self.len = 0;
    let n = poller.wait(&mut self.events, timeout)?;
    assert!(n <= self.events.len(), "poller returned too many events");
    self.len = n;
    Ok(())
  }

  /// Whether this batch contains the internal notification.
  pub fn notified(&self) -> bool {
    self.events[..self.len]
      .iter()
      .any(|native| OsPoller::event_key(native) == NOTIFY_KEY)
  }

  /// Events of this batch, without the internal notification.
  pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
    self.events[..self.len]
      .iter()
      .map(|native| Event {
        key: OsPoller::event_key(native),
        interest: OsPoller::event_interest(native),
      })
      .filter(|event| event.key != NOTIFY_KEY)
  }
}
