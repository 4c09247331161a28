use super::NOTIFY_KEY;
use super::notifier::Notifier;
use super::{Interest, ReadinessPoll, util};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

/// Wrapper around an epoll file descriptor
pub struct OsPoller {
  epoll_fd: OwnedFd,
  /// Wakes a blocked epoll_wait
  notifier: Notifier,
}

impl OsPoller {
  pub fn new() -> io::Result<Self> {
    // SAFETY: epoll_create1 returned a fresh descriptor we now own.
    let epoll_fd = unsafe {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      OwnedFd::from_raw_fd(fd)
    };

    let epoll = Self { epoll_fd, notifier: Notifier::new()? };

    // Level-triggered on purpose: stays readable until acknowledged.
    let mut event =
      libc::epoll_event { events: libc::EPOLLIN as u32, u64: NOTIFY_KEY };
    syscall!(epoll_ctl(
      epoll.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      epoll.notifier.read_fd(),
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(epoll)
  }

  fn ctl(
    &self,
    op: libc::c_int,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    assert_ne!(key, NOTIFY_KEY, "key {NOTIFY_KEY} is reserved");

    let mut events = libc::EPOLLONESHOT as u32;
    if interest.is_readable() {
      events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.is_writable() {
      events |= libc::EPOLLOUT as u32;
    }

    let mut event = libc::epoll_event { events, u64: key };
    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      op,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;
    Ok(())
  }
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::epoll_event;

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, key, interest)
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    // EPOLL_CTL_DEL accepts a null event since Linux 2.6.9.
    match syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    )) {
      Ok(_) => Ok(()),
      Err(err) => Err(match err.raw_os_error() {
        Some(libc::EBADF) => io::Error::from_raw_os_error(libc::ENOENT),
        _ => err,
      }),
    }
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout_ms = util::timeout_to_millis(timeout);

    let ret = syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ms,
    ))?;

    let n = ret as usize;
    assert!(
      n <= events.len(),
      "epoll_wait returned more events ({}) than buffer size ({})",
      n,
      events.len()
    );
    Ok(n)
  }

  fn notify(&self) -> io::Result<()> {
    self.notifier.notify()
  }

  fn acknowledge(&self) -> io::Result<()> {
    self.notifier.drain()
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    let flags = event.events;

    // Errors and hang-ups wake both sides, the next syscall reports them.
    if flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
      return Interest::READ_AND_WRITE;
    }

    let mut interest = Interest::NONE;
    if flags & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0 {
      interest |= Interest::READ;
    }
    if flags & libc::EPOLLOUT as u32 != 0 {
      interest |= Interest::WRITE;
    }
    interest
  }
}
