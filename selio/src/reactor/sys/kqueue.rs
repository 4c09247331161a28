use std::collections::HashSet;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

use parking_lot::Mutex;

use super::NOTIFY_KEY;
use super::{Interest, ReadinessPoll, util};

/// Identifier of the EVFILT_USER notification event
const NOTIFY_IDENT: usize = NOTIFY_KEY as usize;

/// Wrapper around a kqueue file descriptor
pub struct OsPoller {
  kq_fd: OwnedFd,
  /// Registered fds, so add/modify/delete fail the way epoll does.
  registered_fds: Mutex<HashSet<RawFd>>,
}

impl OsPoller {
  pub fn new() -> io::Result<Self> {
    // SAFETY: kqueue returned a fresh descriptor we now own.
    let kqueue = Self {
      kq_fd: unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) },
      registered_fds: Mutex::new(HashSet::new()),
    };

    // EV_CLEAR resets the user event once it's delivered.
    let kev = libc::kevent {
      ident: NOTIFY_IDENT as libc::uintptr_t,
      filter: libc::EVFILT_USER,
      flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR,
      fflags: 0,
      data: 0,
      udata: NOTIFY_IDENT as *mut libc::c_void,
    };
    kqueue.submit(&[kev])?;

    Ok(kqueue)
  }

  fn submit(&self, changes: &[libc::kevent]) -> io::Result<()> {
    let ret = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      changes.as_ptr(),
      changes.len() as i32,
      ptr::null_mut(),
      0,
      ptr::null(),
    ))?;
    assert_eq!(ret, 0, "kevent with no output events should return 0");
    Ok(())
  }

  /// Arms the requested filters in a single syscall.
  fn arm(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    assert_ne!(key, NOTIFY_KEY, "key {NOTIFY_KEY} is reserved");

    let filter = |filter| libc::kevent {
      ident: fd as libc::uintptr_t,
      filter,
      flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT,
      fflags: 0,
      data: 0,
      udata: key as usize as *mut libc::c_void,
    };

    let mut changes = Vec::with_capacity(2);
    if interest.is_readable() {
      changes.push(filter(libc::EVFILT_READ));
    }
    if interest.is_writable() {
      changes.push(filter(libc::EVFILT_WRITE));
    }

    if changes.is_empty() { Ok(()) } else { self.submit(&changes) }
  }

  fn delete_filter(&self, fd: RawFd, filter: i16) -> io::Result<()> {
    let kev = libc::kevent {
      ident: fd as libc::uintptr_t,
      filter,
      flags: libc::EV_DELETE,
      fflags: 0,
      data: 0,
      udata: ptr::null_mut(),
    };

    match self.submit(&[kev]) {
      // A one-shot filter that already fired is gone.
      Err(err) if !util::is_not_found_error(&err) => Err(err),
      _ => Ok(()),
    }
  }
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::kevent;

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    if !self.registered_fds.lock().insert(fd) {
      return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }

    self.arm(fd, key, interest).inspect_err(|_| {
      self.registered_fds.lock().remove(&fd);
    })
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    if !self.registered_fds.lock().contains(&fd) {
      return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }
    self.arm(fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    if !self.registered_fds.lock().remove(&fd) {
      return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }

    let read = self.delete_filter(fd, libc::EVFILT_READ);
    let write = self.delete_filter(fd, libc::EVFILT_WRITE);
    read.and(write)
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout_storage = util::timeout_to_timespec(timeout);
    let timeout_ptr = timeout_storage
      .as_ref()
      .map_or(ptr::null(), |ts| ts as *const libc::timespec);

    let ret = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      ptr::null(),
      0,
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ptr,
    ))?;

    let n = ret as usize;
    assert!(
      n <= events.len(),
      "kevent returned more events ({}) than buffer size ({})",
      n,
      events.len()
    );
    Ok(n)
  }

  fn notify(&self) -> io::Result<()> {
    let kev = libc::kevent {
      ident: NOTIFY_IDENT as libc::uintptr_t,
      filter: libc::EVFILT_USER,
      flags: 0,
      fflags: libc::NOTE_TRIGGER,
      data: 0,
      udata: NOTIFY_IDENT as *mut libc::c_void,
    };
    self.submit(&[kev])
  }

  fn acknowledge(&self) -> io::Result<()> {
    Ok(())
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.udata as usize as u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    match event.filter {
      libc::EVFILT_READ => Interest::READ,
      libc::EVFILT_WRITE => Interest::WRITE,
      _ => Interest::NONE,
    }
  }
}
