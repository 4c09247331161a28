//! Wakes a thread blocked in `epoll_wait`.
//!
//! A non-blocking pipe whose read end is registered with the poller. kqueue
//! has `EVFILT_USER` for this and needs no descriptor.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct Notifier {
  read_fd: OwnedFd,
  write_fd: OwnedFd,
}

impl Notifier {
  pub fn new() -> io::Result<Self> {
    let mut fds = [0i32; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

    // SAFETY: pipe2 succeeded, both fds are fresh and owned by us.
    Ok(Self {
      read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
      write_fd: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    })
  }

  /// Read end, to be registered with the poller under [`NOTIFY_KEY`].
  pub fn read_fd(&self) -> RawFd {
    self.read_fd.as_raw_fd()
  }

  pub fn notify(&self) -> io::Result<()> {
    let byte: u8 = 1;
    let result = syscall!(write(
      self.write_fd.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    ));

    match result {
      // Pipe full: a wake-up is already pending.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  /// Empties the pipe so the level-triggered read end stops firing.
  pub fn drain(&self) -> io::Result<()> {
    let mut buf = [0u8; 64];
    loop {
      match syscall!(read(
        self.read_fd.as_raw_fd(),
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
      )) {
        Ok(0) => return Ok(()),
        Ok(_) => continue,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => return Err(err),
      }
    }
  }
}
