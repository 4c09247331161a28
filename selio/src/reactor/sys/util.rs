use std::io;
use std::time::Duration;

/// Convert Option<Duration> to timespec storage for `kevent`.
///
/// The caller keeps the returned value alive across the syscall and passes
/// a pointer to it.
#[allow(dead_code)]
pub fn timeout_to_timespec(
  timeout: Option<Duration>,
) -> Option<libc::timespec> {
  timeout.map(|duration| libc::timespec {
    tv_sec: duration.as_secs() as libc::time_t,
    tv_nsec: duration.subsec_nanos() as libc::c_long,
  })
}

/// Convert Option<Duration> to an `epoll_wait` timeout, `-1` meaning
/// forever. Sub-millisecond timeouts round up so they don't busy-loop.
#[allow(dead_code)]
pub fn timeout_to_millis(timeout: Option<Duration>) -> i32 {
  match timeout {
    None => -1,
    Some(d) => {
      let mut ms = d.as_millis();
      if Duration::from_millis(ms as u64) < d {
        ms += 1;
      }
      ms.min(i32::MAX as u128) as i32
    }
  }
}

/// Whether an error is ENOENT, which deleting an already-gone interest
/// returns.
#[allow(dead_code)]
pub fn is_not_found_error(err: &io::Error) -> bool {
  err.raw_os_error() == Some(libc::ENOENT)
}
