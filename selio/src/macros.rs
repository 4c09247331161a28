/// Calls a `libc` function and turns a `-1` return into
/// [`std::io::Error::last_os_error`].
macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}

/// Runs a non-blocking syscall until it stops reporting `EINTR`.
macro_rules! retry_interrupted {
  ($call: expr) => {{
    loop {
      match $call {
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
        other => break other,
      }
    }
  }};
}
