use std::{io, os::fd::RawFd};

use super::sys;

/// Options applied to a datagram socket before it is bound.
///
/// ```
/// use selio::SocketOptions;
///
/// let options = SocketOptions::default().broadcast(true).reuse_address(true);
/// assert!(options.is_broadcast());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
  reuse_address: bool,
  reuse_port: bool,
  broadcast: bool,
  send_buffer_size: Option<usize>,
  receive_buffer_size: Option<usize>,
  type_of_service: Option<u8>,
}

impl SocketOptions {
  /// `SO_REUSEADDR`.
  pub fn reuse_address(mut self, enabled: bool) -> Self {
    self.reuse_address = enabled;
    self
  }

  /// `SO_REUSEPORT`.
  pub fn reuse_port(mut self, enabled: bool) -> Self {
    self.reuse_port = enabled;
    self
  }

  /// `SO_BROADCAST`. Without it, sends to a broadcast address are refused
  /// by the OS.
  pub fn broadcast(mut self, enabled: bool) -> Self {
    self.broadcast = enabled;
    self
  }

  /// `SO_SNDBUF`, left to the OS default when unset.
  pub fn send_buffer_size(mut self, size: usize) -> Self {
    self.send_buffer_size = Some(size);
    self
  }

  /// `SO_RCVBUF`, left to the OS default when unset.
  pub fn receive_buffer_size(mut self, size: usize) -> Self {
    self.receive_buffer_size = Some(size);
    self
  }

  /// `IP_TOS` (IPv4) or `IPV6_TCLASS` (IPv6).
  pub fn type_of_service(mut self, tos: u8) -> Self {
    self.type_of_service = Some(tos);
    self
  }

  pub fn is_reuse_address(&self) -> bool {
    self.reuse_address
  }

  pub fn is_reuse_port(&self) -> bool {
    self.reuse_port
  }

  pub fn is_broadcast(&self) -> bool {
    self.broadcast
  }

  pub(crate) fn apply(&self, fd: RawFd, family: libc::c_int) -> io::Result<()> {
    if self.reuse_address {
      sys::set_int_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    }
    if self.reuse_port {
      sys::set_int_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
    }
    if self.broadcast {
      sys::set_int_option(fd, libc::SOL_SOCKET, libc::SO_BROADCAST, 1)?;
    }
    if let Some(size) = self.send_buffer_size {
      sys::set_int_option(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, clamp(size))?;
    }
    if let Some(size) = self.receive_buffer_size {
      sys::set_int_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, clamp(size))?;
    }
    if let Some(tos) = self.type_of_service {
      let (level, name) = if family == libc::AF_INET6 {
        (libc::IPPROTO_IPV6, libc::IPV6_TCLASS)
      } else {
        (libc::IPPROTO_IP, libc::IP_TOS)
      };
      sys::set_int_option(fd, level, name, tos as libc::c_int)?;
    }
    Ok(())
  }
}

fn clamp(size: usize) -> libc::c_int {
  size.min(libc::c_int::MAX as usize) as libc::c_int
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::os::fd::AsRawFd;

  #[test]
  fn defaults_touch_nothing() {
    let options = SocketOptions::default();
    assert!(!options.is_broadcast());
    assert!(!options.is_reuse_address());
    assert!(!options.is_reuse_port());
  }

  #[test]
  fn apply_sets_the_options() {
    let fd = sys::socket(libc::AF_INET, libc::SOCK_DGRAM).unwrap();
    let fd = fd.as_raw_fd();

    SocketOptions::default()
      .reuse_address(true)
      .broadcast(true)
      .receive_buffer_size(64 * 1024)
      .type_of_service(0x10)
      .apply(fd, libc::AF_INET)
      .unwrap();

    let get = |level, name| sys::get_int_option(fd, level, name).unwrap();
    assert_ne!(get(libc::SOL_SOCKET, libc::SO_REUSEADDR), 0);
    assert_ne!(get(libc::SOL_SOCKET, libc::SO_BROADCAST), 0);
    assert!(get(libc::SOL_SOCKET, libc::SO_RCVBUF) >= 64 * 1024);
    assert_eq!(get(libc::IPPROTO_IP, libc::IP_TOS), 0x10);
  }
}
