//! IPv4/IPv6 endpoints and their native `sockaddr` representation.
//!
//! [`SocketAddress`] is a plain value. The native structure only ever exists
//! for the duration of a [`SocketAddress::with_native`] callback, so a
//! pointer handed to a syscall can't outlive the storage behind it.

use std::{
  fmt,
  mem,
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
  str::FromStr,
};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Address {
  octets: [u8; 4],
  port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Address {
  octets: [u8; 16],
  port: u16,
  flow_info: u32,
  scope_id: u32,
}

/// A numeric network endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketAddress {
  V4(Ipv4Address),
  V6(Ipv6Address),
}

impl Ipv4Address {
  pub const fn new(octets: [u8; 4], port: u16) -> Self {
    Self { octets, port }
  }

  pub const fn octets(&self) -> [u8; 4] {
    self.octets
  }

  pub const fn port(&self) -> u16 {
    self.port
  }

  fn to_native(self) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in only has integer fields, zero is valid for all.
    let mut native: libc::sockaddr_in = unsafe { mem::zeroed() };

    #[cfg(kqueue)]
    {
      native.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    native.sin_family = libc::AF_INET as libc::sa_family_t;
    native.sin_port = self.port.to_be();
    // s_addr is in network order, which is exactly the octet order.
    native.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(self.octets) };

    native
  }

  fn from_native(native: &libc::sockaddr_in) -> Self {
    Self {
      octets: native.sin_addr.s_addr.to_ne_bytes(),
      port: u16::from_be(native.sin_port),
    }
  }
}

impl Ipv6Address {
  pub const fn new(
    octets: [u8; 16],
    port: u16,
    flow_info: u32,
    scope_id: u32,
  ) -> Self {
    Self { octets, port, flow_info, scope_id }
  }

  pub const fn octets(&self) -> [u8; 16] {
    self.octets
  }

  pub const fn port(&self) -> u16 {
    self.port
  }

  pub const fn flow_info(&self) -> u32 {
    self.flow_info
  }

  pub const fn scope_id(&self) -> u32 {
    self.scope_id
  }

  fn to_native(self) -> libc::sockaddr_in6 {
    // SAFETY: sockaddr_in6 only has integer/array fields, zero is valid.
    let mut native: libc::sockaddr_in6 = unsafe { mem::zeroed() };

    #[cfg(kqueue)]
    {
      native.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
    }
    native.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    native.sin6_port = self.port.to_be();
    native.sin6_addr = libc::in6_addr { s6_addr: self.octets };
    // Stored as given, the same way std does it.
    native.sin6_flowinfo = self.flow_info;
    native.sin6_scope_id = self.scope_id;

    native
  }

  fn from_native(native: &libc::sockaddr_in6) -> Self {
    Self {
      octets: native.sin6_addr.s6_addr,
      port: u16::from_be(native.sin6_port),
      flow_info: native.sin6_flowinfo,
      scope_id: native.sin6_scope_id,
    }
  }
}

impl SocketAddress {
  pub fn new(ip: IpAddr, port: u16) -> Self {
    match ip {
      IpAddr::V4(ip) => Self::V4(Ipv4Address::new(ip.octets(), port)),
      IpAddr::V6(ip) => Self::V6(Ipv6Address::new(ip.octets(), port, 0, 0)),
    }
  }

  /// `AF_INET` or `AF_INET6`.
  pub fn family(&self) -> libc::sa_family_t {
    match self {
      Self::V4(_) => libc::AF_INET as libc::sa_family_t,
      Self::V6(_) => libc::AF_INET6 as libc::sa_family_t,
    }
  }

  pub fn port(&self) -> u16 {
    match self {
      Self::V4(addr) => addr.port(),
      Self::V6(addr) => addr.port(),
    }
  }

  pub fn ip(&self) -> IpAddr {
    match self {
      Self::V4(addr) => IpAddr::V4(Ipv4Addr::from(addr.octets)),
      Self::V6(addr) => IpAddr::V6(Ipv6Addr::from(addr.octets)),
    }
  }

  /// Raw address bytes, 4 for IPv4 and 16 for IPv6.
  pub fn octets(&self) -> &[u8] {
    match self {
      Self::V4(addr) => &addr.octets,
      Self::V6(addr) => &addr.octets,
    }
  }

  /// Canonical numeric text of the address part (no port).
  pub fn address_string(&self) -> String {
    self.ip().to_string()
  }

  /// Hands a native address pointer and its length to `f`.
  ///
  /// The native structure lives on this stack frame and is gone once `f`
  /// returns, so `f` must not stash the pointer.
  pub fn with_native<R>(
    &self,
    f: impl FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
  ) -> R {
    match *self {
      Self::V4(addr) => {
        let native = addr.to_native();
        f(
          (&native as *const libc::sockaddr_in).cast(),
          mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
      }
      Self::V6(addr) => {
        let native = addr.to_native();
        f(
          (&native as *const libc::sockaddr_in6).cast(),
          mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
      }
    }
  }

  /// Decodes an address the OS wrote into a `sockaddr_storage`.
  pub fn from_storage(storage: &libc::sockaddr_storage) -> Result<Self> {
    let len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: a sockaddr_storage is large and aligned enough for any family.
    unsafe {
      Self::from_raw((storage as *const libc::sockaddr_storage).cast(), len)
    }
  }

  /// Decodes a native address.
  ///
  /// # Safety
  ///
  /// `ptr` must point to at least `len` readable bytes holding a `sockaddr`
  /// whose family field is initialised.
  pub unsafe fn from_raw(
    ptr: *const libc::sockaddr,
    len: libc::socklen_t,
  ) -> Result<Self> {
    // SAFETY: the caller guarantees a readable sockaddr header.
    let family = unsafe { (*ptr).sa_family } as i32;

    match family {
      libc::AF_INET
        if len as usize >= mem::size_of::<libc::sockaddr_in>() =>
      {
        // SAFETY: family and length checked above, read_unaligned copes with
        // buffers that are not sockaddr_in aligned.
        let native =
          unsafe { ptr.cast::<libc::sockaddr_in>().read_unaligned() };
        Ok(Self::V4(Ipv4Address::from_native(&native)))
      }
      libc::AF_INET6
        if len as usize >= mem::size_of::<libc::sockaddr_in6>() =>
      {
        // SAFETY: same as above for sockaddr_in6.
        let native =
          unsafe { ptr.cast::<libc::sockaddr_in6>().read_unaligned() };
        Ok(Self::V6(Ipv6Address::from_native(&native)))
      }
      other => Err(Error::UnsupportedFamily(other)),
    }
  }
}

impl From<SocketAddr> for SocketAddress {
  fn from(value: SocketAddr) -> Self {
    match value {
      SocketAddr::V4(v4) => {
        Self::V4(Ipv4Address::new(v4.ip().octets(), v4.port()))
      }
      SocketAddr::V6(v6) => Self::V6(Ipv6Address::new(
        v6.ip().octets(),
        v6.port(),
        v6.flowinfo(),
        v6.scope_id(),
      )),
    }
  }
}

impl From<SocketAddress> for SocketAddr {
  fn from(value: SocketAddress) -> Self {
    match value {
      SocketAddress::V4(v4) => {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(v4.octets), v4.port))
      }
      SocketAddress::V6(v6) => SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(v6.octets),
        v6.port,
        v6.flow_info,
        v6.scope_id,
      )),
    }
  }
}

impl FromStr for SocketAddress {
  type Err = std::net::AddrParseError;

  /// Parses numeric `ip:port` or `[ip]:port`. No name resolution happens
  /// here.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    s.parse::<SocketAddr>().map(Self::from)
  }
}

impl fmt::Display for SocketAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&SocketAddr::from(*self), f)
  }
}
