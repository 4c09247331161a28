//! Thin wrappers around the socket syscalls.
//!
//! Everything here is non-blocking and returns `io::Result`, with
//! would-block surfacing as `ErrorKind::WouldBlock`. Retrying is up to the
//! callers, which own the readiness loops.

use std::{
  io, mem,
  os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use crate::address::SocketAddress;
use crate::error::Result;

/// Flags for stream sends. Apple platforms have no `MSG_NOSIGNAL` and rely
/// on `SO_NOSIGPIPE` instead.
#[cfg(apple)]
pub(crate) const SEND_FLAGS: libc::c_int = 0;
#[cfg(not(apple))]
pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;

/// Creates a non-blocking close-on-exec socket.
pub(crate) fn socket(
  family: libc::c_int,
  ty: libc::c_int,
) -> io::Result<OwnedFd> {
  #[cfg(not(apple))]
  let fd = {
    let fd = syscall!(socket(
      family,
      ty | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
      0
    ))?;
    // SAFETY: socket(2) returned a fresh descriptor.
    unsafe { OwnedFd::from_raw_fd(fd) }
  };

  // No SOCK_CLOEXEC/SOCK_NONBLOCK here, set them right after creation.
  #[cfg(apple)]
  let fd = {
    let fd = syscall!(socket(family, ty, 0))?;
    // SAFETY: socket(2) returned a fresh descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    syscall!(ioctl(fd.as_raw_fd(), libc::FIOCLEX))?;
    set_nonblocking(fd.as_raw_fd())?;
    fd
  };

  disable_sigpipe(fd.as_raw_fd())?;
  Ok(fd)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
  let mut nonblocking = true as libc::c_int;
  syscall!(ioctl(fd, libc::FIONBIO, &mut nonblocking)).map(drop)
}

/// Turns a write to a closed peer into `EPIPE` instead of `SIGPIPE`.
/// Linux does this per call with `MSG_NOSIGNAL`.
pub(crate) fn disable_sigpipe(#[allow(unused)] fd: RawFd) -> io::Result<()> {
  #[cfg(any(
    apple,
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
  ))]
  set_int_option(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;

  Ok(())
}

pub(crate) fn set_int_option(
  fd: RawFd,
  level: libc::c_int,
  name: libc::c_int,
  value: libc::c_int,
) -> io::Result<()> {
  syscall!(setsockopt(
    fd,
    level,
    name,
    &value as *const libc::c_int as *const libc::c_void,
    mem::size_of::<libc::c_int>() as libc::socklen_t
  ))
  .map(drop)
}

#[cfg(test)]
pub(crate) fn get_int_option(
  fd: RawFd,
  level: libc::c_int,
  name: libc::c_int,
) -> io::Result<libc::c_int> {
  let mut value: libc::c_int = 0;
  let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
  syscall!(getsockopt(
    fd,
    level,
    name,
    &mut value as *mut libc::c_int as *mut libc::c_void,
    &mut len
  ))?;
  Ok(value)
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddress) -> io::Result<()> {
  addr.with_native(|ptr, len| syscall!(bind(fd, ptr, len))).map(drop)
}

/// Fixes the peer of a datagram socket. Never blocks for UDP.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddress) -> io::Result<()> {
  addr.with_native(|ptr, len| syscall!(connect(fd, ptr, len))).map(drop)
}

pub(crate) fn local_address(fd: RawFd) -> Result<SocketAddress> {
  // SAFETY: zero is a valid sockaddr_storage.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  syscall!(getsockname(
    fd,
    (&mut storage as *mut libc::sockaddr_storage).cast(),
    &mut len
  ))?;
  SocketAddress::from_storage(&storage)
}

/// `sendto(2)`, or `send(2)` when `target` is `None` (connected socket).
pub(crate) fn send_to(
  fd: RawFd,
  buf: &[u8],
  target: Option<&SocketAddress>,
) -> io::Result<usize> {
  let n = match target {
    Some(addr) => addr.with_native(|ptr, len| {
      syscall!(sendto(fd, buf.as_ptr().cast(), buf.len(), 0, ptr, len))
    })?,
    None => syscall!(send(fd, buf.as_ptr().cast(), buf.len(), 0))?,
  };
  Ok(n as usize)
}

/// One datagram read with `recvmsg(2)`.
pub(crate) struct Received {
  pub(crate) len: usize,
  /// The datagram was larger than the buffer and got cut.
  pub(crate) truncated: bool,
  pub(crate) source: libc::sockaddr_storage,
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<Received> {
  // SAFETY: zero is a valid sockaddr_storage and msghdr.
  let mut source: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut msg: libc::msghdr = unsafe { mem::zeroed() };

  let mut iov =
    libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: buf.len() };
  msg.msg_name = (&mut source as *mut libc::sockaddr_storage).cast();
  msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as _;
  msg.msg_iov = &mut iov;
  msg.msg_iovlen = 1;

  let n = syscall!(recvmsg(fd, &mut msg, 0))?;
  Ok(Received {
    len: n as usize,
    truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
    source,
  })
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
  syscall!(send(fd, buf.as_ptr().cast(), buf.len(), SEND_FLAGS))
    .map(|n| n as usize)
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
  syscall!(recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0))
    .map(|n| n as usize)
}

/// `shutdown(2)`, where a peer that is already gone counts as success.
pub(crate) fn shutdown(fd: RawFd, how: libc::c_int) -> io::Result<()> {
  match syscall!(shutdown(fd, how)) {
    Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
    other => other.map(drop),
  }
}
