//! Error type shared by the reactor, the buffer pool and the sockets.
//!
//! "Would block" never shows up here: it is a retry trigger that is always
//! resolved inside the send/receive loops.

use std::{io, sync::Arc};

use futures::task::SpawnError;

/// Result alias used throughout `selio`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The socket (or the selectable it was waiting on) is closing or closed.
  #[error("socket closed")]
  SocketClosed,

  /// The OS transferred zero bytes on a call that had data to transfer.
  #[error("failed writing to closed socket")]
  PeerClosed,

  /// The OS rejected a send or receive. The errno is kept in the inner error.
  #[error("transport failure: {0}")]
  Transport(#[from] io::Error),

  /// A received datagram did not fit into a pool buffer and was discarded.
  #[error("datagram truncated: larger than the {capacity} byte buffer")]
  Truncated { capacity: usize },

  /// A stream write pump stopped with bytes still unwritten.
  #[error("failed writing to closed socket, {remaining} bytes remaining")]
  Unflushed {
    remaining: usize,
    #[source]
    cause: Option<Box<Error>>,
  },

  /// The selector was closed while the operation was registered or pending.
  #[error("selector closed")]
  ReactorClosed,

  /// The selector's poll loop died; the selector must be recreated.
  #[error("selector failed: {0}")]
  ReactorFailed(Arc<io::Error>),

  /// Every buffer of the pool is checked out.
  #[error("buffer pool exhausted: all {capacity} buffers are in use")]
  PoolExhausted { capacity: usize },

  /// `remote_address` was asked of a socket without a fixed peer.
  #[error("socket has no remote address")]
  NotConnected,

  #[error("unsupported address family {0}")]
  UnsupportedFamily(i32),

  /// The executor refused one of the socket's background tasks.
  #[error("failed to spawn socket task: {0}")]
  Spawn(#[from] SpawnError),
}

impl Error {
  /// The OS errno behind this error, if any.
  pub fn raw_os_error(&self) -> Option<i32> {
    match self {
      Self::Transport(err) => err.raw_os_error(),
      Self::ReactorFailed(err) => err.raw_os_error(),
      Self::Unflushed { cause: Some(cause), .. } => cause.raw_os_error(),
      _ => None,
    }
  }

  /// True for `EACCES`/`EPERM`, e.g. a broadcast send without
  /// `SO_BROADCAST`.
  pub fn is_permission_denied(&self) -> bool {
    match self {
      Self::Transport(err) => err.kind() == io::ErrorKind::PermissionDenied,
      _ => false,
    }
  }

  /// True for errors that end the socket or selector rather than a single
  /// operation.
  pub(crate) fn is_terminal(&self) -> bool {
    match self {
      Self::SocketClosed | Self::ReactorClosed | Self::ReactorFailed(_) => true,
      Self::Transport(err) => {
        matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOTSOCK))
      }
      _ => false,
    }
  }
}

pub(crate) fn is_would_block(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::WouldBlock
    || err.raw_os_error() == Some(libc::EAGAIN)
}
