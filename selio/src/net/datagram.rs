use bytes::Bytes;

use crate::address::SocketAddress;

/// One UDP message.
///
/// `address` is the destination when sending and the source when received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
  payload: Bytes,
  address: SocketAddress,
}

impl Datagram {
  pub fn new(payload: impl Into<Bytes>, address: SocketAddress) -> Self {
    Self { payload: payload.into(), address }
  }

  pub fn payload(&self) -> &Bytes {
    &self.payload
  }

  pub fn address(&self) -> SocketAddress {
    self.address
  }

  pub fn len(&self) -> usize {
    self.payload.len()
  }

  pub fn is_empty(&self) -> bool {
    self.payload.is_empty()
  }

  pub fn into_parts(self) -> (Bytes, SocketAddress) {
    (self.payload, self.address)
  }
}
