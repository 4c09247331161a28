//! Sockets driven by the [`SelectorManager`](crate::SelectorManager).
//!
//! # Main Types
//!
//! - [`DatagramSocket`]: UDP socket with a serialized sender task and a
//!   receiver task feeding a bounded incoming queue
//! - [`StreamAttachment`]: byte pumps between async readers/writers and a
//!   connected stream descriptor
//!
//! Every syscall here is non-blocking. A would-block result suspends the
//! calling task on the reactor and the same call is retried once the OS
//! reports readiness, with the same payload or buffer.

mod attach;
mod datagram;
mod options;
mod socket;
mod sys;

pub use attach::StreamAttachment;
pub use datagram::Datagram;
pub use options::SocketOptions;
pub use socket::{DatagramSocket, DatagramSocketBuilder, SocketState};
