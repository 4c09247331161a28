#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Selio - Readiness-Driven Non-Blocking Sockets
//!
//! Selio multiplexes non-blocking sockets over one OS readiness poller and
//! exposes them as futures. It doesn't bring an executor: socket tasks are
//! spawned on whatever [`futures::task::Spawn`] the caller hands in.
//!
//! ## Features
//! - **Reactor**: one poll thread per [`SelectorManager`], one-shot
//!   interests, read and write resumed independently.
//! - **Datagram sockets**: [`DatagramSocket`] with ordered sends, a bounded
//!   incoming queue and pooled receive buffers.
//! - **Stream pumps**: [`StreamAttachment`] copies between async
//!   readers/writers and a connected stream descriptor.
//!
//! ## Platform support
//!
//! | Platform   | I/O Mechanism | Status |
//! |------------|---------------|--------|
//! | Linux      | epoll         | Yes    |
//! | macOS      | kqueue        | Yes    |
//! | BSDs       | kqueue        | Yes    |
//! | Windows    | -             | No     |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::executor::LocalPool;
//! use selio::{Datagram, DatagramSocket, SelectorManager, SocketAddress};
//!
//! fn main() -> selio::Result<()> {
//!   let selector = SelectorManager::new()?;
//!   let mut pool = LocalPool::new();
//!
//!   let local: SocketAddress = "127.0.0.1:0".parse().unwrap();
//!   let spawner = pool.spawner();
//!   let server = DatagramSocket::builder(&selector).bind(local, &spawner)?;
//!   let client = DatagramSocket::builder(&selector).bind(local, &spawner)?;
//!
//!   pool.run_until(async {
//!     client.send(Datagram::new("hello", server.local_address())).await?;
//!     let datagram = server.receive().await?;
//!     println!("{} sent {:?}", datagram.address(), datagram.payload());
//!     Ok::<_, selio::Error>(())
//!   })?;
//!
//!   client.close();
//!   server.close();
//!   pool.run_until(futures::future::join(client.closed(), server.closed()));
//!   selector.close();
//!   Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Everything returns [`Result`] with the crate's [`Error`]. Would-block is
//! never surfaced: it is what makes a task suspend on the reactor.

#[macro_use]
mod macros;

mod address;
mod error;
pub mod net;
mod pool;
pub mod reactor;

pub use address::{Ipv4Address, Ipv6Address, SocketAddress};
pub use error::{Error, Result};
pub use net::{
  Datagram, DatagramSocket, DatagramSocketBuilder, SocketOptions, SocketState,
  StreamAttachment,
};
pub use pool::{BufferPool, MAX_DATAGRAM_SIZE, PooledBuf, Released};
pub use reactor::{Interest, ReactorConfig, Select, Selectable, SelectorManager};
