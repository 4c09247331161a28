#![allow(dead_code)]

use futures::executor::LocalPool;
use selio::{DatagramSocket, SelectorManager, SocketAddress};
use tracing_subscriber::EnvFilter;

/// Routes crate logs through the test harness. `RUST_LOG=selio=trace` for
/// the full picture.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn loopback() -> SocketAddress {
  "127.0.0.1:0".parse().unwrap()
}

pub struct Harness {
  pub selector: SelectorManager,
  pub pool: LocalPool,
}

impl Harness {
  pub fn new() -> Self {
    init_tracing();
    Self { selector: SelectorManager::new().unwrap(), pool: LocalPool::new() }
  }

  pub fn bind(&self) -> DatagramSocket {
    DatagramSocket::builder(&self.selector)
      .bind(loopback(), &self.pool.spawner())
      .unwrap()
  }

  /// Closes `sockets` and drives their tasks until the descriptors are
  /// released.
  pub fn close_all(&mut self, sockets: &[&DatagramSocket]) {
    for socket in sockets {
      socket.close();
    }
    let closed: Vec<_> = sockets.iter().map(|socket| socket.closed()).collect();
    self.pool.run_until(futures::future::join_all(closed));
  }
}
