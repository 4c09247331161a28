mod common;

use common::Harness;
use selio::{Datagram, DatagramSocket, Error, SocketAddress, SocketOptions};

const BROADCAST_PORT: u16 = 56700;

#[test]
#[ignore = "needs a network with a broadcast route and a free port 56700"]
fn test_broadcast_reaches_reusing_listener() {
  let mut h = Harness::new();

  let listen_options =
    SocketOptions::default().reuse_address(true).reuse_port(true);
  let listener = DatagramSocket::builder(&h.selector)
    .options(listen_options)
    .bind(
      SocketAddress::new([0, 0, 0, 0].into(), BROADCAST_PORT),
      &h.pool.spawner(),
    )
    .unwrap();

  let sender = DatagramSocket::builder(&h.selector)
    .options(SocketOptions::default().broadcast(true))
    .bind("0.0.0.0:0".parse().unwrap(), &h.pool.spawner())
    .unwrap();

  let target = SocketAddress::new([255, 255, 255, 255].into(), BROADCAST_PORT);
  let (listener_ref, sender_ref) = (&listener, &sender);
  h.pool.run_until(async move {
    sender_ref.send(Datagram::new("0123456789", target)).await.unwrap();
    let datagram = listener_ref.receive().await.unwrap();
    assert_eq!(datagram.payload(), &b"0123456789"[..]);
    assert_eq!(datagram.address().port(), sender_ref.local_address().port());
  });

  h.close_all(&[&listener, &sender]);
}

#[test]
fn test_broadcast_without_option_is_refused() {
  let mut h = Harness::new();
  let sender = DatagramSocket::builder(&h.selector)
    .bind("0.0.0.0:0".parse().unwrap(), &h.pool.spawner())
    .unwrap();

  let target = SocketAddress::new([255, 255, 255, 255].into(), BROADCAST_PORT);
  let sender_ref = &sender;
  let result = h.pool.run_until(async move {
    sender_ref.send(Datagram::new("nope", target)).await
  });

  let err = result.unwrap_err();
  assert!(
    err.is_permission_denied() || err.raw_os_error() == Some(libc::ENETUNREACH),
    "unexpected error: {err:?}"
  );
  // A refused datagram is not fatal to the socket.
  assert!(!sender.is_closed());
  assert!(!matches!(err, Error::SocketClosed));

  h.close_all(&[&sender]);
}
