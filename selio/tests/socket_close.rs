mod common;

use common::{Harness, loopback};
use futures::FutureExt;
use selio::{Datagram, DatagramSocket, Error, SocketState};

#[test]
fn test_close_is_idempotent() {
  let mut h = Harness::new();
  let socket = h.bind();
  h.pool.run_until_stalled();

  socket.close();
  socket.close();
  assert_eq!(socket.state(), SocketState::Closing);

  h.pool.run_until(socket.closed());
  assert_eq!(socket.state(), SocketState::Closed);

  socket.close();
  assert_eq!(socket.state(), SocketState::Closed);
  // Already resolved, so it completes without driving the pool.
  assert!(socket.closed().now_or_never().is_some());
}

#[test]
fn test_operations_fail_fast_after_close() {
  let mut h = Harness::new();
  let socket = h.bind();
  let target = socket.local_address();
  socket.close();

  let socket_ref = &socket;
  h.pool.run_until(async move {
    let sent = socket_ref.send(Datagram::new("late", target)).await;
    assert!(matches!(sent, Err(Error::SocketClosed)), "{sent:?}");

    let received = socket_ref.receive().await;
    assert!(matches!(received, Err(Error::SocketClosed)), "{received:?}");
  });

  h.pool.run_until(socket.closed());
}

#[test]
fn test_pending_receive_is_released_on_close() {
  let mut h = Harness::new();
  let socket = h.bind();

  let socket_ref = &socket;
  let result = h.pool.run_until(async move {
    let receive = socket_ref.receive();
    futures::pin_mut!(receive);
    assert!(futures::poll!(&mut receive).is_pending());

    socket_ref.close();
    receive.await
  });

  assert!(matches!(result, Err(Error::SocketClosed)), "{result:?}");
  h.pool.run_until(socket.closed());
  assert_eq!(socket.state(), SocketState::Closed);
}

#[test]
fn test_dropping_the_handle_closes_the_socket() {
  let mut h = Harness::new();
  let socket = h.bind();
  h.pool.run_until_stalled();

  let closed = socket.closed();
  drop(socket);
  h.pool.run_until(closed);
}

#[test]
fn test_selector_close_fails_the_socket() {
  let mut h = Harness::new();
  let socket = h.bind();
  let selector = h.selector.clone();

  let socket_ref = &socket;
  let result = h.pool.run_until(async move {
    let receive = socket_ref.receive();
    futures::pin_mut!(receive);
    assert!(futures::poll!(&mut receive).is_pending());

    selector.close();
    receive.await
  });

  assert!(matches!(result, Err(Error::ReactorClosed)), "{result:?}");
  h.pool.run_until(socket.closed());
  assert_eq!(socket.state(), SocketState::Closed);

  let err = DatagramSocket::builder(&h.selector)
    .bind(loopback(), &h.pool.spawner())
    .unwrap_err();
  assert!(matches!(err, Error::ReactorClosed), "{err:?}");
}
