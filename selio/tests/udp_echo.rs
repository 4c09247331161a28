mod common;

use bytes::Bytes;
use common::{Harness, loopback};
use futures::{executor::ThreadPool, future};
use selio::{
  BufferPool, Datagram, DatagramSocket, Error, SelectorManager, SocketAddress,
};

async fn echo(socket: &DatagramSocket, count: usize) {
  for _ in 0..count {
    let datagram = socket.receive().await.unwrap();
    socket.send(datagram).await.unwrap();
  }
}

#[test]
fn test_echo_roundtrip() {
  let mut h = Harness::new();
  let server = h.bind();
  let client = h.bind();
  let server_addr = server.local_address();

  let (server_ref, client_ref) = (&server, &client);
  h.pool.run_until(async move {
    let client_side = async {
      for word in ["alpha", "beta", "gamma"] {
        client_ref.send(Datagram::new(word, server_addr)).await.unwrap();
        let reply = client_ref.receive().await.unwrap();
        assert_eq!(reply.payload(), word.as_bytes());
        assert_eq!(reply.address(), server_addr);
      }
    };
    future::join(echo(server_ref, 3), client_side).await;
  });

  h.close_all(&[&server, &client]);
}

#[test]
fn test_datagrams_arrive_in_send_order() {
  let mut h = Harness::new();
  let server = h.bind();
  let client = h.bind();
  let server_addr = server.local_address();

  let (server_ref, client_ref) = (&server, &client);
  h.pool.run_until(async move {
    for i in 0..10 {
      let payload = format!("hello-{i}");
      client_ref.send(Datagram::new(payload, server_addr)).await.unwrap();
    }
    for i in 0..10 {
      let datagram = server_ref.receive().await.unwrap();
      assert_eq!(datagram.payload(), format!("hello-{i}").as_bytes());
      assert_eq!(datagram.address(), client_ref.local_address());
    }
  });

  h.close_all(&[&server, &client]);
}

#[test]
fn test_concurrent_sends_keep_call_order() {
  let mut h = Harness::new();
  let server = h.bind();
  let client = h.bind();
  let server_addr = server.local_address();

  let (server_ref, client_ref) = (&server, &client);
  h.pool.run_until(async move {
    let sends = (0..10u8)
      .map(|i| client_ref.send(Datagram::new(vec![i; 4], server_addr)));
    for result in future::join_all(sends).await {
      result.unwrap();
    }

    for i in 0..10u8 {
      let datagram = server_ref.receive().await.unwrap();
      assert_eq!(&datagram.payload()[..], &[i; 4]);
    }
  });

  h.close_all(&[&server, &client]);
}

#[test]
fn test_zero_length_datagram() {
  let mut h = Harness::new();
  let server = h.bind();
  let client = h.bind();
  let server_addr = server.local_address();

  let (server_ref, client_ref) = (&server, &client);
  h.pool.run_until(async move {
    client_ref.send(Datagram::new(Bytes::new(), server_addr)).await.unwrap();
    let datagram = server_ref.receive().await.unwrap();
    assert!(datagram.is_empty());
    assert_eq!(datagram.address(), client_ref.local_address());
  });

  h.close_all(&[&server, &client]);
}

#[test]
fn test_truncated_datagram_does_not_stop_the_socket() {
  let mut h = Harness::new();
  let server = DatagramSocket::builder(&h.selector)
    .pool(BufferPool::new(4, 8))
    .bind(loopback(), &h.pool.spawner())
    .unwrap();
  let client = h.bind();
  let server_addr = server.local_address();

  let (server_ref, client_ref) = (&server, &client);
  h.pool.run_until(async move {
    client_ref.send(Datagram::new(vec![9u8; 64], server_addr)).await.unwrap();
    match server_ref.receive().await {
      Err(Error::Truncated { capacity }) => assert_eq!(capacity, 8),
      other => panic!("expected truncation, got {other:?}"),
    }

    client_ref.send(Datagram::new("fits", server_addr)).await.unwrap();
    let datagram = server_ref.receive().await.unwrap();
    assert_eq!(datagram.payload(), &b"fits"[..]);
  });

  h.close_all(&[&server, &client]);
}

#[test]
fn test_exhausted_pool_resumes_after_release() {
  let mut h = Harness::new();
  let buffers = BufferPool::new(1, 1500);
  let held = buffers.try_borrow().unwrap();

  let server = DatagramSocket::builder(&h.selector)
    .pool(buffers.clone())
    .bind(loopback(), &h.pool.spawner())
    .unwrap();
  let client = h.bind();
  let server_addr = server.local_address();

  let (server_ref, client_ref) = (&server, &client);
  h.pool.run_until(async move {
    client_ref.send(Datagram::new("late", server_addr)).await.unwrap();
    match server_ref.receive().await {
      Err(Error::PoolExhausted { capacity }) => assert_eq!(capacity, 1),
      other => panic!("expected an exhausted pool, got {other:?}"),
    }

    drop(held);
    let datagram = server_ref.receive().await.unwrap();
    assert_eq!(datagram.payload(), &b"late"[..]);
  });

  h.close_all(&[&server, &client]);
  assert_eq!(buffers.available(), buffers.capacity());
}

#[test]
fn test_buffers_are_returned_after_close() {
  let mut h = Harness::new();
  let buffers = BufferPool::new(4, 2048);
  let server = DatagramSocket::builder(&h.selector)
    .pool(buffers.clone())
    .bind(loopback(), &h.pool.spawner())
    .unwrap();
  let client = h.bind();
  let server_addr = server.local_address();

  let (server_ref, client_ref) = (&server, &client);
  h.pool.run_until(async move {
    for _ in 0..20 {
      let payload: Vec<u8> =
        (0..fastrand::usize(1..2048)).map(|_| fastrand::u8(..)).collect();
      let datagram = Datagram::new(payload.clone(), server_addr);
      client_ref.send(datagram).await.unwrap();
      let datagram = server_ref.receive().await.unwrap();
      assert_eq!(&datagram.payload()[..], &payload[..]);
    }
  });

  // The receive loop is parked on the reactor with one buffer out.
  assert!(buffers.available() >= buffers.capacity() - 1);

  h.close_all(&[&server, &client]);
  assert_eq!(buffers.available(), buffers.capacity());
}

#[test]
fn test_sockets_on_a_thread_pool() {
  common::init_tracing();
  let selector = SelectorManager::new().unwrap();
  let executor = ThreadPool::new().unwrap();

  let server =
    DatagramSocket::builder(&selector).bind(loopback(), &executor).unwrap();
  let client =
    DatagramSocket::builder(&selector).bind(loopback(), &executor).unwrap();
  let server_addr: SocketAddress = server.local_address();

  futures::executor::block_on(async {
    let client_side = async {
      for i in 0..50u32 {
        let datagram = Datagram::new(i.to_be_bytes().to_vec(), server_addr);
        client.send(datagram).await.unwrap();
        let reply = client.receive().await.unwrap();
        assert_eq!(&reply.payload()[..], &i.to_be_bytes());
      }
    };
    future::join(echo(&server, 50), client_side).await;

    server.close();
    client.close();
    future::join(server.closed(), client.closed()).await;
  });

  selector.close();
}
