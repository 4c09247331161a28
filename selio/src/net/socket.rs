use std::{
  fmt,
  future::Future,
  os::fd::{AsRawFd, OwnedFd, RawFd},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use bytes::Bytes;
use futures::{
  SinkExt, StreamExt,
  channel::{mpsc, oneshot},
  future::{self, Either, FutureExt, Shared},
  lock::Mutex as AsyncMutex,
  task::{Spawn, SpawnExt},
};
use parking_lot::Mutex;

use super::{Datagram, SocketOptions, sys};
use crate::{
  address::SocketAddress,
  error::{Error, Result, is_would_block},
  pool::BufferPool,
  reactor::{Interest, Selectable, SelectorManager},
};

/// Lifecycle of a [`DatagramSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
  Open,
  /// `close` began, the socket tasks are winding down.
  Closing,
  /// The descriptor is shut down and released. Terminal.
  Closed,
}

type Outgoing = (Datagram, oneshot::Sender<Result<()>>);

/// A non-blocking UDP socket driven by a [`SelectorManager`].
///
/// Two background tasks run per socket, spawned on the executor given at
/// bind time: a sender that drains the outgoing queue one datagram at a
/// time, and a receiver that fills the incoming queue. Both only suspend on
/// the reactor after the OS reported would-block.
///
/// ```no_run
/// use futures::executor::LocalPool;
/// use selio::{Datagram, DatagramSocket, SelectorManager};
///
/// let selector = SelectorManager::new()?;
/// let mut pool = LocalPool::new();
/// let socket = DatagramSocket::builder(&selector)
///   .bind("127.0.0.1:0".parse().unwrap(), &pool.spawner())?;
///
/// let addr = socket.local_address();
/// pool.run_until(async {
///   socket.send(Datagram::new("ping", addr)).await?;
///   let reply = socket.receive().await?;
///   assert_eq!(&reply.payload()[..], b"ping");
///   Ok::<_, selio::Error>(())
/// })?;
/// # Ok::<_, selio::Error>(())
/// ```
pub struct DatagramSocket {
  engine: Arc<Engine>,
  outgoing: mpsc::Sender<Outgoing>,
  incoming: AsyncMutex<mpsc::Receiver<Result<Datagram>>>,
}

/// Configures and opens a [`DatagramSocket`].
#[must_use = "a builder does nothing until bound"]
pub struct DatagramSocketBuilder<'a> {
  selector: &'a SelectorManager,
  options: SocketOptions,
  pool: Option<Arc<BufferPool>>,
  incoming_capacity: usize,
}

impl<'a> DatagramSocketBuilder<'a> {
  pub const DEFAULT_INCOMING_CAPACITY: usize = 16;

  pub fn options(mut self, options: SocketOptions) -> Self {
    self.options = options;
    self
  }

  /// Pool the receive loop borrows from. Each socket gets a fresh default
  /// pool otherwise.
  pub fn pool(mut self, pool: Arc<BufferPool>) -> Self {
    self.pool = Some(pool);
    self
  }

  /// Received datagrams buffered before the receive loop pauses.
  pub fn incoming_capacity(mut self, capacity: usize) -> Self {
    self.incoming_capacity = capacity;
    self
  }

  /// Binds to `local` (port 0 picks an ephemeral port) and starts the
  /// socket tasks on `spawner`.
  pub fn bind<S>(
    self,
    local: SocketAddress,
    spawner: &S,
  ) -> Result<DatagramSocket>
  where
    S: Spawn + ?Sized,
  {
    self.open(local.family(), Some(local), None, spawner)
  }

  /// Like [`bind`](Self::bind), but also fixes the peer: datagrams always go
  /// to `remote` and only datagrams from `remote` are received. Without
  /// `local`, the OS picks the local address.
  pub fn connect<S>(
    self,
    remote: SocketAddress,
    local: Option<SocketAddress>,
    spawner: &S,
  ) -> Result<DatagramSocket>
  where
    S: Spawn + ?Sized,
  {
    self.open(remote.family(), local, Some(remote), spawner)
  }

  fn open<S>(
    self,
    family: libc::sa_family_t,
    local: Option<SocketAddress>,
    remote: Option<SocketAddress>,
    spawner: &S,
  ) -> Result<DatagramSocket>
  where
    S: Spawn + ?Sized,
  {
    let family = family as libc::c_int;
    let owned = sys::socket(family, libc::SOCK_DGRAM)?;
    let fd = owned.as_raw_fd();
    self.options.apply(fd, family)?;
    if let Some(local) = &local {
      sys::bind(fd, local)?;
    }
    if let Some(remote) = &remote {
      sys::connect(fd, remote)?;
    }
    let local = sys::local_address(fd)?;

    let selectable = self.selector.selectable(fd)?;
    let pool = self.pool.unwrap_or_else(|| {
      BufferPool::new(
        BufferPool::DEFAULT_CAPACITY,
        BufferPool::DEFAULT_BUFFER_SIZE,
      )
    });

    let (stop_tx, stop_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    let engine = Arc::new(Engine {
      fd,
      owned: Mutex::new(Some(owned)),
      selectable,
      selector: self.selector.clone(),
      pool,
      local,
      remote,
      state: Mutex::new(SocketState::Open),
      stop_tx: Mutex::new(Some(stop_tx)),
      stop: stop_rx.shared(),
      closed_tx: Mutex::new(Some(closed_tx)),
      closed: closed_rx.shared(),
      running_tasks: AtomicUsize::new(0),
    });

    let (outgoing_tx, outgoing_rx) = mpsc::channel(0);
    let (incoming_tx, incoming_rx) = mpsc::channel(self.incoming_capacity);

    engine.spawn(spawner, run_sender(Arc::clone(&engine), outgoing_rx))?;
    engine.spawn(spawner, run_receiver(Arc::clone(&engine), incoming_tx))?;

    tracing::debug!(%local, ?remote, "datagram socket bound");
    Ok(DatagramSocket {
      engine,
      outgoing: outgoing_tx,
      incoming: AsyncMutex::new(incoming_rx),
    })
  }
}

impl DatagramSocket {
  pub fn builder(selector: &SelectorManager) -> DatagramSocketBuilder<'_> {
    DatagramSocketBuilder {
      selector,
      options: SocketOptions::default(),
      pool: None,
      incoming_capacity: DatagramSocketBuilder::DEFAULT_INCOMING_CAPACITY,
    }
  }

  /// Sends one datagram. Resolves once the sender task has attempted it,
  /// with the outcome of that attempt. Datagrams leave in call order.
  ///
  /// On a connected socket the datagram's address is ignored.
  pub async fn send(&self, datagram: Datagram) -> Result<()> {
    self.engine.ensure_open()?;

    let (reply_tx, reply_rx) = oneshot::channel();
    let mut outgoing = self.outgoing.clone();
    outgoing
      .send((datagram, reply_tx))
      .await
      .map_err(|_| Error::SocketClosed)?;

    reply_rx.await.unwrap_or(Err(Error::SocketClosed))
  }

  /// Next received datagram, or the next receive failure.
  ///
  /// Failures that only concern one datagram (for example
  /// [`Error::Truncated`]) don't stop the socket, later calls keep
  /// receiving.
  pub async fn receive(&self) -> Result<Datagram> {
    self.engine.ensure_open()?;

    let mut incoming = self.incoming.lock().await;
    match incoming.next().await {
      Some(item) => item,
      None => Err(Error::SocketClosed),
    }
  }

  /// Starts closing the socket. Pending and later `send`/`receive` calls
  /// fail with [`Error::SocketClosed`]. Await [`closed`](Self::closed) for
  /// the descriptor to be released. Calling this twice is a no-op.
  pub fn close(&self) {
    self.engine.begin_close();
  }

  /// Resolves once the socket is [`SocketState::Closed`].
  pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
    let closed = self.engine.closed.clone();
    async move {
      let _ = closed.await;
    }
  }

  pub fn state(&self) -> SocketState {
    *self.engine.state.lock()
  }

  pub fn is_closed(&self) -> bool {
    self.state() != SocketState::Open
  }

  /// Bound address, with the port the OS picked for port 0.
  pub fn local_address(&self) -> SocketAddress {
    self.engine.local
  }

  pub fn remote_address(&self) -> Result<SocketAddress> {
    self.engine.remote.ok_or(Error::NotConnected)
  }

  pub fn pool(&self) -> &Arc<BufferPool> {
    &self.engine.pool
  }
}

impl Drop for DatagramSocket {
  fn drop(&mut self) {
    self.engine.begin_close();
  }
}

impl fmt::Debug for DatagramSocket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DatagramSocket")
      .field("fd", &self.engine.fd)
      .field("local", &self.engine.local)
      .field("remote", &self.engine.remote)
      .field("state", &self.state())
      .finish()
  }
}

/// State shared between a socket handle and its two tasks.
struct Engine {
  fd: RawFd,
  /// Released once both tasks have stopped.
  owned: Mutex<Option<OwnedFd>>,
  selectable: Arc<Selectable>,
  selector: SelectorManager,
  pool: Arc<BufferPool>,
  local: SocketAddress,
  remote: Option<SocketAddress>,
  state: Mutex<SocketState>,
  stop_tx: Mutex<Option<oneshot::Sender<()>>>,
  stop: Shared<oneshot::Receiver<()>>,
  closed_tx: Mutex<Option<oneshot::Sender<()>>>,
  closed: Shared<oneshot::Receiver<()>>,
  running_tasks: AtomicUsize,
}

impl Engine {
  fn spawn<S, F>(&self, spawner: &S, task: F) -> Result<()>
  where
    S: Spawn + ?Sized,
    F: Future<Output = ()> + Send + 'static,
  {
    self.running_tasks.fetch_add(1, Ordering::AcqRel);
    spawner.spawn(task).map_err(|err| {
      // The task never ran, so it won't report back itself.
      self.begin_close();
      self.finish_task("spawn");
      Error::from(err)
    })
  }

  fn ensure_open(&self) -> Result<()> {
    match *self.state.lock() {
      SocketState::Open => Ok(()),
      _ => Err(Error::SocketClosed),
    }
  }

  fn is_open(&self) -> bool {
    self.ensure_open().is_ok()
  }

  /// Open → Closing. Wakes both tasks; the last one to exit releases the
  /// descriptor.
  fn begin_close(&self) {
    {
      let mut state = self.state.lock();
      if *state != SocketState::Open {
        return;
      }
      *state = SocketState::Closing;
    }

    if let Some(stop) = self.stop_tx.lock().take() {
      let _ = stop.send(());
    }
    self.selector.deregister(&self.selectable);
    tracing::debug!(local = %self.local, "closing datagram socket");
  }

  fn finish_task(&self, task: &'static str) {
    tracing::debug!(local = %self.local, task, "socket task exited");
    if self.running_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.finalize();
    }
  }

  fn finalize(&self) {
    self.begin_close();

    if let Some(fd) = self.owned.lock().take() {
      if let Err(err) = sys::shutdown(fd.as_raw_fd(), libc::SHUT_RDWR) {
        tracing::warn!(local = %self.local, %err, "shutdown failed");
      }
      drop(fd);
    }

    *self.state.lock() = SocketState::Closed;
    if let Some(closed) = self.closed_tx.lock().take() {
      let _ = closed.send(());
    }
    tracing::debug!(local = %self.local, "datagram socket closed");
  }

  async fn transmit(&self, datagram: &Datagram) -> Result<()> {
    let target = match self.remote {
      Some(_) => None,
      None => Some(datagram.address()),
    };

    loop {
      match retry_interrupted!(sys::send_to(
        self.fd,
        datagram.payload(),
        target.as_ref()
      )) {
        Ok(0) if !datagram.is_empty() => return Err(Error::PeerClosed),
        Ok(_) => return Ok(()),
        Err(err) if is_would_block(&err) => {
          self.selector.select(&self.selectable, Interest::WRITE).await?;
        }
        Err(err) => return Err(err.into()),
      }
    }
  }

  async fn receive_one(&self) -> Result<Datagram> {
    let Some(mut buf) = self.pool.try_borrow() else {
      return Err(Error::PoolExhausted { capacity: self.pool.capacity() });
    };

    loop {
      match retry_interrupted!(sys::recv_from(self.fd, &mut buf)) {
        Ok(received) if received.truncated => {
          return Err(Error::Truncated { capacity: buf.len() });
        }
        Ok(received) => {
          // Connected sockets may not report a source.
          let source = SocketAddress::from_storage(&received.source)
            .or_else(|err| self.remote.ok_or(err))?;
          let payload = Bytes::copy_from_slice(&buf[..received.len]);
          return Ok(Datagram::new(payload, source));
        }
        Err(err) if is_would_block(&err) => {
          self.selector.select(&self.selectable, Interest::READ).await?;
        }
        Err(err) => return Err(err.into()),
      }
    }
  }
}

async fn run_sender(
  engine: Arc<Engine>,
  mut outgoing: mpsc::Receiver<Outgoing>,
) {
  let mut stop = engine.stop.clone();

  loop {
    let (datagram, reply) =
      match future::select(outgoing.next(), &mut stop).await {
        Either::Left((Some(item), _)) => item,
        _ => break,
      };

    let result = engine.transmit(&datagram).await;
    let terminal = result.as_ref().is_err_and(Error::is_terminal);
    if let Err(err) = &result {
      tracing::trace!(local = %engine.local, %err, "send failed");
    }
    // The caller may have given up on the reply.
    let _ = reply.send(result);

    if terminal {
      engine.begin_close();
      break;
    }
  }

  engine.finish_task("sender");
}

async fn run_receiver(
  engine: Arc<Engine>,
  mut incoming: mpsc::Sender<Result<Datagram>>,
) {
  let mut stop = engine.stop.clone();

  while engine.is_open() {
    let result = engine.receive_one().await;
    if matches!(result, Err(Error::SocketClosed)) {
      break;
    }
    let terminal = result.as_ref().is_err_and(Error::is_terminal);
    let exhausted = matches!(result, Err(Error::PoolExhausted { .. }));

    // A full queue pauses the loop until the socket is read from.
    match future::select(incoming.send(result), &mut stop).await {
      Either::Left((Ok(()), _)) => {}
      _ => break,
    }

    if terminal {
      engine.begin_close();
      break;
    }
    if exhausted {
      if let Either::Right(_) =
        future::select(engine.pool.released(), &mut stop).await
      {
        break;
      }
    }
  }

  engine.finish_task("receiver");
}
