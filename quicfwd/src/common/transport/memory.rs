// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! An in-process transport whose streams are [tokio::io::duplex] pipes
//!
//! Behaves like a multiplexed connection for the purposes of the forwarding core,
//! without sockets or TLS. Streams already open are unaffected by [TransportConnection::close].
#![warn(unused_imports, dead_code)]
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
  io::DuplexStream,
  sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Mutex,
  },
};
use tokio_util::sync::CancellationToken;

use super::{
  PeerAddress, PendingConnection, TransportConnection, TransportDialer, TransportError,
  TransportListener,
};
use crate::common::{
  errors::EstablishError,
  id::{ConnectionId, MonotonicAtomicGenerator},
};

static CONNECTION_IDS: MonotonicAtomicGenerator = MonotonicAtomicGenerator::new(1 << 32);

const STREAM_BUFFER: usize = 64 * 1024;

struct MemoryConnectionInner {
  id: ConnectionId,
  channel_to_remote: UnboundedSender<DuplexStream>,
  incoming: Arc<Mutex<UnboundedReceiver<DuplexStream>>>,
  // Shared with the entangled peer; cancelling it closes both ends
  closed: CancellationToken,
}

#[derive(Clone)]
pub struct MemoryConnection {
  inner: Arc<MemoryConnectionInner>,
}

/// Two connected ends of one in-memory connection
///
/// Streams opened on either end are accepted on the other.
pub fn entangled() -> (MemoryConnection, MemoryConnection) {
  let closed = CancellationToken::new();
  let (left_up, right_down) = mpsc::unbounded_channel();
  let (right_up, left_down) = mpsc::unbounded_channel();
  let end = |up, down, closed| MemoryConnection {
    inner: Arc::new(MemoryConnectionInner {
      id: CONNECTION_IDS.next(),
      channel_to_remote: up,
      incoming: Arc::new(Mutex::new(down)),
      closed,
    }),
  };
  (
    end(left_up, left_down, closed.clone()),
    end(right_up, right_down, closed),
  )
}

impl std::fmt::Debug for MemoryConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MemoryConnection")
      .field("id", &self.inner.id)
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl TransportConnection for MemoryConnection {
  type Stream = DuplexStream;

  fn id(&self) -> ConnectionId {
    self.inner.id
  }

  fn peer(&self) -> PeerAddress {
    PeerAddress::Memory
  }

  fn is_closed(&self) -> bool {
    self.inner.closed.is_cancelled() || self.inner.channel_to_remote.is_closed()
  }

  fn open_stream(&self) -> BoxFuture<'static, Result<Self::Stream, TransportError>> {
    let result = if self.inner.closed.is_cancelled() {
      Err(TransportError::ConnectionClosed)
    } else {
      let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
      self
        .inner
        .channel_to_remote
        .send(remote)
        .map(|()| local)
        .map_err(|_| TransportError::ConnectionClosed)
    };
    futures::future::ready(result).boxed()
  }

  fn accept_stream(&self) -> BoxFuture<'static, Result<Self::Stream, TransportError>> {
    let incoming = Arc::clone(&self.inner.incoming);
    let closed = self.inner.closed.clone();
    async move {
      let mut incoming = incoming.lock().await;
      tokio::select! {
        biased;
        _ = closed.cancelled() => Err(TransportError::ConnectionClosed),
        stream = incoming.recv() => stream.ok_or(TransportError::ConnectionClosed),
      }
    }
    .boxed()
  }

  fn close(&self, _reason: &'static str) {
    self.inner.closed.cancel();
  }
}

type IncomingConnection = Result<MemoryConnection, TransportError>;

/// Dials the [MemoryListener] it was created alongside
#[derive(Clone)]
pub struct MemoryDialer {
  to_listener: UnboundedSender<IncomingConnection>,
  dials: Arc<AtomicUsize>,
}

impl MemoryDialer {
  /// Number of times [TransportDialer::dial] has been called
  pub fn dial_count(&self) -> usize {
    self.dials.load(Ordering::SeqCst)
  }

  /// Make the listener observe a failed handshake on its next accept
  pub fn inject_handshake_failure(&self, error: TransportError) -> bool {
    self.to_listener.send(Err(error)).is_ok()
  }
}

impl TransportDialer for MemoryDialer {
  type Connection = MemoryConnection;

  fn dial(&self) -> BoxFuture<'static, Result<Self::Connection, EstablishError>> {
    self.dials.fetch_add(1, Ordering::SeqCst);
    let (client, server) = entangled();
    let result = self
      .to_listener
      .send(Ok(server))
      .map(|()| client)
      .map_err(|_| EstablishError::Unavailable);
    futures::future::ready(result).boxed()
  }

  fn target(&self) -> String {
    String::from("memory")
  }
}

pub struct MemoryListener {
  incoming: Mutex<UnboundedReceiver<IncomingConnection>>,
  closed: CancellationToken,
}

/// A listener and a dialer connected to it
pub fn listener() -> (MemoryDialer, MemoryListener) {
  let (to_listener, incoming) = mpsc::unbounded_channel();
  (
    MemoryDialer {
      to_listener,
      dials: Arc::new(AtomicUsize::new(0)),
    },
    MemoryListener {
      incoming: Mutex::new(incoming),
      closed: CancellationToken::new(),
    },
  )
}

impl TransportListener for MemoryListener {
  type Connection = MemoryConnection;

  fn accept(&self) -> BoxFuture<'_, Option<PendingConnection<Self::Connection>>> {
    async move {
      let mut incoming = self.incoming.lock().await;
      let next = tokio::select! {
        biased;
        _ = self.closed.cancelled() => None,
        next = incoming.recv() => next,
      }?;
      Some(futures::future::ready(next).boxed())
    }
    .boxed()
  }

  fn close(&self) {
    self.closed.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::{entangled, listener};
  use crate::common::transport::{
    TransportConnection, TransportDialer, TransportError, TransportListener,
  };
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn streams_cross_to_the_peer() {
    let fut = async {
      let (a, b) = entangled();
      let mut opened = a.open_stream().await.unwrap();
      let mut accepted = b.accept_stream().await.unwrap();
      opened.write_all(b"ping").await.unwrap();
      let mut buf = [0u8; 4];
      accepted.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"ping");

      // And in the other direction, on a new stream opened by the accepting side
      let mut reverse = b.open_stream().await.unwrap();
      let mut reverse_accepted = a.accept_stream().await.unwrap();
      reverse.write_all(b"pong").await.unwrap();
      drop(reverse);
      let mut buf = Vec::new();
      reverse_accepted.read_to_end(&mut buf).await.unwrap();
      assert_eq!(&buf, b"pong");
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("Memory transport test deadlocked");
  }

  #[tokio::test]
  async fn close_fails_both_ends() {
    let (a, b) = entangled();
    let pending_accept = tokio::task::spawn({
      let b = b.clone();
      async move { b.accept_stream().await }
    });
    a.close("test");
    assert!(a.is_closed() && b.is_closed());
    let accepted = tokio::time::timeout(Duration::from_secs(5), pending_accept)
      .await
      .expect("Accept must be woken by close")
      .unwrap();
    assert_eq!(accepted.err(), Some(TransportError::ConnectionClosed));
    assert_eq!(
      b.open_stream().await.err(),
      Some(TransportError::ConnectionClosed)
    );
  }

  #[tokio::test]
  async fn dropping_peer_closes_connection() {
    let (a, b) = entangled();
    drop(b);
    assert!(a.is_closed());
    assert!(a.open_stream().await.is_err());
  }

  #[tokio::test]
  async fn listener_yields_dialed_connections_and_injected_failures() {
    let (dialer, listener) = listener();
    assert!(dialer.inject_handshake_failure(TransportError::TimedOut));
    let client = dialer.dial().await.unwrap();
    assert_eq!(dialer.dial_count(), 1);

    let failed = listener.accept().await.expect("Listener is open").await;
    assert_eq!(failed.err(), Some(TransportError::TimedOut));
    let server = listener
      .accept()
      .await
      .expect("Listener is open")
      .await
      .unwrap();
    client.open_stream().await.unwrap();
    server.accept_stream().await.unwrap();

    listener.close();
    assert!(listener.accept().await.is_none());
  }
}
