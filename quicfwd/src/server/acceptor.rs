// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  errors::TunnelError,
  id::ConnectionId,
  transport::{PendingConnection, TransportConnection, TransportListener},
};

use super::demux::{demultiplex, BackendConnector};

pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Accepts transport connections and runs a demultiplexer for each
///
/// Live connections are tracked so that they can all be closed at shutdown.
pub struct SessionAcceptor<L: TransportListener, B> {
  listener: L,
  backend: Arc<B>,
  connections: Arc<DashMap<ConnectionId, L::Connection>>,
  stats_interval: Option<Duration>,
}

impl<L, B> SessionAcceptor<L, B>
where
  L: TransportListener,
  B: BackendConnector,
{
  pub fn new(listener: L, backend: Arc<B>, stats_interval: Option<Duration>) -> Self {
    Self {
      listener,
      backend,
      connections: Arc::new(DashMap::new()),
      stats_interval,
    }
  }

  pub fn listener(&self) -> &L {
    &self.listener
  }

  pub fn live_connections(&self) -> usize {
    self.connections.len()
  }

  /// Accept until the listener closes or `shutdown` is cancelled, then close every live connection
  pub async fn run(&self, shutdown: CancellationToken) {
    loop {
      let pending = tokio::select! {
        _ = shutdown.cancelled() => break,
        pending = self.listener.accept() => pending,
      };
      let pending = match pending {
        Some(pending) => pending,
        None => break,
      };
      tokio::task::spawn(Self::handle_connection(
        pending,
        Arc::clone(&self.connections),
        Arc::clone(&self.backend),
        self.stats_interval,
        shutdown.clone(),
      ));
    }
    self.listener.close();
    self.close_all(SHUTDOWN_REASON);
  }

  /// Close every tracked connection
  pub fn close_all(&self, reason: &'static str) {
    let closing = self.connections.len();
    if closing > 0 {
      tracing::info!(connections = closing, reason, "Closing live connections");
    }
    self
      .connections
      .iter()
      .for_each(|entry| entry.value().close(reason));
  }

  async fn handle_connection(
    pending: PendingConnection<L::Connection>,
    connections: Arc<DashMap<ConnectionId, L::Connection>>,
    backend: Arc<B>,
    stats_interval: Option<Duration>,
    shutdown: CancellationToken,
  ) {
    let connection = match pending.await {
      Ok(connection) => connection,
      Err(error) => {
        let error = TunnelError::ListenerAccept(Box::new(error));
        tracing::warn!(
          error = %error,
          cause = ?std::error::Error::source(&error),
          "Handshake failed"
        );
        return;
      }
    };
    let id = connection.id();
    let span = tracing::info_span!("connection", connection = %id, peer = %connection.peer());
    async move {
      connections.insert(id, connection.clone());
      // Shutdown may have swept the map while the handshake was still running
      if shutdown.is_cancelled() {
        connection.close(SHUTDOWN_REASON);
      } else {
        tracing::info!("Connection accepted");
        demultiplex(connection, backend, stats_interval).await;
      }
      connections.remove(&id);
      tracing::info!("Connection closed");
    }
    .instrument(span)
    .await
  }
}

#[cfg(test)]
mod tests {
  use super::SessionAcceptor;
  use crate::{
    common::{
      preamble::announce,
      transport::{memory, TransportConnection, TransportDialer, TransportError},
    },
    server::demux::tests::EchoBackend,
  };
  use std::{sync::Arc, time::Duration};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio_util::sync::CancellationToken;

  const TEST_TIMEOUT: Duration = Duration::from_secs(10);

  async fn wait_for_connections<L, B>(acceptor: &SessionAcceptor<L, B>, count: usize)
  where
    L: crate::common::transport::TransportListener,
    B: crate::server::demux::BackendConnector,
  {
    tokio::time::timeout(TEST_TIMEOUT, async {
      while acceptor.live_connections() != count {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("Connections were never tracked");
  }

  #[tokio::test]
  async fn handshake_failures_do_not_stop_accepting() {
    let (dialer, listener) = memory::listener();
    let acceptor = Arc::new(SessionAcceptor::new(
      listener,
      Arc::new(EchoBackend::default()),
      None,
    ));
    let shutdown = CancellationToken::new();
    let running = tokio::task::spawn({
      let acceptor = Arc::clone(&acceptor);
      let shutdown = shutdown.clone();
      async move { acceptor.run(shutdown).await }
    });

    assert!(dialer.inject_handshake_failure(TransportError::TimedOut));
    assert!(dialer.inject_handshake_failure(TransportError::VersionMismatch));
    let client = dialer.dial().await.unwrap();
    let mut stream = client.open_stream().await.unwrap();
    announce(&mut stream).await.unwrap();
    stream.write_all(b"accepted").await.unwrap();
    let mut buf = [0u8; 8];
    tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&buf, b"accepted");

    shutdown.cancel();
    tokio::time::timeout(TEST_TIMEOUT, running)
      .await
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn shutdown_closes_every_live_connection() {
    let (dialer, listener) = memory::listener();
    let acceptor = Arc::new(SessionAcceptor::new(
      listener,
      Arc::new(EchoBackend::default()),
      None,
    ));
    let shutdown = CancellationToken::new();
    let running = tokio::task::spawn({
      let acceptor = Arc::clone(&acceptor);
      let shutdown = shutdown.clone();
      async move { acceptor.run(shutdown).await }
    });
    let clients = vec![dialer.dial().await.unwrap(), dialer.dial().await.unwrap()];
    wait_for_connections(&acceptor, 2).await;

    shutdown.cancel();
    tokio::time::timeout(TEST_TIMEOUT, running)
      .await
      .unwrap()
      .unwrap();
    assert!(clients.iter().all(|client| client.is_closed()));
    wait_for_connections(&acceptor, 0).await;
  }

  #[tokio::test]
  async fn closed_connections_are_untracked() {
    let (dialer, listener) = memory::listener();
    let acceptor = Arc::new(SessionAcceptor::new(
      listener,
      Arc::new(EchoBackend::default()),
      None,
    ));
    let shutdown = CancellationToken::new();
    tokio::task::spawn({
      let acceptor = Arc::clone(&acceptor);
      let shutdown = shutdown.clone();
      async move { acceptor.run(shutdown).await }
    });
    let first = dialer.dial().await.unwrap();
    let _second = dialer.dial().await.unwrap();
    wait_for_connections(&acceptor, 2).await;
    first.close("client gone");
    wait_for_connections(&acceptor, 1).await;
    shutdown.cancel();
  }
}
