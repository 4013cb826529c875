// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports, dead_code)]
use std::{
  io,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr},
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
  time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use pin_project_lite::pin_project;
use quinn::{IdleTimeout, TransportConfig, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{
  PeerAddress, PendingConnection, TransportConnection, TransportDialer, TransportError,
  TransportListener,
};
use crate::{
  common::{
    errors::EstablishError,
    id::{ConnectionId, MonotonicAtomicGenerator},
    TransportParameters,
  },
  util::validators::host_part,
};

static CONNECTION_IDS: MonotonicAtomicGenerator = MonotonicAtomicGenerator::new(1);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportConfigError {
  #[error("Idle timeout of {0:?} exceeds what the transport can encode")]
  IdleTimeoutTooLarge(Duration),
}

/// Maps our parameters onto quinn's transport configuration
///
/// Only bidirectional streams are used by the tunnel, so unidirectional streams are refused.
pub fn transport_config(
  params: &TransportParameters,
) -> Result<TransportConfig, TransportConfigError> {
  let idle_timeout = IdleTimeout::try_from(params.idle_timeout)
    .map_err(|_| TransportConfigError::IdleTimeoutTooLarge(params.idle_timeout))?;
  let mut transport_config = TransportConfig::default();
  transport_config
    .max_idle_timeout(Some(idle_timeout))
    .keep_alive_interval(Some(params.keep_alive_interval))
    .max_concurrent_bidi_streams(VarInt::from_u32(params.max_concurrent_streams))
    .max_concurrent_uni_streams(VarInt::from_u32(0));
  Ok(transport_config)
}

pub fn client_config(
  crypto: rustls::ClientConfig,
  params: &TransportParameters,
) -> Result<quinn::ClientConfig, TransportConfigError> {
  let mut config = quinn::ClientConfig::new(Arc::new(crypto));
  config.transport_config(Arc::new(transport_config(params)?));
  Ok(config)
}

pub fn server_config(
  crypto: rustls::ServerConfig,
  params: &TransportParameters,
) -> Result<quinn::ServerConfig, TransportConfigError> {
  let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
  config.transport_config(Arc::new(transport_config(params)?));
  Ok(config)
}

impl From<quinn::ConnectionError> for TransportError {
  fn from(connection_error: quinn::ConnectionError) -> Self {
    match connection_error {
      quinn::ConnectionError::VersionMismatch => Self::VersionMismatch,
      quinn::ConnectionError::TransportError(_) => Self::TransportError,
      quinn::ConnectionError::ConnectionClosed(_) => Self::ConnectionClosed,
      quinn::ConnectionError::ApplicationClosed(_) => Self::ApplicationClosed,
      quinn::ConnectionError::Reset => Self::Reset,
      quinn::ConnectionError::TimedOut => Self::TimedOut,
      quinn::ConnectionError::LocallyClosed => Self::LocallyClosed,
    }
  }
}

pin_project! {
  /// One QUIC bidirectional stream, presented as a single duplex byte stream
  pub struct QuinnStream {
    #[pin]
    send: quinn::SendStream,
    #[pin]
    recv: quinn::RecvStream,
  }
}

impl QuinnStream {
  pub fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
    Self { send, recv }
  }
}

impl AsyncRead for QuinnStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    AsyncRead::poll_read(self.project().recv, cx, buf)
  }
}

impl AsyncWrite for QuinnStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    AsyncWrite::poll_write(self.project().send, cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    AsyncWrite::poll_flush(self.project().send, cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    AsyncWrite::poll_shutdown(self.project().send, cx)
  }
}

#[derive(Clone)]
pub struct QuinnConnection {
  id: ConnectionId,
  connection: quinn::Connection,
  // Client connections own their endpoint; keeping it here ties the socket's lifetime to ours
  _endpoint: Option<quinn::Endpoint>,
}

impl QuinnConnection {
  pub fn new(connection: quinn::Connection, endpoint: Option<quinn::Endpoint>) -> Self {
    Self {
      id: CONNECTION_IDS.next(),
      connection,
      _endpoint: endpoint,
    }
  }
}

impl std::fmt::Debug for QuinnConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QuinnConnection")
      .field("id", &self.id)
      .field("remote", &self.connection.remote_address())
      .finish_non_exhaustive()
  }
}

impl TransportConnection for QuinnConnection {
  type Stream = QuinnStream;

  fn id(&self) -> ConnectionId {
    self.id
  }

  fn peer(&self) -> PeerAddress {
    PeerAddress::Socket(self.connection.remote_address())
  }

  fn is_closed(&self) -> bool {
    self.connection.close_reason().is_some()
  }

  fn open_stream(&self) -> BoxFuture<'static, Result<Self::Stream, TransportError>> {
    let connection = self.connection.clone();
    async move {
      let (send, recv) = connection.open_bi().await?;
      Ok(QuinnStream::new(send, recv))
    }
    .boxed()
  }

  fn accept_stream(&self) -> BoxFuture<'static, Result<Self::Stream, TransportError>> {
    let connection = self.connection.clone();
    async move {
      let (send, recv) = connection.accept_bi().await?;
      Ok(QuinnStream::new(send, recv))
    }
    .boxed()
  }

  fn close(&self, reason: &'static str) {
    self.connection.close(VarInt::from_u32(0), reason.as_bytes());
  }
}

/// Dials a fixed server, binding a fresh client endpoint for every attempt
///
/// The target is resolved on each dial so that reconnects follow DNS changes.
pub struct QuinnDialer {
  target: String,
  server_name: String,
  client_config: quinn::ClientConfig,
}

impl QuinnDialer {
  pub fn new(
    target: impl Into<String>,
    server_name: Option<String>,
    client_config: quinn::ClientConfig,
  ) -> Self {
    let target = target.into();
    let server_name = server_name.unwrap_or_else(|| host_part(&target).to_string());
    Self {
      target,
      server_name,
      client_config,
    }
  }

  pub fn server_name(&self) -> &str {
    &self.server_name
  }
}

async fn resolve(target: &str) -> Result<SocketAddr, EstablishError> {
  let resolve_error = |source: io::Error| EstablishError::Resolve {
    target: target.to_string(),
    source: Arc::new(source),
  };
  tokio::net::lookup_host(target)
    .await
    .map_err(resolve_error)?
    .next()
    .ok_or_else(|| {
      resolve_error(io::Error::new(
        io::ErrorKind::NotFound,
        "No addresses were resolved from the given host",
      ))
    })
}

impl TransportDialer for QuinnDialer {
  type Connection = QuinnConnection;

  fn dial(&self) -> BoxFuture<'static, Result<Self::Connection, EstablishError>> {
    let target = self.target.clone();
    let server_name = self.server_name.clone();
    let client_config = self.client_config.clone();
    async move {
      let addr = resolve(&target).await?;
      let bind_addr: SocketAddr = if addr.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
      } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
      };
      let endpoint =
        quinn::Endpoint::client(bind_addr).map_err(|e| EstablishError::Bind(Arc::new(e)))?;
      let connecting = endpoint
        .connect_with(client_config, addr, &server_name)
        .map_err(|e| EstablishError::Refused {
          target: target.clone(),
          reason: e.to_string(),
        })?;
      let connection = connecting
        .await
        .map_err(|e| EstablishError::Handshake {
          target: target.clone(),
          source: e.into(),
        })?;
      Ok(QuinnConnection::new(connection, Some(endpoint)))
    }
    .boxed()
  }

  fn target(&self) -> String {
    self.target.clone()
  }
}

pub struct QuinnListener {
  endpoint: quinn::Endpoint,
}

impl QuinnListener {
  pub fn bind(bind_addr: SocketAddr, server_config: quinn::ServerConfig) -> io::Result<Self> {
    let endpoint = quinn::Endpoint::server(server_config, bind_addr)?;
    Ok(Self { endpoint })
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.endpoint.local_addr()
  }

  /// Wait for all connections on the endpoint to be cleanly shut down
  pub async fn wait_idle(&self) {
    self.endpoint.wait_idle().await
  }
}

impl TransportListener for QuinnListener {
  type Connection = QuinnConnection;

  fn accept(&self) -> BoxFuture<'_, Option<PendingConnection<Self::Connection>>> {
    async move {
      let connecting = self.endpoint.accept().await?;
      let handshake = async move {
        let connection = connecting.await?;
        Ok(QuinnConnection::new(connection, None))
      };
      Some(handshake.boxed())
    }
    .boxed()
  }

  fn close(&self) {
    self
      .endpoint
      .close(VarInt::from_u32(0), b"server shutting down");
  }
}
