// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Seams between the forwarding core and the multiplexed transport beneath it
#![warn(unused_imports, dead_code, unused_variables)]

use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::{errors::EstablishError, id::ConnectionId};

pub mod memory;
pub mod quinn_transport;

pub use self::quinn_transport::{
  QuinnConnection, QuinnDialer, QuinnListener, QuinnStream, TransportConfigError,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
  #[error("Peer does not support the transport version in use")]
  VersionMismatch,
  #[error("Transport error encountered")]
  TransportError,
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Connection closed by application")]
  ApplicationClosed,
  #[error("Connection reset by peer")]
  Reset,
  #[error("Connection timed out")]
  TimedOut,
  #[error("Connection closed locally")]
  LocallyClosed,
}

impl TransportError {
  /// Whether the connection ended in an orderly way rather than by failure
  ///
  /// Orderly endings are routine on the accept side and are logged quietly.
  pub fn is_orderly(&self) -> bool {
    matches!(
      self,
      Self::ApplicationClosed | Self::LocallyClosed | Self::ConnectionClosed
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddress {
  Memory,
  Socket(SocketAddr),
}

impl std::fmt::Display for PeerAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Memory => f.write_str("memory"),
      Self::Socket(addr) => write!(f, "{}", addr),
    }
  }
}

/// A handle to one established multiplexed connection
///
/// Handles are cheap to clone and all clones refer to the same connection.
pub trait TransportConnection: Clone + Send + Sync + 'static {
  type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

  fn id(&self) -> ConnectionId;

  fn peer(&self) -> PeerAddress;

  /// True once the connection has terminated for any reason
  fn is_closed(&self) -> bool;

  fn open_stream(&self) -> BoxFuture<'static, Result<Self::Stream, TransportError>>;

  /// Resolves with the next stream opened by the peer, or fails once the connection ends
  fn accept_stream(&self) -> BoxFuture<'static, Result<Self::Stream, TransportError>>;

  /// Close the connection and every stream on it; closing twice is a no-op
  fn close(&self, reason: &'static str);
}

/// Establishes outbound connections to one fixed peer
pub trait TransportDialer: Send + Sync + 'static {
  type Connection: TransportConnection;

  fn dial(&self) -> BoxFuture<'static, Result<Self::Connection, EstablishError>>;

  /// Human-readable description of the peer, for logging
  fn target(&self) -> String;
}

/// A connection whose handshake has not completed yet
pub type PendingConnection<C> = BoxFuture<'static, Result<C, TransportError>>;

/// Accepts inbound connections
pub trait TransportListener: Send + Sync + 'static {
  type Connection: TransportConnection;

  /// Resolves to `None` once the listener has been closed
  fn accept(&self) -> BoxFuture<'_, Option<PendingConnection<Self::Connection>>>;

  /// Stop accepting; pending and future `accept` calls resolve to `None`
  fn close(&self);
}
