// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Duration};

use crate::common::transport::TransportError;

/// Failure to bring up a transport connection to the peer
///
/// Cloneable so that every caller joined to one in-flight attempt receives the outcome.
#[derive(thiserror::Error, Debug, Clone)]
pub enum EstablishError {
  #[error("Could not resolve peer address {target}")]
  Resolve {
    target: String,
    #[source]
    source: Arc<std::io::Error>,
  },
  #[error("Failed to bind a local endpoint")]
  Bind(#[source] Arc<std::io::Error>),
  #[error("Connection attempt to {target} refused locally: {reason}")]
  Refused { target: String, reason: String },
  #[error("Handshake with {target} failed")]
  Handshake {
    target: String,
    #[source]
    source: TransportError,
  },
  #[error("Timed out after {0:?} establishing a connection")]
  TimedOut(Duration),
  #[error("Peer is unavailable")]
  Unavailable,
}

/// Failures on the per-connection and per-session paths
///
/// None of these are fatal to the process; they are logged and abort only the
/// attempt, stream or session that produced them.
#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
  #[error("Could not establish a transport connection")]
  Establish(#[from] EstablishError),
  #[error("Failed to open a stream")]
  StreamOpen(#[source] TransportError),
  #[error("Failed to accept a stream")]
  StreamAccept(#[source] TransportError),
  #[error("Failed to announce a new stream to the peer")]
  Announce(#[source] std::io::Error),
  #[error("Stream ended before its preamble arrived")]
  Preamble(#[source] std::io::Error),
  #[error("Stream began with {0:#04x} instead of the tunnel preamble")]
  UnexpectedPreamble(u8),
  #[error("Failed to connect to backend {target}")]
  DialBackend {
    target: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Relay copy failed")]
  RelayIo(#[source] std::io::Error),
  #[error("Failed to accept a connection")]
  ListenerAccept(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}
