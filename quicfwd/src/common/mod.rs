// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

pub mod errors;
pub mod id;
pub mod preamble;
pub mod relay;
pub mod tls;
pub mod transport;

/// ALPN protocol identifier; client and server refuse to handshake on mismatch
pub const ALPN_QUIC_FORWARDER: &[u8] = b"quic-forwarder";

/// Parameters applied to every transport connection, on both sides of the tunnel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportParameters {
  /// A connection with no traffic for this long is considered dead
  pub idle_timeout: Duration,
  /// Interval at which keepalive packets are sent to hold the connection open
  pub keep_alive_interval: Duration,
  /// Maximum number of simultaneously open bidirectional streams a peer may open
  pub max_concurrent_streams: u32,
}

impl TransportParameters {
  pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
  pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
  pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 1024;
}

impl Default for TransportParameters {
  fn default() -> Self {
    Self {
      idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
      keep_alive_interval: Self::DEFAULT_KEEP_ALIVE_INTERVAL,
      max_concurrent_streams: Self::DEFAULT_MAX_CONCURRENT_STREAMS,
    }
  }
}
