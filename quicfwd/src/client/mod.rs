// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The client side of the tunnel: local TCP listener and the supervised transport connection
use std::{io, sync::Arc, time::Duration};

use futures::Stream;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use crate::common::{
  tls::{self, ServerVerification, TlsError},
  transport::{quinn_transport, QuinnDialer, TransportConfigError, TransportDialer},
  TransportParameters,
};

pub mod listener;
pub mod supervisor;

use self::{
  listener::LocalSocket,
  supervisor::{ConnectionSupervisor, SupervisorOptions},
};

#[derive(Clone, Debug)]
pub struct ClientOptions {
  /// Local `host:port` on which TCP connections are accepted; host names are resolved at bind time
  pub local_addr: String,
  /// Server to tunnel to, as `host:port`; resolved on every connection attempt
  pub server: String,
  /// TLS server name; defaults to the host part of `server`
  pub server_name: Option<String>,
  pub verification: ServerVerification,
  pub transport: TransportParameters,
  pub supervisor: SupervisorOptions,
  /// Interval for per-session traffic logs, if enabled
  pub stats_interval: Option<Duration>,
}

impl ClientOptions {
  pub const DEFAULT_LOCAL_ADDR: &'static str = "127.0.0.1:8888";
  pub const DEFAULT_SERVER: &'static str = "localhost:4433";
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      local_addr: Self::DEFAULT_LOCAL_ADDR.to_string(),
      server: Self::DEFAULT_SERVER.to_string(),
      server_name: None,
      verification: ServerVerification::default(),
      transport: TransportParameters::default(),
      supervisor: SupervisorOptions::default(),
      stats_interval: None,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
  #[error("Failed to bind local listener on {addr}")]
  Bind {
    addr: String,
    #[source]
    source: io::Error,
  },
  #[error("Failed to configure TLS")]
  Tls(#[from] TlsError),
  #[error("Invalid transport parameters")]
  Parameters(#[from] TransportConfigError),
}

/// Run the client until `shutdown` is cancelled
///
/// Fails only during startup; once listening, all failures are per-session or transient.
pub async fn run_client(
  options: ClientOptions,
  shutdown: CancellationToken,
) -> Result<(), ClientError> {
  if options.verification == ServerVerification::Insecure {
    tracing::warn!(
      "Server certificate verification is disabled; the tunnel is encrypted but the server is not authenticated"
    );
  }
  let crypto = tls::client_crypto(&options.verification)?;
  let client_config = quinn_transport::client_config(crypto, &options.transport)?;
  let dialer = QuinnDialer::new(
    options.server.clone(),
    options.server_name.clone(),
    client_config,
  );
  let bind_error = |source| ClientError::Bind {
    addr: options.local_addr.clone(),
    source,
  };
  let listener = tokio::net::TcpListener::bind(options.local_addr.as_str())
    .await
    .map_err(bind_error)?;
  let local_addr = listener.local_addr().map_err(bind_error)?;
  tracing::info!(
    local = %local_addr,
    server = %options.server,
    server_name = dialer.server_name(),
    "Client listening"
  );
  serve(
    TcpListenerStream::new(listener),
    dialer,
    options.supervisor,
    options.stats_interval,
    shutdown,
  )
  .await;
  Ok(())
}

/// Drive the client over an arbitrary source of local sockets and transport dialer
///
/// Makes one establishment attempt up front, then serves sockets while the liveness
/// probe runs alongside. On shutdown the transport connection is closed.
pub async fn serve<D, I, S>(
  incoming: I,
  dialer: D,
  supervisor_options: SupervisorOptions,
  stats_interval: Option<Duration>,
  shutdown: CancellationToken,
) where
  D: TransportDialer,
  I: Stream<Item = io::Result<S>> + Send,
  S: LocalSocket,
{
  let supervisor = Arc::new(ConnectionSupervisor::new(dialer, supervisor_options));
  tokio::select! {
    _ = shutdown.cancelled() => return,
    initial = supervisor.get_connection() => {
      if let Err(error) = initial {
        tracing::warn!(error = %error, "Initial connection failed; will retry on demand");
      }
    }
  }
  let probe = tokio::task::spawn(Arc::clone(&supervisor).run_probe(shutdown.clone()));
  listener::serve_local(incoming, Arc::clone(&supervisor), stats_interval, shutdown).await;
  if let Err(error) = probe.await {
    tracing::error!(error = %error, "Liveness probe task failed");
  }
  supervisor.shutdown("client shutting down");
  tracing::info!("Client stopped");
}

#[cfg(test)]
mod tests {
  use super::{run_client, serve, supervisor::SupervisorOptions, ClientError, ClientOptions};
  use crate::common::transport::{memory, TransportConnection, TransportListener};
  use std::time::Duration;
  use tokio_util::sync::CancellationToken;

  #[test]
  fn default_options_match_documented_defaults() {
    let options = ClientOptions::default();
    assert_eq!(options.local_addr, "127.0.0.1:8888");
    assert_eq!(options.server, "localhost:4433");
    assert_eq!(options.supervisor.probe_interval, Duration::from_secs(5));
    assert_eq!(options.stats_interval, None);
  }

  #[tokio::test]
  async fn initial_failure_is_not_fatal_and_shutdown_stops_serving() {
    let (dialer, listener) = memory::listener();
    // Closed listener channel: every dial fails
    drop(listener);
    let shutdown = CancellationToken::new();
    let options = SupervisorOptions {
      establish_timeout: Duration::from_secs(1),
      probe_interval: Duration::from_millis(10),
      max_probe_backoff: None,
    };
    let serving = tokio::task::spawn(serve(
      futures::stream::pending::<std::io::Result<tokio::io::DuplexStream>>(),
      dialer.clone(),
      options,
      None,
      shutdown.clone(),
    ));
    tokio::time::timeout(Duration::from_secs(10), async {
      while dialer.dial_count() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("Probe must keep retrying after the initial failure");
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), serving)
      .await
      .expect("Client must stop on shutdown")
      .unwrap();
  }

  #[tokio::test]
  async fn shutdown_closes_the_connection() {
    let (dialer, listener) = memory::listener();
    let shutdown = CancellationToken::new();
    let serving = tokio::task::spawn(serve(
      futures::stream::pending::<std::io::Result<tokio::io::DuplexStream>>(),
      dialer,
      SupervisorOptions::default(),
      None,
      shutdown.clone(),
    ));
    let server_end = tokio::time::timeout(Duration::from_secs(10), async {
      listener.accept().await.unwrap().await.unwrap()
    })
    .await
    .unwrap();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), serving)
      .await
      .unwrap()
      .unwrap();
    assert!(server_end.is_closed());
  }

  #[tokio::test]
  async fn local_address_may_name_a_host() {
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let options = ClientOptions {
      local_addr: "localhost:0".to_string(),
      server: "127.0.0.1:9".to_string(),
      ..ClientOptions::default()
    };
    tokio::time::timeout(Duration::from_secs(10), run_client(options, shutdown))
      .await
      .expect("A cancelled client must return promptly")
      .expect("localhost must resolve and bind");
  }

  #[tokio::test]
  async fn unusable_local_address_is_a_bind_error() {
    let options = ClientOptions {
      local_addr: "127.0.0.1:notaport".to_string(),
      ..ClientOptions::default()
    };
    match run_client(options, CancellationToken::new()).await {
      Err(ClientError::Bind { addr, .. }) => assert_eq!(addr, "127.0.0.1:notaport"),
      other => panic!("Expected a bind error, got {:?}", other),
    }
  }
}
