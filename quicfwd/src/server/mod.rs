// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The server side of the tunnel: accepts transport connections and forwards their streams
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::common::{
  tls::{self, ServerIdentity, TlsError},
  transport::{quinn_transport, QuinnListener, TransportConfigError},
  TransportParameters,
};

pub mod acceptor;
pub mod demux;

use self::{acceptor::SessionAcceptor, demux::TcpBackend};

/// Time allowed for connections to close cleanly after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ServerOptions {
  pub listen_addr: SocketAddr,
  /// Backend every stream is forwarded to, as `host:port`; resolved on every dial
  pub forward: String,
  /// PEM certificate chain; when absent with `key`, an ephemeral certificate is generated
  pub cert: Option<PathBuf>,
  pub key: Option<PathBuf>,
  /// Extra subject alternative names for the ephemeral certificate
  pub subject_alt_names: Vec<String>,
  pub dial_timeout: Duration,
  pub transport: TransportParameters,
  pub stats_interval: Option<Duration>,
}

impl ServerOptions {
  pub const DEFAULT_LISTEN_ADDR: &'static str = "0.0.0.0:4433";
  pub const DEFAULT_FORWARD: &'static str = "localhost:8080";
}

impl Default for ServerOptions {
  fn default() -> Self {
    Self {
      listen_addr: SocketAddr::from(([0, 0, 0, 0], 4433)),
      forward: Self::DEFAULT_FORWARD.to_string(),
      cert: None,
      key: None,
      subject_alt_names: Vec::new(),
      dial_timeout: TcpBackend::DEFAULT_DIAL_TIMEOUT,
      transport: TransportParameters::default(),
      stats_interval: None,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
  #[error("Failed to bind transport listener on {addr}")]
  Bind {
    addr: SocketAddr,
    #[source]
    source: io::Error,
  },
  #[error("Failed to configure TLS")]
  Tls(#[from] TlsError),
  #[error("Invalid transport parameters")]
  Parameters(#[from] TransportConfigError),
  #[error("Both a certificate and a private key must be given, or neither")]
  IncompleteIdentity,
}

impl ServerOptions {
  /// Load the configured identity, or generate an ephemeral one for `localhost` and any extra names
  pub fn identity(&self) -> Result<ServerIdentity, ServerError> {
    match (&self.cert, &self.key) {
      (Some(cert), Some(key)) => {
        tracing::info!(cert = %cert.display(), key = %key.display(), "Loading server identity");
        Ok(ServerIdentity::load(cert, key)?)
      }
      (None, None) => {
        let mut names = vec![String::from("localhost")];
        names.extend(
          self
            .subject_alt_names
            .iter()
            .filter(|name| name.as_str() != "localhost")
            .cloned(),
        );
        tracing::info!(subject_alt_names = ?names, "Generating an ephemeral self-signed certificate");
        Ok(ServerIdentity::ephemeral(names)?)
      }
      _ => Err(ServerError::IncompleteIdentity),
    }
  }
}

/// Bind the transport listener described by `options`
pub fn bind(options: &ServerOptions) -> Result<QuinnListener, ServerError> {
  let crypto = tls::server_crypto(options.identity()?)?;
  let server_config = quinn_transport::server_config(crypto, &options.transport)?;
  QuinnListener::bind(options.listen_addr, server_config).map_err(|source| ServerError::Bind {
    addr: options.listen_addr,
    source,
  })
}

/// Run the server until `shutdown` is cancelled
pub async fn run_server(
  options: ServerOptions,
  shutdown: CancellationToken,
) -> Result<(), ServerError> {
  let listener = bind(&options)?;
  tracing::info!(
    listen = %listener.local_addr().unwrap_or(options.listen_addr),
    forward = %options.forward,
    "Server listening"
  );
  serve(listener, &options, shutdown).await;
  Ok(())
}

/// Serve an already-bound listener, forwarding to `options.forward`
pub async fn serve(listener: QuinnListener, options: &ServerOptions, shutdown: CancellationToken) {
  let backend = Arc::new(TcpBackend::new(
    options.forward.clone(),
    options.dial_timeout,
  ));
  let acceptor = SessionAcceptor::new(listener, backend, options.stats_interval);
  acceptor.run(shutdown).await;
  if tokio::time::timeout(SHUTDOWN_GRACE, acceptor.listener().wait_idle())
    .await
    .is_err()
  {
    tracing::debug!("Connections did not close within the shutdown grace period");
  }
  tracing::info!("Server stopped");
}

#[cfg(test)]
mod tests {
  use super::{ServerError, ServerOptions};
  use std::time::Duration;

  #[test]
  fn default_options_match_documented_defaults() {
    let options = ServerOptions::default();
    assert_eq!(
      options.listen_addr,
      ServerOptions::DEFAULT_LISTEN_ADDR.parse().unwrap()
    );
    assert_eq!(options.forward, "localhost:8080");
    assert_eq!(options.dial_timeout, Duration::from_secs(10));
  }

  #[test]
  fn identity_requires_both_halves() {
    let options = ServerOptions {
      cert: Some("cert.pem".into()),
      ..Default::default()
    };
    assert!(matches!(
      options.identity(),
      Err(ServerError::IncompleteIdentity)
    ));
  }

  #[test]
  fn ephemeral_identity_is_generated_when_none_is_configured() {
    let options = ServerOptions {
      subject_alt_names: vec!["tunnel.example".into()],
      ..Default::default()
    };
    let identity = options.identity().unwrap();
    assert_eq!(identity.chain.len(), 1);
  }
}
