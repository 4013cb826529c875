// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Accepts local TCP sockets and maps each onto a fresh tunnel stream
use std::{io, sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  errors::TunnelError,
  id::{MonotonicAtomicGenerator, SessionId},
  preamble,
  relay::{RelayOutcome, RelaySession},
  transport::{TransportConnection, TransportDialer},
};

use super::supervisor::ConnectionSupervisor;

static SESSION_IDS: MonotonicAtomicGenerator = MonotonicAtomicGenerator::new(1);

/// Pause after a failed accept, so that exhaustion errors such as EMFILE don't spin the loop
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// A locally-accepted socket which can be relayed over the tunnel
pub trait LocalSocket: AsyncRead + AsyncWrite + Send + Unpin + 'static {
  /// Describes the remote end of the socket, for logging
  fn describe(&self) -> String;

  /// Apply socket options before relaying begins
  fn prepare(&self) {}
}

impl LocalSocket for tokio::net::TcpStream {
  fn describe(&self) -> String {
    self
      .peer_addr()
      .map(|addr| addr.to_string())
      .unwrap_or_else(|_| String::from("unknown"))
  }

  fn prepare(&self) {
    if let Err(error) = self.set_nodelay(true) {
      tracing::debug!(error = %error, "failed to set TCP_NODELAY on local socket");
    }
  }
}

impl LocalSocket for tokio::io::DuplexStream {
  fn describe(&self) -> String {
    String::from("memory")
  }
}

/// Accept sockets from `incoming` until it ends or `shutdown` is cancelled
///
/// Each socket is handled on its own task; accept errors are logged and accepting continues.
pub async fn serve_local<D, I, S>(
  incoming: I,
  supervisor: Arc<ConnectionSupervisor<D>>,
  stats_interval: Option<Duration>,
  shutdown: CancellationToken,
) where
  D: TransportDialer,
  I: Stream<Item = io::Result<S>> + Send,
  S: LocalSocket,
{
  let incoming = incoming.take_until(async move { shutdown.cancelled().await });
  futures::pin_mut!(incoming);
  while let Some(next) = incoming.next().await {
    let socket = match next {
      Ok(socket) => socket,
      Err(error) => {
        let error = TunnelError::ListenerAccept(Box::new(error));
        tracing::warn!(error = %error, cause = ?std::error::Error::source(&error), "continuing after accept failure");
        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
        continue;
      }
    };
    let session: SessionId = SESSION_IDS.next();
    let span = tracing::debug_span!("session", %session, local = %socket.describe());
    let supervisor = Arc::clone(&supervisor);
    tokio::task::spawn(
      async move {
        socket.prepare();
        match forward_socket(session, socket, &supervisor, stats_interval).await {
          Ok(outcome) => tracing::trace!(?outcome, "session finished"),
          Err(error) => tracing::warn!(error = %error, "closing local connection"),
        }
      }
      .instrument(span),
    );
  }
  tracing::debug!("local listener stopped");
}

/// Relay one local socket over a new stream of the shared connection
pub async fn forward_socket<D, S>(
  session: SessionId,
  socket: S,
  supervisor: &ConnectionSupervisor<D>,
  stats_interval: Option<Duration>,
) -> Result<RelayOutcome, TunnelError>
where
  D: TransportDialer,
  S: LocalSocket,
{
  let stream = open_tunnel_stream(supervisor).await?;
  tracing::debug!("stream opened");
  Ok(
    RelaySession::new(session, stream, socket)
      .with_stats_interval(stats_interval)
      .run()
      .await,
  )
}

/// Opens and announces a stream, replacing the connection and retrying once if the first try fails
async fn open_tunnel_stream<D: TransportDialer>(
  supervisor: &ConnectionSupervisor<D>,
) -> Result<<D::Connection as TransportConnection>::Stream, TunnelError> {
  let connection = supervisor.get_connection().await?;
  match open_announced(&connection).await {
    Ok(stream) => Ok(stream),
    Err(error) => {
      tracing::warn!(
        connection = %connection.id(),
        error = %error,
        "failed to open stream, reconnecting"
      );
      let connection = supervisor.reconnect(&connection).await?;
      open_announced(&connection).await
    }
  }
}

async fn open_announced<C: TransportConnection>(connection: &C) -> Result<C::Stream, TunnelError> {
  let mut stream = connection
    .open_stream()
    .await
    .map_err(TunnelError::StreamOpen)?;
  preamble::announce(&mut stream).await?;
  Ok(stream)
}
