// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Serves every stream of one transport connection by dialing the backend
use std::{io, sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing_futures::Instrument;

use crate::common::{
  errors::TunnelError,
  id::{MonotonicAtomicGenerator, SessionId},
  preamble,
  relay::{RelayOutcome, RelaySession},
  transport::TransportConnection,
};

static SESSION_IDS: MonotonicAtomicGenerator = MonotonicAtomicGenerator::new(1);

/// Opens the backend socket for each accepted stream
pub trait BackendConnector: Send + Sync + 'static {
  type Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static;

  fn connect(&self) -> BoxFuture<'static, Result<Self::Socket, TunnelError>>;

  fn target(&self) -> String;
}

/// Dials a fixed TCP backend, resolving it anew on every connect
#[derive(Clone, Debug)]
pub struct TcpBackend {
  target: String,
  dial_timeout: Duration,
}

impl TcpBackend {
  pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

  pub fn new(target: impl Into<String>, dial_timeout: Duration) -> Self {
    Self {
      target: target.into(),
      dial_timeout,
    }
  }
}

impl BackendConnector for TcpBackend {
  type Socket = tokio::net::TcpStream;

  fn connect(&self) -> BoxFuture<'static, Result<Self::Socket, TunnelError>> {
    let target = self.target.clone();
    let dial_timeout = self.dial_timeout;
    async move {
      let connected = tokio::time::timeout(dial_timeout, tokio::net::TcpStream::connect(&target))
        .await
        .unwrap_or_else(|_elapsed| {
          Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no connection within {:?}", dial_timeout),
          ))
        });
      let socket = connected.map_err(|source| TunnelError::DialBackend {
        target: target.clone(),
        source,
      })?;
      if let Err(error) = socket.set_nodelay(true) {
        tracing::debug!(error = %error, "failed to set TCP_NODELAY on backend socket");
      }
      Ok(socket)
    }
    .boxed()
  }

  fn target(&self) -> String {
    self.target.clone()
  }
}

/// Accept streams on `connection` until it terminates, relaying each to the backend
///
/// Every stream is served on its own task, so a slow backend dial never delays other streams.
pub async fn demultiplex<C, B>(connection: C, backend: Arc<B>, stats_interval: Option<Duration>)
where
  C: TransportConnection,
  B: BackendConnector,
{
  loop {
    let stream = match connection.accept_stream().await {
      Ok(stream) => stream,
      Err(error) if error.is_orderly() => {
        tracing::debug!(reason = %error, "connection ended");
        break;
      }
      Err(error) => {
        let error = TunnelError::StreamAccept(error);
        tracing::warn!(error = %error, cause = ?std::error::Error::source(&error), "connection failed");
        break;
      }
    };
    let session: SessionId = SESSION_IDS.next();
    let backend = Arc::clone(&backend);
    tokio::task::spawn(
      async move {
        tracing::debug!("stream accepted");
        if let Err(error) = forward_stream(session, stream, backend.as_ref(), stats_interval).await {
          tracing::warn!(error = %error, cause = ?std::error::Error::source(&error), "closing stream");
        }
      }
      .instrument(tracing::debug_span!("session", %session)),
    );
  }
}

/// Dial the backend for one accepted stream and relay between them
///
/// The stream must open with the tunnel preamble; the backend is dialed only after it
/// arrives. On any failure the stream is dropped, which closes it towards the client.
pub async fn forward_stream<S, B>(
  session: SessionId,
  mut stream: S,
  backend: &B,
  stats_interval: Option<Duration>,
) -> Result<RelayOutcome, TunnelError>
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  B: BackendConnector,
{
  preamble::expect_announcement(&mut stream).await?;
  let socket = backend.connect().await?;
  Ok(
    RelaySession::new(session, stream, socket)
      .with_stats_interval(stats_interval)
      .run()
      .await,
  )
}

#[cfg(test)]
pub(crate) mod tests {
  use super::{demultiplex, forward_stream, BackendConnector, TcpBackend};
  use crate::common::{
    errors::TunnelError,
    id::SessionId,
    preamble::{announce, STREAM_PREAMBLE},
    transport::{memory::entangled, TransportConnection},
  };
  use futures::{future::BoxFuture, FutureExt};
  use std::{
    io,
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  };
  use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

  const TEST_TIMEOUT: Duration = Duration::from_secs(10);

  /// A backend which echoes everything written to it
  #[derive(Default)]
  pub struct EchoBackend {
    pub connects: AtomicUsize,
  }

  impl BackendConnector for EchoBackend {
    type Socket = DuplexStream;

    fn connect(&self) -> BoxFuture<'static, Result<DuplexStream, TunnelError>> {
      self.connects.fetch_add(1, Ordering::SeqCst);
      let (near, far) = tokio::io::duplex(64 * 1024);
      tokio::task::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(far);
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
      });
      futures::future::ready(Ok(near)).boxed()
    }

    fn target(&self) -> String {
      String::from("echo")
    }
  }

  /// A backend which refuses every connection
  pub struct RefusingBackend;

  impl BackendConnector for RefusingBackend {
    type Socket = DuplexStream;

    fn connect(&self) -> BoxFuture<'static, Result<DuplexStream, TunnelError>> {
      futures::future::ready(Err(TunnelError::DialBackend {
        target: self.target(),
        source: io::ErrorKind::ConnectionRefused.into(),
      }))
      .boxed()
    }

    fn target(&self) -> String {
      String::from("refusing")
    }
  }

  #[tokio::test]
  async fn streams_are_served_concurrently() {
    let (client, server) = entangled();
    let backend = Arc::new(EchoBackend::default());
    tokio::task::spawn(demultiplex(server, Arc::clone(&backend), None));

    let mut streams = Vec::new();
    for i in 0..10u8 {
      let mut stream = client.open_stream().await.unwrap();
      announce(&mut stream).await.unwrap();
      stream.write_all(&[i; 100]).await.unwrap();
      streams.push((i, stream));
    }
    // Read back in reverse so that no stream depends on an earlier one finishing
    for (i, mut stream) in streams.into_iter().rev() {
      let mut buf = [0u8; 100];
      tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
      assert!(buf.iter().all(|b| *b == i));
    }
    assert_eq!(backend.connects.load(Ordering::SeqCst), 10);
  }

  #[tokio::test]
  async fn backend_failure_closes_only_that_stream() {
    let (client, server) = entangled();
    tokio::task::spawn(demultiplex(server, Arc::new(RefusingBackend), None));
    for _ in 0..2 {
      let mut stream = client.open_stream().await.unwrap();
      announce(&mut stream).await.unwrap();
      let mut buf = Vec::new();
      let read = tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .expect("Refused stream must be closed")
        .unwrap();
      assert_eq!(read, 0);
    }
    assert!(!client.is_closed());
  }

  #[tokio::test]
  async fn demultiplexer_exits_when_connection_closes() {
    let (client, server) = entangled();
    let serving = tokio::task::spawn(demultiplex(server, Arc::new(EchoBackend::default()), None));
    client.close("test");
    tokio::time::timeout(TEST_TIMEOUT, serving)
      .await
      .expect("Demultiplexer must stop")
      .unwrap();
  }

  #[tokio::test]
  async fn tcp_backend_dial_failure_names_the_target() {
    // Bind then drop to find a port with nothing listening
    let addr = {
      let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap()
    };
    let backend = TcpBackend::new(addr.to_string(), Duration::from_secs(5));
    let (stream, mut peer) = tokio::io::duplex(64);
    peer.write_all(&[STREAM_PREAMBLE]).await.unwrap();
    match forward_stream(SessionId::new(1), stream, &backend, None).await {
      Err(TunnelError::DialBackend { target, .. }) => assert_eq!(target, addr.to_string()),
      other => panic!("Expected a backend dial failure, got {:?}", other.map(|_| ())),
    }
  }

  #[tokio::test]
  async fn unannounced_stream_is_closed_without_dialing() {
    let (client, server) = entangled();
    let backend = Arc::new(EchoBackend::default());
    tokio::task::spawn(demultiplex(server, Arc::clone(&backend), None));
    let mut stream = client.open_stream().await.unwrap();
    stream.write_all(b"SSH-2.0").await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut buf))
      .await
      .expect("Unannounced stream must be closed")
      .unwrap();
    assert_eq!(read, 0);
    assert_eq!(backend.connects.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn backend_is_dialed_before_the_client_sends_payload() {
    let backend = EchoBackend::default();
    let (stream, mut peer) = tokio::io::duplex(64);
    let forwarding = forward_stream(SessionId::new(2), stream, &backend, None);
    let announcing = async {
      announce(&mut peer).await.unwrap();
      while backend.connects.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
      }
      drop(peer);
    };
    let (outcome, ()) = tokio::time::timeout(
      TEST_TIMEOUT,
      futures::future::join(forwarding, announcing),
    )
    .await
    .expect("Backend was never dialed for a silent stream");
    let outcome = outcome.unwrap();
    assert_eq!(outcome.socket_to_stream, 0);
    assert_eq!(outcome.stream_to_socket, 0);
  }
}
