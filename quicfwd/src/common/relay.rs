// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Full-duplex copying between one transport stream and one TCP socket
//!
//! The first direction to finish, by EOF or by error, tears down the whole
//! session: both endpoints are dropped without waiting for the other direction
//! to drain. Half-closed protocols are therefore not supported.
use std::{
  io,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  sync::{mpsc, watch},
  time::{Instant, Interval},
};

use crate::{
  common::{errors::TunnelError, id::SessionId},
  util::format::format_bytes,
};

pub const RELAY_BUFFER_CAPACITY: usize = 1024 * 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  SocketToStream,
  StreamToSocket,
}

impl std::fmt::Display for Direction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Self::SocketToStream => "socket->stream",
      Self::StreamToSocket => "stream->socket",
    })
  }
}

/// How the first direction to finish came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
  Eof,
  Failed(io::ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
  Active,
  Terminating,
  Closed,
}

/// Running byte counts for one session, updated as each chunk is written
#[derive(Debug, Default)]
pub struct RelayStats {
  socket_to_stream: AtomicU64,
  stream_to_socket: AtomicU64,
}

impl RelayStats {
  fn record(&self, direction: Direction, bytes: u64) {
    let counter = match direction {
      Direction::SocketToStream => &self.socket_to_stream,
      Direction::StreamToSocket => &self.stream_to_socket,
    };
    counter.fetch_add(bytes, Ordering::Relaxed);
  }

  pub fn socket_to_stream(&self) -> u64 {
    self.socket_to_stream.load(Ordering::Relaxed)
  }

  pub fn stream_to_socket(&self) -> u64 {
    self.stream_to_socket.load(Ordering::Relaxed)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
  pub first: Direction,
  pub end: DirectionEnd,
  pub socket_to_stream: u64,
  pub stream_to_socket: u64,
}

type Completion = (Direction, io::Result<u64>);

pub struct RelaySession<S, T> {
  id: SessionId,
  stream: S,
  socket: T,
  stats: Arc<RelayStats>,
  stats_interval: Option<Duration>,
  state: watch::Sender<RelayState>,
}

impl<S, T> RelaySession<S, T>
where
  S: AsyncRead + AsyncWrite + Send + 'static,
  T: AsyncRead + AsyncWrite + Send + 'static,
{
  pub fn new(id: SessionId, stream: S, socket: T) -> Self {
    Self {
      id,
      stream,
      socket,
      stats: Arc::new(RelayStats::default()),
      stats_interval: None,
      state: watch::channel(RelayState::Active).0,
    }
  }

  /// Log running traffic totals at this interval while the session is active
  pub fn with_stats_interval(mut self, stats_interval: Option<Duration>) -> Self {
    self.stats_interval = stats_interval;
    self
  }

  pub fn subscribe(&self) -> watch::Receiver<RelayState> {
    self.state.subscribe()
  }

  /// Relay until either direction ends, then close both endpoints
  ///
  /// Returns only once both copy tasks have stopped and both endpoints are dropped.
  pub async fn run(self) -> RelayOutcome {
    let Self {
      id,
      stream,
      socket,
      stats,
      stats_interval,
      state,
    } = self;
    let (stream_read, stream_write) = tokio::io::split(stream);
    let (socket_read, socket_write) = tokio::io::split(socket);
    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(2);

    let upstream = tokio::task::spawn(copy_direction(
      Direction::SocketToStream,
      socket_read,
      stream_write,
      Arc::clone(&stats),
      done_tx.clone(),
    ));
    let downstream = tokio::task::spawn(copy_direction(
      Direction::StreamToSocket,
      stream_read,
      socket_write,
      Arc::clone(&stats),
      done_tx,
    ));

    let mut ticker = stats_interval.map(|period| tokio::time::interval_at(Instant::now() + period, period));
    let (first, result) = loop {
      tokio::select! {
        completion = done_rx.recv() => {
          break completion.unwrap_or_else(|| {
            (
              Direction::SocketToStream,
              Err(io::Error::new(io::ErrorKind::Other, "relay copy tasks exited without reporting")),
            )
          });
        }
        _ = next_tick(&mut ticker) => {
          tracing::info!(
            session = %id,
            sent = %format_bytes(stats.socket_to_stream()),
            received = %format_bytes(stats.stream_to_socket()),
            "traffic"
          );
        }
      }
    };

    state.send_replace(RelayState::Terminating);
    upstream.abort();
    downstream.abort();
    // Aborted tasks resolve once their futures, and the endpoint halves they own, are dropped
    let _ = upstream.await;
    let _ = downstream.await;
    state.send_replace(RelayState::Closed);

    let end = match result {
      Ok(_) => DirectionEnd::Eof,
      Err(e) => {
        let kind = e.kind();
        tracing::warn!(
          session = %id,
          direction = %first,
          error = %TunnelError::RelayIo(e),
          "forwarding error"
        );
        DirectionEnd::Failed(kind)
      }
    };
    let outcome = RelayOutcome {
      first,
      end,
      socket_to_stream: stats.socket_to_stream(),
      stream_to_socket: stats.stream_to_socket(),
    };
    tracing::debug!(
      session = %id,
      ended_by = %first,
      reason = ?end,
      sent = %format_bytes(outcome.socket_to_stream),
      received = %format_bytes(outcome.stream_to_socket),
      "session closed"
    );
    outcome
  }
}

async fn next_tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(ticker) => {
      ticker.tick().await;
    }
    None => futures::future::pending::<()>().await,
  }
}

async fn copy_direction<R, W>(
  direction: Direction,
  mut reader: R,
  mut writer: W,
  stats: Arc<RelayStats>,
  done: mpsc::Sender<Completion>,
) where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let result = copy_counted(direction, &mut reader, &mut writer, &stats).await;
  // The receiver only disappears once the session has already begun tearing down
  let _ = done.send((direction, result)).await;
}

async fn copy_counted<R, W>(
  direction: Direction,
  reader: &mut R,
  writer: &mut W,
  stats: &RelayStats,
) -> io::Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; RELAY_BUFFER_CAPACITY];
  let mut total = 0u64;
  loop {
    let n = reader.read(&mut buf).await?;
    if n == 0 {
      writer.flush().await?;
      return Ok(total);
    }
    writer.write_all(&buf[..n]).await?;
    total += n as u64;
    stats.record(direction, n as u64);
  }
}

#[cfg(test)]
mod tests {
  use super::{Direction, DirectionEnd, RelaySession, RelayState};
  use crate::common::id::SessionId;
  use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
  };
  use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

  const TEST_TIMEOUT: Duration = Duration::from_secs(10);

  fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
  }

  #[tokio::test]
  async fn socket_eof_delivers_everything_then_closes_stream() {
    let (stream_near, mut stream_far) = duplex(16 * 1024);
    let (socket_near, mut socket_far) = duplex(16 * 1024);
    let session = RelaySession::new(SessionId::new(1), stream_near, socket_near);
    let relay = tokio::task::spawn(session.run());

    let data = payload(1024 * 1024 + 17);
    let writer = {
      let data = data.clone();
      async move {
        socket_far.write_all(&data).await.unwrap();
        socket_far.shutdown().await.unwrap();
        socket_far
      }
    };
    let reader = async move {
      let mut buf = Vec::new();
      stream_far.read_to_end(&mut buf).await.unwrap();
      buf
    };
    let (_socket_far, received) = tokio::time::timeout(TEST_TIMEOUT, futures::future::join(writer, reader))
      .await
      .expect("Relay stalled");
    assert_eq!(received.len(), data.len());
    assert!(received == data, "Relayed bytes differ from those written");

    let outcome = tokio::time::timeout(TEST_TIMEOUT, relay).await.unwrap().unwrap();
    assert_eq!(outcome.first, Direction::SocketToStream);
    assert_eq!(outcome.end, DirectionEnd::Eof);
    assert_eq!(outcome.socket_to_stream, data.len() as u64);
    assert_eq!(outcome.stream_to_socket, 0);
  }

  #[tokio::test]
  async fn stream_eof_delivers_everything_then_closes_socket() {
    let (stream_near, mut stream_far) = duplex(4096);
    let (socket_near, mut socket_far) = duplex(4096);
    let relay = tokio::task::spawn(RelaySession::new(SessionId::new(2), stream_near, socket_near).run());

    let data = payload(300_000);
    let writer = {
      let data = data.clone();
      async move {
        // Interleave small and large writes to exercise partial reads on the far side
        for chunk in data.chunks(7).take(100) {
          stream_far.write_all(chunk).await.unwrap();
          tokio::task::yield_now().await;
        }
        stream_far.write_all(&data[700..]).await.unwrap();
        drop(stream_far);
      }
    };
    let reader = async move {
      let mut buf = Vec::new();
      socket_far.read_to_end(&mut buf).await.unwrap();
      buf
    };
    let ((), received) = tokio::time::timeout(TEST_TIMEOUT, futures::future::join(writer, reader))
      .await
      .expect("Relay stalled");
    assert!(received == data, "Relayed bytes differ from those written");
    let outcome = tokio::time::timeout(TEST_TIMEOUT, relay).await.unwrap().unwrap();
    assert_eq!(outcome.first, Direction::StreamToSocket);
    assert_eq!(outcome.stream_to_socket, data.len() as u64);
  }

  #[tokio::test]
  async fn closing_one_side_closes_the_other() {
    let (stream_near, mut stream_far) = duplex(4096);
    let (socket_near, socket_far) = duplex(4096);
    let session = RelaySession::new(SessionId::new(3), stream_near, socket_near);
    let mut state = session.subscribe();
    assert_eq!(*state.borrow(), RelayState::Active);
    let relay = tokio::task::spawn(session.run());

    drop(socket_far);
    // Nothing was written, so the far end of the stream sees EOF once teardown drops it
    let mut buf = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, stream_far.read_to_end(&mut buf))
      .await
      .expect("Teardown did not propagate")
      .unwrap();
    assert!(buf.is_empty());

    tokio::time::timeout(TEST_TIMEOUT, async {
      while *state.borrow_and_update() != RelayState::Closed {
        if state.changed().await.is_err() {
          break;
        }
      }
    })
    .await
    .unwrap();
    assert_eq!(*state.borrow(), RelayState::Closed);
    relay.await.unwrap();
  }

  /// An endpoint whose reads fail immediately and whose writes never complete
  struct FailingEndpoint;

  impl AsyncRead for FailingEndpoint {
    fn poll_read(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
      Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
    }
  }

  impl AsyncWrite for FailingEndpoint {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
      Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      Poll::Pending
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      Poll::Pending
    }
  }

  #[tokio::test]
  async fn read_error_terminates_and_closes_both() {
    let (stream_near, mut stream_far) = duplex(4096);
    let relay = tokio::task::spawn(RelaySession::new(SessionId::new(4), stream_near, FailingEndpoint).run());
    let outcome = tokio::time::timeout(TEST_TIMEOUT, relay)
      .await
      .expect("Relay must not wait for the blocked direction")
      .unwrap();
    assert_eq!(outcome.first, Direction::SocketToStream);
    assert_eq!(outcome.end, DirectionEnd::Failed(io::ErrorKind::ConnectionReset));
    let mut buf = Vec::new();
    stream_far.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
  }
}
