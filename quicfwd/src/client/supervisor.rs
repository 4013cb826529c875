// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Ownership of the client's single transport connection
//!
//! All access to the connection goes through one mutex-guarded [ConnectionState].
//! Establishment is single-flight: callers arriving while an attempt is in
//! progress join that attempt instead of dialing again.
use std::{
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, Weak,
  },
  time::Duration,
};

use futures::{
  future::{BoxFuture, Shared},
  FutureExt,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  errors::EstablishError,
  id::ConnectionId,
  transport::{TransportConnection, TransportDialer},
};

type EstablishAttempt<C> = Shared<BoxFuture<'static, Result<C, EstablishError>>>;

enum ConnectionState<C> {
  Disconnected,
  Connecting {
    attempt: u64,
    future: EstablishAttempt<C>,
  },
  Established {
    connection: C,
    since: Instant,
  },
}

/// A snapshot of the supervisor's state, for logging and inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
  Disconnected,
  Connecting,
  Established { id: ConnectionId, since: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
  /// Upper bound on a single establishment attempt
  pub establish_timeout: Duration,
  /// How often the liveness probe runs
  pub probe_interval: Duration,
  /// Consecutive probe failures back off up to this delay; `None` retries every tick
  pub max_probe_backoff: Option<Duration>,
}

impl Default for SupervisorOptions {
  fn default() -> Self {
    Self {
      establish_timeout: Duration::from_secs(30),
      probe_interval: Duration::from_secs(5),
      max_probe_backoff: Some(Duration::from_secs(60)),
    }
  }
}

#[derive(Default)]
struct Backoff {
  consecutive_failures: u32,
  next_attempt: Option<Instant>,
}

/// State shared with in-flight establishment tasks
struct Tracked<C> {
  state: Mutex<ConnectionState<C>>,
  backoff: Mutex<Backoff>,
}

impl<C> Tracked<C> {
  fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState<C>> {
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn lock_backoff(&self) -> std::sync::MutexGuard<'_, Backoff> {
    self
      .backoff
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

pub struct ConnectionSupervisor<D: TransportDialer> {
  dialer: D,
  options: SupervisorOptions,
  tracked: Arc<Tracked<D::Connection>>,
  attempts: AtomicUsize,
}

impl<D: TransportDialer> ConnectionSupervisor<D> {
  pub fn new(dialer: D, options: SupervisorOptions) -> Self {
    Self {
      dialer,
      options,
      tracked: Arc::new(Tracked {
        state: Mutex::new(ConnectionState::Disconnected),
        backoff: Mutex::new(Backoff::default()),
      }),
      attempts: AtomicUsize::new(0),
    }
  }

  /// Number of establishment attempts started so far
  pub fn establish_count(&self) -> usize {
    self.attempts.load(Ordering::SeqCst)
  }

  pub fn state(&self) -> Liveness {
    match &*self.lock_state() {
      ConnectionState::Disconnected => Liveness::Disconnected,
      ConnectionState::Connecting { .. } => Liveness::Connecting,
      ConnectionState::Established { connection, since } => Liveness::Established {
        id: connection.id(),
        since: *since,
      },
    }
  }

  fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState<D::Connection>> {
    self.tracked.lock_state()
  }

  /// Returns a live connection, establishing one if none exists
  ///
  /// Safe to call concurrently; at most one establishment attempt is in flight at a time.
  pub async fn get_connection(&self) -> Result<D::Connection, EstablishError> {
    let attempt = {
      let mut state = self.lock_state();
      match &*state {
        ConnectionState::Established { connection, .. } if !connection.is_closed() => {
          return Ok(connection.clone());
        }
        ConnectionState::Established { connection, .. } => {
          tracing::info!(connection = %connection.id(), "connection lost");
          self.begin_attempt(&mut state)
        }
        ConnectionState::Connecting { future, .. } => future.clone(),
        ConnectionState::Disconnected => self.begin_attempt(&mut state),
      }
    };
    attempt.await
  }

  /// Discards `stale` if it is still the stored connection, then establishes a fresh one
  ///
  /// When another task has already replaced the connection, the replacement (or the
  /// attempt producing it) is used instead of dialing again.
  pub async fn reconnect(&self, stale: &D::Connection) -> Result<D::Connection, EstablishError> {
    {
      let mut state = self.lock_state();
      if let ConnectionState::Established { connection, .. } = &*state {
        if connection.id() == stale.id() {
          tracing::debug!(connection = %stale.id(), "discarding stale connection");
          *state = ConnectionState::Disconnected;
        }
      }
    }
    stale.close("connection discarded");
    self.get_connection().await
  }

  /// Registers a new shared establishment attempt; must be called with the state lock held
  fn begin_attempt(
    &self,
    state: &mut ConnectionState<D::Connection>,
  ) -> EstablishAttempt<D::Connection> {
    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) as u64 + 1;
    let dial = self.dialer.dial();
    let target = self.dialer.target();
    let timeout = self.options.establish_timeout;
    let tracked_ref = Arc::downgrade(&self.tracked);
    let abandoned_ref = tracked_ref.clone();
    // Runs on its own task so the attempt completes even if every waiter goes away
    let establishing = tokio::task::spawn(
      async move {
        let result = match tokio::time::timeout(timeout, dial).await {
          Ok(result) => result,
          Err(_elapsed) => Err(EstablishError::TimedOut(timeout)),
        };
        Self::complete_attempt(&tracked_ref, attempt, &result);
        match &result {
          Ok(connection) => {
            tracing::info!(connection = %connection.id(), peer = %connection.peer(), "connected")
          }
          Err(error) => {
            tracing::warn!(error = %error, "failed to establish connection")
          }
        }
        result
      }
      .instrument(tracing::debug_span!("establish", %target, attempt)),
    );
    let future = async move {
      match establishing.await {
        Ok(result) => result,
        Err(join_error) => {
          tracing::error!(error = %join_error, "connection attempt aborted");
          let result = Err(EstablishError::Unavailable);
          Self::complete_attempt(&abandoned_ref, attempt, &result);
          result
        }
      }
    }
    .boxed()
    .shared();
    *state = ConnectionState::Connecting {
      attempt,
      future: future.clone(),
    };
    future
  }

  fn complete_attempt(
    tracked: &Weak<Tracked<D::Connection>>,
    attempt: u64,
    result: &Result<D::Connection, EstablishError>,
  ) {
    let tracked = match tracked.upgrade() {
      Some(tracked) => tracked,
      None => return,
    };
    if result.is_ok() {
      *tracked.lock_backoff() = Backoff::default();
    }
    let mut state = tracked.lock_state();
    // Only the attempt currently registered may publish its result
    if matches!(&*state, ConnectionState::Connecting { attempt: current, .. } if *current == attempt)
    {
      *state = match result {
        Ok(connection) => ConnectionState::Established {
          connection: connection.clone(),
          since: Instant::now(),
        },
        Err(_) => ConnectionState::Disconnected,
      };
    }
  }

  /// One liveness-probe tick
  ///
  /// Healthy or in-progress connections are left alone; otherwise a single
  /// establishment attempt is made, subject to backoff after repeated failures.
  pub async fn probe(&self) {
    let needs_connection = {
      let mut state = self.lock_state();
      match &*state {
        ConnectionState::Established { connection, .. } if connection.is_closed() => {
          tracing::info!(connection = %connection.id(), "connection lost, attempting to reconnect");
          *state = ConnectionState::Disconnected;
          true
        }
        ConnectionState::Established { .. } | ConnectionState::Connecting { .. } => false,
        ConnectionState::Disconnected => true,
      }
    };
    if !needs_connection || !self.backoff_elapsed() {
      return;
    }
    // Successful establishment clears the backoff, whoever triggered it
    if let Err(error) = self.get_connection().await {
      tracing::warn!(error = %error, "reconnection failed");
      self.record_probe_failure();
    }
  }

  fn backoff_elapsed(&self) -> bool {
    self
      .tracked
      .lock_backoff()
      .next_attempt
      .map_or(true, |next_attempt| Instant::now() >= next_attempt)
  }

  fn record_probe_failure(&self) {
    let mut backoff = self.tracked.lock_backoff();
    backoff.consecutive_failures = backoff.consecutive_failures.saturating_add(1);
    if let Some(max) = self.options.max_probe_backoff {
      let delay = probe_backoff_delay(
        self.options.probe_interval,
        max,
        backoff.consecutive_failures,
      );
      backoff.next_attempt = Some(Instant::now() + delay);
    }
  }

  /// Run the liveness probe every `probe_interval` until `shutdown` is cancelled
  pub async fn run_probe(self: Arc<Self>, shutdown: CancellationToken) {
    let period = self.options.probe_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = ticker.tick() => self.probe().await,
      }
    }
    tracing::debug!("liveness probe stopped");
  }

  /// Close the current connection, if any, and forget it
  pub fn shutdown(&self, reason: &'static str) {
    let previous = std::mem::replace(&mut *self.lock_state(), ConnectionState::Disconnected);
    if let ConnectionState::Established { connection, .. } = previous {
      connection.close(reason);
    }
  }
}

/// Delay before the next probe attempt after `failures` consecutive failures
///
/// The first failure waits nothing beyond the regular tick; later ones double up to `max`.
pub fn probe_backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
  if failures <= 1 {
    return Duration::ZERO;
  }
  let exponent = (failures - 1).min(16);
  base.saturating_mul(1u32 << exponent).min(max)
}
