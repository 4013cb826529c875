// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one transport connection for as long as it lives
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(u64);

/// Identifies one relay session (a stream paired with a TCP socket)
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

macro_rules! id_newtype {
  ($name:ident) => {
    impl $name {
      pub fn new(inner: u64) -> Self {
        Self(inner)
      }

      pub fn inner(&self) -> u64 {
        self.0
      }
    }

    impl From<u64> for $name {
      fn from(inner: u64) -> Self {
        Self::new(inner)
      }
    }

    impl From<$name> for u64 {
      fn from(id: $name) -> u64 {
        id.inner()
      }
    }

    impl std::fmt::Debug for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(stringify!($name)).field(&self.0).finish()
      }
    }

    impl std::fmt::Display for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
      }
    }
  };
}

id_newtype!(ConnectionId);
id_newtype!(SessionId);

/// Hands out strictly increasing ids; shared between concurrent accept tasks
#[derive(Debug)]
pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub const fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next<T: From<u64>>(&self) -> T {
    T::from(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for MonotonicAtomicGenerator {
  fn default() -> Self {
    Self::new(1)
  }
}
