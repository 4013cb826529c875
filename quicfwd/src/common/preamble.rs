// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The marker the client writes first on every stream it opens
//!
//! A QUIC stream reaches the peer only once its opener writes to it, so the
//! marker is what makes a stream visible for sessions whose local client waits
//! for the backend to speak first.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::errors::TunnelError;

pub const STREAM_PREAMBLE: u8 = 0x01;

/// Write the preamble on a freshly opened stream
pub async fn announce<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<(), TunnelError> {
  stream
    .write_u8(STREAM_PREAMBLE)
    .await
    .map_err(TunnelError::Announce)?;
  stream.flush().await.map_err(TunnelError::Announce)
}

/// Consume the preamble from an accepted stream, rejecting streams that begin otherwise
pub async fn expect_announcement<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), TunnelError> {
  let preamble = stream.read_u8().await.map_err(TunnelError::Preamble)?;
  match preamble {
    STREAM_PREAMBLE => Ok(()),
    other => Err(TunnelError::UnexpectedPreamble(other)),
  }
}
