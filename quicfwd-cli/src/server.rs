// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context, Result};
use quicfwd::server::{run_server, ServerOptions};
use tokio_util::sync::CancellationToken;

pub async fn server_main(config: ServerOptions, shutdown: CancellationToken) -> Result<()> {
  run_server(config, shutdown)
    .await
    .context("Server failed to start")
}
