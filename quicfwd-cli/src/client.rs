// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context, Result};
use quicfwd::client::{run_client, ClientOptions};
use tokio_util::sync::CancellationToken;

pub async fn client_main(config: ClientOptions, shutdown: CancellationToken) -> Result<()> {
  run_client(config, shutdown)
    .await
    .context("Client failed to start")
}
