// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context, Result};
use quicfwd::common::tls::generate_self_signed;
use std::{
  fs,
  path::{Path, PathBuf},
};
use tracing::instrument;

/// `<base>.<suffix>`, keeping the base's directory
fn sibling(base: &Path, suffix: &str) -> Result<PathBuf> {
  let file_name = base
    .file_name()
    .and_then(|name| name.to_str())
    .context("Output path must end in a valid UTF-8 file name")?;
  Ok(base.with_file_name(format!("{}.{}", file_name, suffix)))
}

#[instrument]
pub async fn certgen_main(output_base_path: String, sans: Vec<String>) -> Result<()> {
  let path = PathBuf::from(output_base_path);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let cert = generate_self_signed(sans).context("Certificate generation failed")?;
  let public_path = sibling(&path, "pub.pem")?;
  let private_path = sibling(&path, "priv.pem")?;
  fs::write(&public_path, &cert.certificate_pem).context("Failed writing public key")?;
  fs::write(&private_path, &cert.private_key_pem).context("Failed writing private key")?;
  tracing::info!(
    certificate = %public_path.display(),
    private_key = %private_path.display(),
    "Certificate written"
  );
  Ok(())
}
