// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Server identity and the rustls configurations handed to the transport
use std::{
  fs::File,
  io::BufReader,
  path::{Path, PathBuf},
  sync::Arc,
};

use crate::common::ALPN_QUIC_FORWARDER;

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
  #[error("Certificate generation failed")]
  Generate(#[from] rcgen::RcgenError),
  #[error("Generated certificate could not be decoded from its PEM form")]
  Undecodable,
  #[error("Failed reading {path}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("No certificates found in {0}")]
  NoCertificates(PathBuf),
  #[error("No private key found in {0}")]
  NoPrivateKey(PathBuf),
  #[error("Failed loading the platform trust store")]
  NativeRoots(#[source] std::io::Error),
  #[error("Invalid certificate authority: {0}")]
  InvalidAuthority(String),
  #[error("TLS configuration rejected")]
  Rustls(#[from] rustls::Error),
}

/// Serial number carried by generated certificates
pub const GENERATED_SERIAL: u64 = 1;
/// Generated certificates expire this many days after creation
pub const GENERATED_VALIDITY_DAYS: i64 = 365;

/// A freshly generated self-signed certificate, in both encodings
pub struct GeneratedCertificate {
  pub certificate_der: Vec<u8>,
  pub private_key_der: Vec<u8>,
  pub certificate_pem: String,
  pub private_key_pem: String,
}

impl GeneratedCertificate {
  pub fn identity(&self) -> ServerIdentity {
    ServerIdentity {
      chain: vec![rustls::Certificate(self.certificate_der.clone())],
      key: rustls::PrivateKey(self.private_key_der.clone()),
    }
  }
}

/// Generate a self-signed ECDSA P-256 certificate valid for a year from now
pub fn generate_self_signed<S: Into<String>>(
  subject_alt_names: impl IntoIterator<Item = S>,
) -> Result<GeneratedCertificate, TlsError> {
  let subject_alt_names = subject_alt_names
    .into_iter()
    .map(Into::into)
    .collect::<Vec<String>>();
  let mut params = rcgen::CertificateParams::new(subject_alt_names);
  params.serial_number = Some(GENERATED_SERIAL.into());
  let now = time::OffsetDateTime::now_utc();
  params.not_before = now;
  params.not_after = now + time::Duration::days(GENERATED_VALIDITY_DAYS);
  let mut distinguished_name = rcgen::DistinguishedName::new();
  distinguished_name.push(rcgen::DnType::CommonName, "quicfwd self-signed");
  params.distinguished_name = distinguished_name;
  let cert = rcgen::Certificate::from_params(params)?;
  // Every serialization signs anew, so both encodings must come from a single signing
  let certificate_pem = cert.serialize_pem()?;
  let certificate_der = rustls_pemfile::certs(&mut certificate_pem.as_bytes())
    .ok()
    .and_then(|certs| certs.into_iter().next())
    .ok_or(TlsError::Undecodable)?;
  Ok(GeneratedCertificate {
    certificate_der,
    private_key_der: cert.serialize_private_key_der(),
    certificate_pem,
    private_key_pem: cert.serialize_private_key_pem(),
  })
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TlsError> {
  File::open(path)
    .map(BufReader::new)
    .map_err(|source| TlsError::Read {
      path: path.to_path_buf(),
      source,
    })
}

/// Read every certificate in a PEM file, in file order
pub fn load_certificates(path: &Path) -> Result<Vec<rustls::Certificate>, TlsError> {
  let certs = rustls_pemfile::certs(&mut open_pem(path)?).map_err(|source| TlsError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  if certs.is_empty() {
    return Err(TlsError::NoCertificates(path.to_path_buf()));
  }
  Ok(certs.into_iter().map(rustls::Certificate).collect())
}

/// Read the first PKCS#8, RSA or SEC1 private key in a PEM file
pub fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, TlsError> {
  let items = rustls_pemfile::read_all(&mut open_pem(path)?).map_err(|source| TlsError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  items
    .into_iter()
    .find_map(|item| match item {
      rustls_pemfile::Item::PKCS8Key(key)
      | rustls_pemfile::Item::RSAKey(key)
      | rustls_pemfile::Item::ECKey(key) => Some(rustls::PrivateKey(key)),
      _ => None,
    })
    .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Certificate chain and key presented by the server during the handshake
#[derive(Clone)]
pub struct ServerIdentity {
  pub chain: Vec<rustls::Certificate>,
  pub key: rustls::PrivateKey,
}

impl ServerIdentity {
  pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
    Ok(Self {
      chain: load_certificates(cert_path)?,
      key: load_private_key(key_path)?,
    })
  }

  pub fn ephemeral<S: Into<String>>(
    subject_alt_names: impl IntoIterator<Item = S>,
  ) -> Result<Self, TlsError> {
    Ok(generate_self_signed(subject_alt_names)?.identity())
  }
}

impl std::fmt::Debug for ServerIdentity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServerIdentity")
      .field("chain_length", &self.chain.len())
      .finish_non_exhaustive()
  }
}

pub fn server_crypto(identity: ServerIdentity) -> Result<rustls::ServerConfig, TlsError> {
  let mut config = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(identity.chain, identity.key)?;
  config.alpn_protocols = vec![ALPN_QUIC_FORWARDER.to_vec()];
  Ok(config)
}

/// How the client decides whether to trust the server's certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerVerification {
  /// Accept any certificate; the connection is encrypted but unauthenticated
  Insecure,
  /// Trust only certificates issued by the CA(s) in this PEM file
  Authority(PathBuf),
  /// Trust the platform's root store
  NativeRoots,
}

impl Default for ServerVerification {
  fn default() -> Self {
    Self::Insecure
  }
}

struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::Certificate,
    _intermediates: &[rustls::Certificate],
    _server_name: &rustls::ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: std::time::SystemTime,
  ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::ServerCertVerified::assertion())
  }
}

fn root_store(verification: &ServerVerification) -> Result<rustls::RootCertStore, TlsError> {
  let mut roots = rustls::RootCertStore::empty();
  match verification {
    ServerVerification::Insecure => {}
    ServerVerification::Authority(path) => {
      for cert in load_certificates(path)? {
        roots
          .add(&cert)
          .map_err(|e| TlsError::InvalidAuthority(e.to_string()))?;
      }
    }
    ServerVerification::NativeRoots => {
      let native = rustls_native_certs::load_native_certs()
        .map_err(TlsError::NativeRoots)?
        .into_iter()
        .map(|cert| cert.0)
        .collect::<Vec<Vec<u8>>>();
      let (added, ignored) = roots.add_parsable_certificates(&native);
      tracing::debug!(added, ignored, "Loaded platform root certificates");
    }
  }
  Ok(roots)
}

pub fn client_crypto(verification: &ServerVerification) -> Result<rustls::ClientConfig, TlsError> {
  let builder = rustls::ClientConfig::builder().with_safe_defaults();
  let mut config = match verification {
    ServerVerification::Insecure => builder
      .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
      .with_no_client_auth(),
    verification => builder
      .with_root_certificates(root_store(verification)?)
      .with_no_client_auth(),
  };
  config.alpn_protocols = vec![ALPN_QUIC_FORWARDER.to_vec()];
  Ok(config)
}
