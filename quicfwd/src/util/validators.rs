// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{net::SocketAddr, path::Path, time::Duration};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AddressError {
  #[error("Expected an address of the form host:port")]
  MissingPort,
  #[error("Host component must not be empty")]
  EmptyHost,
  #[error("Port component was not a valid u16")]
  InvalidPort,
  #[error("Not a valid socket address (ip:port)")]
  InvalidSocketAddr,
}

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

/// Parses a literal `ip:port` without performing name resolution
pub fn parse_socketaddr(v: &str) -> Result<SocketAddr, AddressError> {
  v.parse::<SocketAddr>()
    .map_err(|_| AddressError::InvalidSocketAddr)
}

/// Checks that `v` looks like `host:port`; the host is resolved later, at dial time
pub fn parse_host_port(v: &str) -> Result<(&str, u16), AddressError> {
  let (host, port) = v.rsplit_once(':').ok_or(AddressError::MissingPort)?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return Err(AddressError::EmptyHost);
  }
  let port = port.parse::<u16>().map_err(|_| AddressError::InvalidPort)?;
  Ok((host, port))
}

/// The host portion of a `host:port` string, without IPv6 brackets
///
/// Falls back to the whole input when no port is present.
pub fn host_part(v: &str) -> &str {
  parse_host_port(v).map(|(host, _)| host).unwrap_or(v)
}

/// Parses a whole number of seconds; zero is rejected
pub fn parse_seconds(v: &str) -> Result<Duration, String> {
  match v.parse::<u64>() {
    Ok(0) => Err(String::from("Duration must be at least one second")),
    Ok(secs) => Ok(Duration::from_secs(secs)),
    Err(_) => Err(String::from("Expected a whole number of seconds")),
  }
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_host_port(v: &str) -> Result<(), String> {
  parse_host_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_seconds(v: &str) -> Result<(), String> {
  parse_seconds(v).map(|_| ())
}
