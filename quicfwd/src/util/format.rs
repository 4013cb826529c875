// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

/// Renders a byte count for traffic logs, e.g. `512 B`, `1.5 KB`, `3.25 GB`
pub fn format_bytes(n: u64) -> String {
  const KIB: f64 = 1024.0;
  let f = n as f64;
  if f < KIB {
    format!("{} B", n)
  } else if f < KIB * KIB {
    format!("{:.1} KB", f / KIB)
  } else if f < KIB * KIB * KIB {
    format!("{:.1} MB", f / KIB / KIB)
  } else {
    format!("{:.2} GB", f / KIB / KIB / KIB)
  }
}
