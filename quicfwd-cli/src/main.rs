// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use quicfwd::{
  client::ClientOptions,
  common::{tls::ServerVerification, TransportParameters},
  server::ServerOptions,
  util::validators::{
    parse_seconds, parse_socketaddr, validate_existing_file, validate_host_port, validate_seconds,
    validate_socketaddr,
  },
};
use std::{path::PathBuf, time::Duration};
use tokio_util::sync::CancellationToken;

mod certgen;
mod client;
mod server;

const DEFAULT_LOG_FILTER: &str = "quinn=warn,quinn_proto=warn,info";

fn seconds_arg(name: &'static str, help: &'static str) -> Arg<'static> {
  Arg::new(name)
    .long(name)
    .help(help)
    .validator(validate_seconds)
    .takes_value(true)
    .value_name("SECS")
}

/// Flags shared by both ends of the tunnel
fn transport_args() -> [Arg<'static>; 3] {
  [
    seconds_arg("idle-timeout", "Close the connection after this long without traffic")
      .default_value("30"),
    seconds_arg("keep-alive", "Interval between keepalive packets").default_value("10"),
    seconds_arg(
      "stats-interval",
      "Log per-session traffic totals at this interval",
    ),
  ]
}

fn command() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Forward connections accepted on a local port over QUIC to a server")
        .arg(
          Arg::new("local")
            .long("local")
            .short('l')
            .help("Local address to accept TCP connections on, as host:port")
            .validator(validate_host_port)
            .default_value(ClientOptions::DEFAULT_LOCAL_ADDR)
            .takes_value(true),
        )
        .arg(
          Arg::new("server")
            .long("server")
            .short('s')
            .help("QUIC server to tunnel to, as host:port")
            .validator(validate_host_port)
            .default_value(ClientOptions::DEFAULT_SERVER)
            .takes_value(true),
        )
        .arg(
          Arg::new("server-name")
            .long("server-name")
            .help("TLS server name; defaults to the host part of --server")
            .takes_value(true),
        )
        .arg(
          Arg::new("authority")
            .long("authority")
            .short('a')
            .help("Trust only certificates issued by this PEM certificate authority")
            .validator(validate_existing_file)
            .takes_value(true)
            .conflicts_with("native-roots"),
        )
        .arg(
          Arg::new("native-roots")
            .long("native-roots")
            .help("Verify the server against the platform's trusted roots"),
        )
        .arg(
          seconds_arg("probe-interval", "Interval between connection liveness checks")
            .default_value("5"),
        )
        .args(transport_args()),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Accept QUIC tunnels and forward every stream to a TCP backend")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .help("UDP address to accept QUIC connections on")
            .validator(validate_socketaddr)
            .default_value(ServerOptions::DEFAULT_LISTEN_ADDR)
            .takes_value(true),
        )
        .arg(
          Arg::new("forward")
            .long("forward")
            .short('f')
            .help("TCP backend to forward streams to, as host:port")
            .validator(validate_host_port)
            .default_value(ServerOptions::DEFAULT_FORWARD)
            .takes_value(true),
        )
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .help("PEM certificate chain; an ephemeral certificate is generated if omitted")
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("key"),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .help("PEM private key matching --cert")
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("cert"),
        )
        .arg(
          Arg::new("san")
            .long("san")
            .help("Additional name for the ephemeral certificate")
            .takes_value(true)
            .multiple_occurrences(true)
            .conflicts_with("cert"),
        )
        .arg(
          seconds_arg("dial-timeout", "Give up connecting to the backend after this long")
            .default_value("10"),
        )
        .args(transport_args()),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate a self-signed certificate for use with --cert, --key and --authority")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .multiple_occurrences(true)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true)
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  if let Err(err) = tracing::subscriber::set_global_default(collector) {
    eprintln!("Logger initialization failed: {}", err);
    std::process::exit(1);
  }
  let matches = command().get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let rt = match tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
  {
    Ok(rt) => rt,
    Err(err) => {
      tracing::error!(err = %err, "Tokio runtime setup failure");
      std::process::exit(1);
    }
  };
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn optional_seconds(args: &ArgMatches, name: &str) -> Result<Option<Duration>> {
  args
    .value_of(name)
    .map(parse_seconds)
    .transpose()
    .map_err(anyhow::Error::msg)
    .with_context(|| format!("Invalid --{}", name))
}

fn required_seconds(args: &ArgMatches, name: &str) -> Result<Duration> {
  optional_seconds(args, name)?.with_context(|| format!("Missing --{}", name))
}

fn transport_arg_handling(args: &ArgMatches) -> Result<TransportParameters> {
  Ok(TransportParameters {
    idle_timeout: required_seconds(args, "idle-timeout")?,
    keep_alive_interval: required_seconds(args, "keep-alive")?,
    ..Default::default()
  })
}

pub fn client_arg_handling(args: &ArgMatches) -> Result<ClientOptions> {
  let verification = match args.value_of("authority") {
    Some(path) => ServerVerification::Authority(PathBuf::from(path)),
    None if args.is_present("native-roots") => ServerVerification::NativeRoots,
    None => ServerVerification::Insecure,
  };
  let defaults = ClientOptions::default();
  Ok(ClientOptions {
    local_addr: args
      .value_of("local")
      .context("Missing --local")?
      .to_string(),
    server: args
      .value_of("server")
      .context("Missing --server")?
      .to_string(),
    server_name: args.value_of("server-name").map(String::from),
    verification,
    transport: transport_arg_handling(args)?,
    supervisor: quicfwd::client::supervisor::SupervisorOptions {
      probe_interval: required_seconds(args, "probe-interval")?,
      ..defaults.supervisor
    },
    stats_interval: optional_seconds(args, "stats-interval")?,
  })
}

pub fn server_arg_handling(args: &ArgMatches) -> Result<ServerOptions> {
  Ok(ServerOptions {
    listen_addr: parse_socketaddr(args.value_of("listen").context("Missing --listen")?)?,
    forward: args
      .value_of("forward")
      .context("Missing --forward")?
      .to_string(),
    cert: args.value_of("cert").map(PathBuf::from),
    key: args.value_of("key").map(PathBuf::from),
    subject_alt_names: args
      .values_of("san")
      .map(|names| names.map(String::from).collect())
      .unwrap_or_default(),
    dial_timeout: required_seconds(args, "dial-timeout")?,
    transport: transport_arg_handling(args)?,
    stats_interval: optional_seconds(args, "stats-interval")?,
  })
}

/// A token cancelled when the process receives Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
  let shutdown = CancellationToken::new();
  tokio::task::spawn({
    let shutdown = shutdown.clone();
    async move {
      match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Interrupt received, shutting down"),
        Err(err) => tracing::warn!(err = %err, "Failed to listen for interrupts"),
      }
      shutdown.cancel();
    }
  });
  shutdown
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("server", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config, shutdown_on_ctrl_c()).await
    }
    Some(("client", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config, shutdown_on_ctrl_c()).await
    }
    Some(("cert", opts)) => {
      tracing::info!("Generating certs...");
      let path_raw = opts.value_of("path").context("Path argument is required")?;
      let sans = opts
        .values_of("san")
        .map(|names| names.map(String::from).collect())
        .unwrap_or_else(|| vec![String::from("localhost")]);
      certgen::certgen_main(path_raw.into(), sans).await
    }
    _ => anyhow::bail!("A subcommand is required"),
  }
}
