// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use flowkit::util;
use std::path::PathBuf;

use util::validators::{
  parse_byte_count, parse_forward, parse_seconds, parse_socketaddr, validate_byte_count,
  validate_existing_file, validate_forward, validate_seconds, validate_socketaddr,
};

mod rules;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let matches = build_app().get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn build_app() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Accept proxy clients and relay them to their destinations")
        .arg(
          Arg::new("http")
            .help("Address on which to accept HTTP proxy clients, including CONNECT")
            .long("http")
            .short('p')
            .validator(validate_socketaddr)
            .takes_value(true)
            .multiple_occurrences(true),
        )
        .arg(
          Arg::new("forward")
            .help("Forward every connection on a local address to a fixed endpoint, as <bind>=<host>:<port>")
            .long("forward")
            .short('f')
            .validator(validate_forward)
            .takes_value(true)
            .multiple_occurrences(true),
        )
        .arg(
          Arg::new("rules")
            .help("JSON rule file deciding how sessions are routed")
            .long("rules")
            .short('r')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("connect-timeout")
            .help("Seconds to wait for a destination to accept a connection")
            .long("connect-timeout")
            .validator(validate_seconds)
            .default_value("10")
            .takes_value(true),
        )
        .arg(
          Arg::new("relay-buffer")
            .help("Size of each relay buffer in bytes; accepts k and m suffixes")
            .long("relay-buffer")
            .validator(validate_byte_count)
            .default_value("32k")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("rules")
        .about("Check a rule file and print how it routes the given endpoints")
        .arg(
          Arg::new("path")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("endpoint")
            .help("Endpoints, as <host>:<port>, to match against the rules")
            .takes_value(true)
            .multiple_values(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true)
}

pub async fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  let http_binds = args
    .values_of("http")
    .into_iter()
    .flatten()
    .map(parse_socketaddr)
    .collect::<Result<Vec<_>>>()?;
  let forwards = args
    .values_of("forward")
    .into_iter()
    .flatten()
    .map(parse_forward)
    .collect::<Result<Vec<_>>>()?;
  if http_binds.is_empty() && forwards.is_empty() {
    return Err(anyhow::Error::msg(
      "At least one --http or --forward listener is required",
    ));
  }
  Ok(server::ServerArgs {
    http_binds,
    forwards,
    rules: args.value_of("rules").map(PathBuf::from),
    connect_timeout: parse_seconds(args.value_of("connect-timeout").unwrap_or("10"))?,
    relay_buffer: parse_byte_count(args.value_of("relay-buffer").unwrap_or("32k"))?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("server", opts) => {
      let config = server_arg_handling(opts).await?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config).await
    }
    ("rules", opts) => {
      let path = opts.value_of("path").expect("Path argument is required");
      let endpoints = opts.values_of("endpoint").into_iter().flatten();
      rules::rules_main(PathBuf::from(path), endpoints.map(String::from).collect())
    }
    (_, _) => unreachable!(),
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::{build_app, server_arg_handling};

  async fn server_args(args: &[&str]) -> anyhow::Result<super::server::ServerArgs> {
    let matches = build_app()
      .try_get_matches_from(std::iter::once("flowkit").chain(args.iter().copied()))
      .map_err(anyhow::Error::from)?;
    let (_, opts) = matches.subcommand().expect("A subcommand was given");
    server_arg_handling(opts).await
  }

  #[tokio::test]
  async fn server_requires_a_listener() {
    let error = server_args(&["server"]).await.unwrap_err();
    assert!(error.to_string().contains("--http or --forward"), "{}", error);
  }

  #[tokio::test]
  async fn server_parses_listeners() {
    let args = server_args(&[
      "server",
      "--http",
      "127.0.0.1:8080",
      "-f",
      "127.0.0.1:2222=git.internal:22",
      "--forward",
      "127.0.0.1:5353=[::1]:53",
      "--connect-timeout",
      "2.5",
      "--relay-buffer",
      "64k",
    ])
    .await
    .unwrap();
    assert_eq!(args.http_binds, vec!["127.0.0.1:8080".parse().unwrap()]);
    assert_eq!(
      args.forwards,
      vec![
        (
          "127.0.0.1:2222".parse().unwrap(),
          "git.internal:22".parse().unwrap()
        ),
        ("127.0.0.1:5353".parse().unwrap(), "[::1]:53".parse().unwrap()),
      ]
    );
    assert_eq!(args.rules, None);
    assert_eq!(args.connect_timeout, Duration::from_millis(2500));
    assert_eq!(args.relay_buffer, 64 * 1024);
  }

  #[tokio::test]
  async fn server_defaults() {
    let args = server_args(&["server", "-p", "127.0.0.1:8080"]).await.unwrap();
    assert_eq!(args.connect_timeout, Duration::from_secs(10));
    assert_eq!(args.relay_buffer, 32 * 1024);
    assert!(args.forwards.is_empty());
  }

  #[test]
  fn malformed_forwards_are_refused_by_clap() {
    assert!(build_app()
      .try_get_matches_from(["flowkit", "server", "--forward", "127.0.0.1:2222"])
      .is_err());
  }
}
