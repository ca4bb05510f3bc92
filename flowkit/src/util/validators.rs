// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Argument parsers shaped for command-line validation
use anyhow::{Context as AnyhowContext, Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::common::session::Endpoint;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

/// Parses `bind=host:port`, pairing a local listening address with the endpoint it forwards to
pub fn parse_forward(v: &str) -> Result<(SocketAddr, Endpoint)> {
  let (bind, target) = v
    .split_once('=')
    .ok_or_else(|| AnyErr::msg("Forward must be of the form <bind-address>=<host>:<port>"))?;
  let bind = parse_socketaddr(bind).context("Invalid forward bind address")?;
  let target = target
    .parse::<Endpoint>()
    .context("Invalid forward target")?;
  Ok((bind, target))
}

pub fn parse_seconds(v: &str) -> Result<Duration> {
  let seconds = v
    .parse::<f64>()
    .context("Duration must be a number of seconds")?;
  if !seconds.is_finite() || seconds <= 0.0 {
    return Err(AnyErr::msg("Duration must be positive"));
  }
  Ok(Duration::from_secs_f64(seconds))
}

/// Parses a byte count, accepting an optional `k` or `m` binary suffix such as `64k`
pub fn parse_byte_count(v: &str) -> Result<usize> {
  let lower = v.trim().to_ascii_lowercase();
  let (digits, scale) = match lower.as_bytes().last() {
    Some(b'k') => (&lower[..lower.len() - 1], 1024),
    Some(b'm') => (&lower[..lower.len() - 1], 1024 * 1024),
    _ => (&lower[..], 1),
  };
  let count = digits
    .parse::<usize>()
    .context("Size must be a whole number of bytes")?
    .checked_mul(scale)
    .ok_or_else(|| AnyErr::msg("Size is too large"))?;
  if count == 0 {
    return Err(AnyErr::msg("Size must be positive"));
  }
  Ok(count)
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_forward(v: &str) -> Result<(), String> {
  parse_forward(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}

pub fn validate_seconds(v: &str) -> Result<(), String> {
  parse_seconds(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}

pub fn validate_byte_count(v: &str) -> Result<(), String> {
  parse_byte_count(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}
