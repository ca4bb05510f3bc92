// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection metadata shared by every layer of a chain

use std::{
  net::{IpAddr, SocketAddr},
  str::FromStr,
  sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Host {
  Domain(String),
  Ip(IpAddr),
}

impl Host {
  /// Parses a host as found in an HTTP authority; IPv6 literals may be bracketed
  pub fn parse(raw: &str) -> Result<Host, EndpointParseError> {
    let trimmed = raw.trim_start_matches('[').trim_end_matches(']');
    if trimmed.is_empty() {
      return Err(EndpointParseError::MissingHost);
    }
    match trimmed.parse::<IpAddr>() {
      Ok(ip) => Ok(Host::Ip(ip)),
      Err(_) => Ok(Host::Domain(trimmed.to_ascii_lowercase())),
    }
  }
}

impl std::fmt::Display for Host {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Host::Domain(domain) => f.write_str(domain),
      Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
      Host::Ip(IpAddr::V4(ip)) => write!(f, "{}", ip),
    }
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointParseError {
  #[error("Endpoint has no host")]
  MissingHost,
  #[error("Endpoint has no port")]
  MissingPort,
  #[error("Endpoint is not a valid authority: {0}")]
  InvalidAuthority(String),
}

/// A destination host and port, as requested by a client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
  host: Host,
  port: u16,
}

impl Endpoint {
  pub fn new(host: Host, port: u16) -> Self {
    Self { host, port }
  }

  pub fn host(&self) -> &Host {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// Parses `host:port`, falling back to `default_port` when no port is present
  pub fn from_authority(
    authority: &str,
    default_port: Option<u16>,
  ) -> Result<Endpoint, EndpointParseError> {
    let authority = http::uri::Authority::from_str(authority)
      .map_err(|_| EndpointParseError::InvalidAuthority(authority.to_string()))?;
    let port = authority
      .port_u16()
      .or(default_port)
      .ok_or(EndpointParseError::MissingPort)?;
    Ok(Endpoint::new(Host::parse(authority.host())?, port))
  }

  /// The socket address for this endpoint, if its host is an IP literal
  pub fn socket_addr(&self) -> Option<SocketAddr> {
    match self.host {
      Host::Ip(ip) => Some(SocketAddr::new(ip, self.port)),
      Host::Domain(_) => None,
    }
  }
}

impl FromStr for Endpoint {
  type Err = EndpointParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Endpoint::from_authority(s, None)
  }
}

impl std::fmt::Display for Endpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

/// Facts recorded by protocol layers during negotiation
#[derive(Debug, Clone, Default)]
pub struct SessionFacts {
  /// Name of the protocol which negotiated the endpoint, such as `http-connect`
  pub protocol: Option<&'static str>,
  /// Request method seen by an HTTP front-end
  pub method: Option<String>,
  /// Addresses the destination resolved to
  pub resolved: Vec<SocketAddr>,
}

/// Metadata for a single client connection.
///
/// Every layer of a chain and the tunnel hold an `Arc<Session>`; layers update
/// it as they learn facts. The destination endpoint is published through a
/// watch channel so the destination-facing chain can wait for negotiation.
pub struct Session {
  id: Uuid,
  peer_addr: Option<SocketAddr>,
  endpoint: watch::Sender<Option<Endpoint>>,
  facts: Mutex<SessionFacts>,
}

impl Session {
  pub fn new(peer_addr: Option<SocketAddr>) -> Arc<Session> {
    Arc::new(Session {
      id: Uuid::new_v4(),
      peer_addr,
      endpoint: watch::channel(None).0,
      facts: Mutex::new(SessionFacts::default()),
    })
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.peer_addr
  }

  pub fn endpoint(&self) -> Option<Endpoint> {
    self.endpoint.borrow().clone()
  }

  /// Publishes the destination, waking anything blocked in [Session::wait_endpoint]
  pub fn set_endpoint(&self, endpoint: Endpoint) {
    tracing::trace!(session = %self.id, %endpoint, "session endpoint set");
    self.endpoint.send_replace(Some(endpoint));
  }

  /// Waits until a layer publishes the destination endpoint
  pub async fn wait_endpoint(&self) -> Option<Endpoint> {
    let mut receiver = self.endpoint.subscribe();
    let endpoint = match receiver.wait_for(Option::is_some).await {
      Ok(endpoint) => endpoint.clone(),
      Err(_) => None,
    };
    endpoint
  }

  pub fn facts(&self) -> SessionFacts {
    self.facts.lock().expect("Mutex poisoned").clone()
  }

  pub fn update_facts<R>(&self, update: impl FnOnce(&mut SessionFacts) -> R) -> R {
    let mut facts = self.facts.lock().expect("Mutex poisoned");
    update(&mut facts)
  }
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("id", &self.id)
      .field("peer_addr", &self.peer_addr)
      .field("endpoint", &self.endpoint())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::{net::Ipv6Addr, time::Duration};

  use super::{Endpoint, EndpointParseError, Host, Session};

  #[test]
  fn parse_authorities() {
    let endpoint: Endpoint = "Example.com:443".parse().unwrap();
    assert_eq!(endpoint.host(), &Host::Domain("example.com".into()));
    assert_eq!(endpoint.port(), 443);

    let endpoint: Endpoint = "[::1]:8080".parse().unwrap();
    assert_eq!(endpoint.host(), &Host::Ip(Ipv6Addr::LOCALHOST.into()));
    assert_eq!(endpoint.to_string(), "[::1]:8080");

    assert_eq!(
      "example.com".parse::<Endpoint>(),
      Err(EndpointParseError::MissingPort)
    );
    assert_eq!(
      Endpoint::from_authority("example.com", Some(80)).unwrap().port(),
      80
    );
  }

  #[tokio::test]
  async fn endpoint_waiters_are_woken() {
    let session = Session::new(None);
    let waiter = tokio::task::spawn({
      let session = session.clone();
      async move { session.wait_endpoint().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    session.set_endpoint("example.com:443".parse().unwrap());
    let endpoint = tokio::time::timeout(Duration::from_secs(5), waiter)
      .await
      .expect("Endpoint waiter must wake once an endpoint is set")
      .unwrap();
    assert_eq!(endpoint, Some("example.com:443".parse().unwrap()));
  }
}
