// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Routing decisions for sessions whose destination has been negotiated

use std::{net::SocketAddr, path::Path};

use serde::{Deserialize, Serialize};

use super::session::{Endpoint, Host, Session};

/// Where a session's destination-facing chain connects
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Destination {
  /// Connect to the negotiated endpoint itself
  Direct,
  /// Connect to a fixed address instead, such as an upstream relay
  Forward(SocketAddr),
  /// Refuse the session
  Reject,
}

#[cfg_attr(test, mockall::automock)]
pub trait RuleSet {
  fn match_session(&self, session: &Session) -> Destination;
}

/// Sends every session directly to its destination
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectRuleSet;

impl RuleSet for DirectRuleSet {
  fn match_session(&self, _session: &Session) -> Destination {
    Destination::Direct
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
  Direct,
  Reject,
  Forward(SocketAddr),
}

impl Default for Action {
  fn default() -> Self {
    Action::Direct
  }
}

impl From<Action> for Destination {
  fn from(action: Action) -> Self {
    match action {
      Action::Direct => Destination::Direct,
      Action::Reject => Destination::Reject,
      Action::Forward(address) => Destination::Forward(address),
    }
  }
}

/// A single routing rule; empty criteria match anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
  /// Domain suffixes or IP literals the destination host must match
  #[serde(default)]
  pub domains: Vec<String>,
  #[serde(default)]
  pub ports: Vec<u16>,
  pub action: Action,
}

impl Rule {
  pub fn matches(&self, endpoint: &Endpoint) -> bool {
    let port_matches = self.ports.is_empty() || self.ports.contains(&endpoint.port());
    port_matches && (self.domains.is_empty() || self.domains.iter().any(|d| host_matches(d, endpoint.host())))
  }
}

fn host_matches(pattern: &str, host: &Host) -> bool {
  let pattern = pattern.trim_start_matches('.');
  match host {
    Host::Domain(domain) => {
      let (domain, pattern) = (domain.as_bytes(), pattern.as_bytes());
      let split = domain.len().saturating_sub(pattern.len());
      domain[split..].eq_ignore_ascii_case(pattern) && (split == 0 || domain[split - 1] == b'.')
    }
    Host::Ip(ip) => pattern.parse().map(|p: std::net::IpAddr| p == *ip).unwrap_or(false),
  }
}

#[derive(thiserror::Error, Debug)]
pub enum RuleSetLoadError {
  #[error("Failed to read rule file: {0}")]
  Io(#[from] std::io::Error),
  #[error("Invalid rule file: {0}")]
  Parse(#[from] serde_json::Error),
}

/// An ordered list of rules; the first match wins, otherwise the default action applies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRuleSet {
  #[serde(default)]
  pub rules: Vec<Rule>,
  #[serde(default)]
  pub default: Action,
}

impl StaticRuleSet {
  pub fn from_json_slice(data: &[u8]) -> Result<Self, RuleSetLoadError> {
    Ok(serde_json::from_slice(data)?)
  }

  pub fn from_json_file(path: &Path) -> Result<Self, RuleSetLoadError> {
    let data = std::fs::read(path)?;
    Self::from_json_slice(&data)
  }

  pub fn match_endpoint(&self, endpoint: &Endpoint) -> Destination {
    self
      .rules
      .iter()
      .find(|rule| rule.matches(endpoint))
      .map(|rule| rule.action)
      .unwrap_or(self.default)
      .into()
  }
}

impl RuleSet for StaticRuleSet {
  fn match_session(&self, session: &Session) -> Destination {
    match session.endpoint() {
      Some(endpoint) => self.match_endpoint(&endpoint),
      None => Destination::Reject,
    }
  }
}
