// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;

use super::{
  resolver::Resolver,
  rule::{Destination, RuleSet},
  session::Session,
};
use crate::util::RELAY_BUFFER_CAPACITY;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Services shared by every chain of an [Instance](crate::instance::Instance)
///
/// The rule set may be swapped while tunnels are running; sessions already
/// routed keep the decision they were given.
pub struct Context {
  resolver: Arc<dyn Resolver + Send + Sync>,
  rule_set: ArcSwap<Box<dyn RuleSet + Send + Sync>>,
  connect_timeout: Duration,
  relay_buffer_capacity: usize,
}

impl Context {
  pub fn new(
    resolver: Arc<dyn Resolver + Send + Sync>,
    rule_set: Box<dyn RuleSet + Send + Sync>,
  ) -> Self {
    Self {
      resolver,
      rule_set: ArcSwap::from_pointee(rule_set),
      connect_timeout: DEFAULT_CONNECT_TIMEOUT,
      relay_buffer_capacity: RELAY_BUFFER_CAPACITY,
    }
  }

  pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
    self.connect_timeout = connect_timeout;
    self
  }

  pub fn with_relay_buffer_capacity(mut self, relay_buffer_capacity: usize) -> Self {
    self.relay_buffer_capacity = relay_buffer_capacity.max(1);
    self
  }

  pub fn resolver(&self) -> &Arc<dyn Resolver + Send + Sync> {
    &self.resolver
  }

  pub fn connect_timeout(&self) -> Duration {
    self.connect_timeout
  }

  pub fn relay_buffer_capacity(&self) -> usize {
    self.relay_buffer_capacity
  }

  pub fn set_rule_set(&self, rule_set: Box<dyn RuleSet + Send + Sync>) {
    self.rule_set.store(Arc::new(rule_set));
  }

  pub fn match_session(&self, session: &Session) -> Destination {
    self.rule_set.load().match_session(session)
  }
}

impl std::fmt::Debug for Context {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Context")
      .field("connect_timeout", &self.connect_timeout)
      .field("relay_buffer_capacity", &self.relay_buffer_capacity)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::Context;
  use crate::common::{
    resolver::MockResolver,
    rule::{Destination, DirectRuleSet, MockRuleSet},
    session::Session,
  };

  #[test]
  fn rule_sets_can_be_swapped() {
    let context = Context::new(Arc::new(MockResolver::new()), Box::new(DirectRuleSet));
    let session = Session::new(None);
    assert_eq!(context.match_session(&session), Destination::Direct);

    let mut rejecting = MockRuleSet::new();
    rejecting
      .expect_match_session()
      .times(1)
      .returning(|_| Destination::Reject);
    context.set_rule_set(Box::new(rejecting));
    assert_eq!(context.match_session(&session), Destination::Reject);
  }
}
