// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{net::SocketAddr, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  common::{
    context::Context,
    data_flow::RoutedDataFlow,
    listener::{AcceptError, Accepted, Listener},
    rule::RuleSet,
    tunnel::{
      MonotonicAtomicGenerator, Tunnel, TunnelError, TunnelIdGenerator, TunnelRecord, TunnelTable,
    },
  },
  util::cancellation::Cancelable,
};

#[derive(thiserror::Error, Debug)]
pub enum InstanceError {
  #[error("Instance {0} has no listeners")]
  NoListeners(String),
  #[error(transparent)]
  Accept(#[from] AcceptError),
}

/// Accepts connections from every listener and runs a tunnel for each of them
pub struct Instance {
  name: String,
  context: Arc<Context>,
  listeners: Vec<Box<dyn Listener + Send + Sync>>,
  tunnels: Arc<TunnelTable>,
  tunnel_id_generator: Arc<dyn TunnelIdGenerator + Send + Sync>,
  shutdown: CancellationToken,
}

impl Instance {
  pub fn new(name: impl Into<String>, context: Arc<Context>) -> Self {
    Self {
      name: name.into(),
      context,
      listeners: Vec::new(),
      tunnels: Arc::new(TunnelTable::new()),
      tunnel_id_generator: Arc::new(MonotonicAtomicGenerator::new(0)),
      shutdown: CancellationToken::new(),
    }
  }

  pub fn add_listener(&mut self, listener: Box<dyn Listener + Send + Sync>) {
    self.listeners.push(listener);
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn context(&self) -> &Arc<Context> {
    &self.context
  }

  pub fn tunnels(&self) -> &Arc<TunnelTable> {
    &self.tunnels
  }

  pub fn local_addrs(&self) -> Vec<SocketAddr> {
    self
      .listeners
      .iter()
      .filter_map(|listener| listener.local_addr())
      .collect()
  }

  /// Replaces the rule set for sessions routed from now on
  pub fn set_rule_set(&self, rule_set: Box<dyn RuleSet + Send + Sync>) {
    self.context.set_rule_set(rule_set);
    tracing::info!(instance = %self.name, "rule set replaced");
  }

  /// Stops accepting, cancels live tunnels, and lets [Instance::run] return once they unwind
  pub fn stop(&self) {
    self.shutdown.cancel();
  }

  /// Runs every listener until the instance is stopped or a listener fails.
  ///
  /// An accept failure is fatal: the remaining listeners and all tunnels are
  /// cancelled, and the failure is returned once every tunnel has unwound.
  #[tracing::instrument(skip(self), fields(instance = %self.name), err)]
  pub async fn run(&self) -> Result<(), InstanceError> {
    if self.listeners.is_empty() {
      return Err(InstanceError::NoListeners(self.name.clone()));
    }
    tracing::info!(addrs = ?self.local_addrs(), "instance running");
    let accept_loops = self
      .listeners
      .iter()
      .map(|listener| self.accept_loop(listener.as_ref()));
    let result = futures::future::try_join_all(accept_loops).await;

    self.shutdown.cancel();
    self.tunnels.cancel_all();
    self.tunnels.wait_drained().await;
    tracing::info!("instance stopped");
    result.map(|_| ())
  }

  async fn accept_loop(&self, listener: &(dyn Listener + Send + Sync)) -> Result<(), InstanceError> {
    loop {
      let accepted = tokio::select! {
        _ = self.shutdown.cancelled() => return Ok(()),
        accepted = listener.accept() => accepted,
      };
      match accepted {
        Ok(accepted) => self.spawn_tunnel(accepted),
        Err(error) => {
          tracing::error!(%error, "failed to accept a connection");
          return Err(error.into());
        }
      }
    }
  }

  fn spawn_tunnel(&self, accepted: Accepted) {
    let Accepted { session, flow } = accepted;
    let id = self.tunnel_id_generator.next();
    let far = RoutedDataFlow::new(Arc::clone(&self.context), Arc::clone(&session));
    let cancel = Cancelable::from(self.shutdown.child_token());
    let tunnel = Tunnel::new(id, flow, Box::new(far))
      .with_cancelable(cancel.clone())
      .with_buffer_capacity(self.context.relay_buffer_capacity());
    self
      .tunnels
      .insert(id, TunnelRecord::new(Arc::clone(&session), cancel));

    let tunnels = Arc::clone(&self.tunnels);
    let span = tracing::debug_span!("tunnel", %id, session = %session.id());
    tokio::task::spawn(
      async move {
        let result = tunnel.run().await;
        let lifetime = tunnels.remove(id).map(|record| record.opened_at.elapsed());
        match result {
          Ok(stats) => tracing::info!(
            near_to_far = stats.near_to_far,
            far_to_near = stats.far_to_near,
            ?lifetime,
            "tunnel closed"
          ),
          Err(TunnelError::Cancelled) => tracing::debug!(?lifetime, "tunnel cancelled"),
          Err(error) => tracing::info!(%error, ?lifetime, "tunnel failed"),
        }
      }
      .instrument(span),
    );
  }
}

impl std::fmt::Debug for Instance {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Instance")
      .field("name", &self.name)
      .field("listeners", &self.local_addrs())
      .field("tunnels", &self.tunnels.len())
      .finish_non_exhaustive()
  }
}
