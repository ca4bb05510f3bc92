// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use flowkit::{
  common::{
    context::Context,
    listener::{ListenerProtocol, TcpProxyListener},
    resolver::SystemResolver,
    rule::{DirectRuleSet, RuleSet, StaticRuleSet},
    session::Endpoint,
  },
  instance::Instance,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing_futures::Instrument;

/// Parameters used to run the proxy server
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub http_binds: Vec<SocketAddr>,
  pub forwards: Vec<(SocketAddr, Endpoint)>,
  pub rules: Option<PathBuf>,
  pub connect_timeout: Duration,
  pub relay_buffer: usize,
}

fn load_rule_set(path: Option<&PathBuf>) -> Result<Box<dyn RuleSet + Send + Sync>> {
  match path {
    Some(path) => {
      let rules = StaticRuleSet::from_json_file(path)
        .with_context(|| format!("Failed loading rules from {}", path.display()))?;
      tracing::info!(path = %path.display(), rules = rules.rules.len(), "rules loaded");
      Ok(Box::new(rules))
    }
    None => Ok(Box::new(DirectRuleSet)),
  }
}

pub async fn server_main(config: self::ServerArgs) -> Result<()> {
  let context = Context::new(
    Arc::new(SystemResolver),
    load_rule_set(config.rules.as_ref())?,
  )
  .with_connect_timeout(config.connect_timeout)
  .with_relay_buffer_capacity(config.relay_buffer);
  let mut instance = Instance::new(env!("CARGO_PKG_NAME"), Arc::new(context));

  for addr in &config.http_binds {
    let listener = TcpProxyListener::bind(*addr, ListenerProtocol::HttpProxy)
      .await
      .with_context(|| format!("Failed binding HTTP proxy listener on {}", addr))?;
    tracing::info!(%addr, "accepting HTTP proxy clients");
    instance.add_listener(Box::new(listener));
  }
  for (addr, target) in &config.forwards {
    let listener = TcpProxyListener::bind(*addr, ListenerProtocol::Forward(target.clone()))
      .await
      .with_context(|| format!("Failed binding forwarding listener on {}", addr))?;
    tracing::info!(%addr, %target, "forwarding connections");
    instance.add_listener(Box::new(listener));
  }

  let instance = Arc::new(instance);
  let sigint_handler_task = {
    let instance = Arc::clone(&instance);
    tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      instance.stop();
    })
  };

  let result = instance
    .run()
    .instrument(tracing::info_span!("server"))
    .await;
  // The handler task only finishes once it has stopped the instance
  if !sigint_handler_task.is_finished() {
    tracing::warn!("instance stopped without a shutdown request");
  }
  sigint_handler_task.abort();
  // Abort errors are expected here
  let _ = sigint_handler_task.await;
  result.map_err(Into::into)
}
