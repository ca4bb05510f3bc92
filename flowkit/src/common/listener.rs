// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{net::SocketAddr, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::net::TcpListener;

use super::{
  data_flow::{BoxedLocalDataFlow, HttpServerDataFlow, SocketDataFlow},
  session::{Endpoint, Session},
};

/// A freshly accepted connection, wrapped in its local chain
pub struct Accepted {
  pub session: Arc<Session>,
  pub flow: BoxedLocalDataFlow,
}

impl std::fmt::Debug for Accepted {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Accepted")
      .field("session", &self.session)
      .field("flow", &self.flow.name())
      .finish()
  }
}

#[derive(thiserror::Error, Debug)]
pub enum AcceptError {
  #[error("Failed to accept a connection on {addr:?}: {source}")]
  Io {
    addr: Option<SocketAddr>,
    #[source]
    source: std::io::Error,
  },
}

/// A source of incoming connections
pub trait Listener {
  fn local_addr(&self) -> Option<SocketAddr>;

  fn accept(&self) -> BoxFuture<'_, Result<Accepted, AcceptError>>;
}

/// How a [TcpProxyListener] wraps each accepted socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerProtocol {
  /// Clients speak HTTP proxy requests, including CONNECT
  HttpProxy,
  /// Every connection is sent to a fixed endpoint without a handshake
  Forward(Endpoint),
}

pub struct TcpProxyListener {
  listener: TcpListener,
  protocol: ListenerProtocol,
}

impl TcpProxyListener {
  pub async fn bind(addr: SocketAddr, protocol: ListenerProtocol) -> std::io::Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Self::from_listener(listener, protocol))
  }

  pub fn from_listener(listener: TcpListener, protocol: ListenerProtocol) -> Self {
    Self { listener, protocol }
  }

  pub fn protocol(&self) -> &ListenerProtocol {
    &self.protocol
  }
}

impl Listener for TcpProxyListener {
  fn local_addr(&self) -> Option<SocketAddr> {
    self.listener.local_addr().ok()
  }

  fn accept(&self) -> BoxFuture<'_, Result<Accepted, AcceptError>> {
    async move {
      let (stream, peer_addr) = self
        .listener
        .accept()
        .await
        .map_err(|source| AcceptError::Io {
          addr: self.local_addr(),
          source,
        })?;
      if let Err(error) = stream.set_nodelay(true) {
        tracing::trace!(%error, "failed to disable Nagle's algorithm");
      }
      let session = Session::new(Some(peer_addr));
      tracing::debug!(session = %session.id(), %peer_addr, "accepted connection");
      let socket = Box::new(SocketDataFlow::new(stream, Arc::clone(&session)));
      let flow: BoxedLocalDataFlow = match &self.protocol {
        ListenerProtocol::HttpProxy => Box::new(HttpServerDataFlow::new(socket)),
        ListenerProtocol::Forward(endpoint) => {
          session.update_facts(|facts| facts.protocol = Some("forward"));
          session.set_endpoint(endpoint.clone());
          socket
        }
      };
      Ok(Accepted { session, flow })
    }
    .boxed()
  }
}
