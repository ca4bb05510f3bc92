// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  net::SocketAddr,
  sync::{Arc, OnceLock},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::net::TcpStream;

use super::{DataFlow, FlowError, FlowStatus, SocketDataFlow, State};
use crate::{
  common::{
    context::Context,
    resolver::ResolveError,
    rule::Destination,
    session::{Endpoint, Session},
  },
  util::buffer::Buffer,
};

/// Destination-facing chain which connects wherever the rule set routes the session.
///
/// Opening waits for the local chain to publish the session's endpoint, so both
/// chains may be opened at the same time.
pub struct RoutedDataFlow {
  context: Arc<Context>,
  session: Arc<Session>,
  status: FlowStatus,
  connection: OnceLock<SocketDataFlow<TcpStream>>,
}

impl RoutedDataFlow {
  pub fn new(context: Arc<Context>, session: Arc<Session>) -> Self {
    Self {
      context,
      session,
      status: FlowStatus::new(),
      connection: OnceLock::new(),
    }
  }

  fn connection(&self) -> Result<&SocketDataFlow<TcpStream>, FlowError> {
    self
      .connection
      .get()
      .ok_or_else(|| FlowError::InvalidState(self.status.state()))
  }

  async fn addresses_for(&self, endpoint: &Endpoint) -> Result<Vec<SocketAddr>, FlowError> {
    let addresses = match self.context.match_session(&self.session) {
      Destination::Reject => return Err(FlowError::Rejected(endpoint.clone())),
      Destination::Forward(address) => vec![address],
      Destination::Direct => match endpoint.socket_addr() {
        Some(address) => vec![address],
        None => self
          .context
          .resolver()
          .resolve(endpoint.host().to_string())
          .await?
          .into_iter()
          .map(|ip| SocketAddr::new(ip, endpoint.port()))
          .collect(),
      },
    };
    if addresses.is_empty() {
      return Err(ResolveError::NoAddresses(endpoint.host().to_string()).into());
    }
    Ok(addresses)
  }

  async fn connect(&self) -> Result<SocketDataFlow<TcpStream>, FlowError> {
    let endpoint = self
      .session
      .wait_endpoint()
      .await
      .ok_or(FlowError::NoEndpoint)?;
    let addresses = self.addresses_for(&endpoint).await?;
    self
      .session
      .update_facts(|facts| facts.resolved = addresses.clone());
    tracing::debug!(%endpoint, ?addresses, "connecting");
    let stream = tokio::time::timeout(
      self.context.connect_timeout(),
      TcpStream::connect(&addresses[..]),
    )
    .await
    .map_err(|_| FlowError::ConnectTimeout(endpoint.clone()))?
    .map_err(|source| FlowError::Connect {
      endpoint: endpoint.clone(),
      source,
    })?;
    if let Err(error) = stream.set_nodelay(true) {
      tracing::trace!(%error, "failed to disable Nagle's algorithm");
    }
    Ok(SocketDataFlow::connected(stream, Arc::clone(&self.session)))
  }
}

impl DataFlow for RoutedDataFlow {
  fn name(&self) -> &'static str {
    "routed"
  }

  fn open(&self) -> BoxFuture<'_, Result<(), FlowError>> {
    async move {
      let _opening = self.status.begin_open()?;
      match self.connect().await {
        Ok(connection) => {
          if self.connection.set(connection).is_err() {
            self.status.fail();
            return Err(FlowError::InvalidState(State::Established));
          }
          self.status.open_succeeded();
          Ok(())
        }
        Err(error) => {
          tracing::debug!(%error, "failed to reach destination");
          self.status.fail();
          Err(error)
        }
      }
    }
    .boxed()
  }

  fn read(&self, buffer: Buffer) -> BoxFuture<'_, Result<Buffer, FlowError>> {
    match self.connection() {
      Ok(connection) => connection.read(buffer),
      Err(error) => futures::future::ready(Err(error)).boxed(),
    }
  }

  fn write(&self, buffer: Buffer) -> BoxFuture<'_, Result<Buffer, FlowError>> {
    match self.connection() {
      Ok(connection) => connection.write(buffer),
      Err(error) => futures::future::ready(Err(error)).boxed(),
    }
  }

  fn close_write(&self) -> BoxFuture<'_, Result<(), FlowError>> {
    match self.connection() {
      Ok(connection) => connection.close_write(),
      Err(error) => futures::future::ready(Err(error)).boxed(),
    }
  }

  fn resume(&self) -> BoxFuture<'_, Result<(), FlowError>> {
    futures::future::ready(Ok(())).boxed()
  }

  fn report_error<'a>(&'a self, _error: &'a FlowError) -> BoxFuture<'a, Result<(), FlowError>> {
    futures::future::ready(Err(FlowError::NotReportable)).boxed()
  }

  fn state(&self) -> State {
    match self.connection.get() {
      Some(connection) => connection.state(),
      None => self.status.state(),
    }
  }

  fn is_read_closed(&self) -> bool {
    self.connection.get().map_or(false, |c| c.is_read_closed())
  }

  fn is_write_closed(&self) -> bool {
    self.connection.get().map_or(false, |c| c.is_write_closed())
  }

  fn is_write_closing(&self) -> bool {
    self.connection.get().map_or(false, |c| c.is_write_closing())
  }

  fn is_reading(&self) -> bool {
    self.connection.get().map_or(false, |c| c.is_reading())
  }

  fn is_writing(&self) -> bool {
    self.connection.get().map_or(false, |c| c.is_writing())
  }

  fn session(&self) -> &Arc<Session> {
    &self.session
  }

  fn next_hop(&self) -> Option<&dyn DataFlow> {
    self.connection.get().map(|c| c as &dyn DataFlow)
  }
}

#[cfg(test)]
mod tests {
  use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
  };

  use futures::FutureExt;
  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
  };

  use super::RoutedDataFlow;
  use crate::{
    common::{
      context::Context,
      data_flow::{describe_chain, DataFlow, FlowError, State},
      resolver::MockResolver,
      rule::{Destination, DirectRuleSet, MockRuleSet},
      session::Session,
    },
    util::buffer::Buffer,
  };

  #[tokio::test]
  async fn connects_once_endpoint_is_published() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut resolver = MockResolver::new();
    resolver
      .expect_resolve()
      .withf(|host| host == "origin.test")
      .times(1)
      .returning(|_| futures::future::ready(Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])).boxed());
    let context = Arc::new(Context::new(Arc::new(resolver), Box::new(DirectRuleSet)));
    let session = Session::new(None);
    let flow = Arc::new(RoutedDataFlow::new(context, Arc::clone(&session)));

    let opening = tokio::task::spawn({
      let flow = Arc::clone(&flow);
      async move { flow.open().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(flow.state(), State::Opening);
    session.set_endpoint(format!("origin.test:{}", port).parse().unwrap());

    let (mut accepted, _) = listener.accept().await.unwrap();
    opening.await.unwrap().unwrap();
    assert_eq!(flow.state(), State::Established);
    assert_eq!(describe_chain(flow.as_ref()), "routed > socket");
    assert_eq!(session.facts().resolved.len(), 1);

    flow.write(Buffer::from_slice(b"hi")).await.unwrap();
    let mut received = [0u8; 2];
    accepted.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"hi");
    accepted.write_all(b"yo").await.unwrap();
    let read = flow.read(Buffer::new()).await.unwrap();
    assert_eq!(read.as_slice(), b"yo");
  }

  #[tokio::test]
  async fn rejected_sessions_never_connect() {
    let mut rules = MockRuleSet::new();
    rules
      .expect_match_session()
      .times(1)
      .returning(|_| Destination::Reject);
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().never();
    let context = Arc::new(Context::new(Arc::new(resolver), Box::new(rules)));
    let session = Session::new(None);
    session.set_endpoint("blocked.test:443".parse().unwrap());

    let flow = RoutedDataFlow::new(context, session);
    assert!(matches!(flow.open().await, Err(FlowError::Rejected(_))));
    assert_eq!(flow.state(), State::Error);
    assert!(matches!(
      flow.read(Buffer::new()).await,
      Err(FlowError::InvalidState(State::Error))
    ));
  }

  #[tokio::test]
  async fn refused_connections_are_reportable() {
    let port = {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap().port()
    };
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().never();
    let context = Arc::new(Context::new(Arc::new(resolver), Box::new(DirectRuleSet)));
    let session = Session::new(None);
    session.set_endpoint(format!("127.0.0.1:{}", port).parse().unwrap());

    let flow = RoutedDataFlow::new(context, session);
    let error = flow.open().await.unwrap_err();
    assert!(matches!(error, FlowError::Connect { .. }), "{:?}", error);
    assert!(error.is_protocol_error());
    assert_eq!(flow.state(), State::Error);
  }

  #[tokio::test(start_paused = true)]
  async fn unanswered_open_waits_for_endpoint() {
    let context = Arc::new(Context::new(
      Arc::new(MockResolver::new()),
      Box::new(DirectRuleSet),
    ));
    let flow = RoutedDataFlow::new(context, Session::new(None));
    assert!(
      tokio::time::timeout(Duration::from_secs(60), flow.open())
        .await
        .is_err(),
      "Open must not complete before an endpoint is negotiated"
    );
    assert_eq!(flow.state(), State::Error, "A dropped open leaves the flow unusable");
  }
}
