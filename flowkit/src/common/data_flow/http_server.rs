// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Server side of an HTTP proxy handshake.
//!
//! Reads the client's first request head, publishes its destination on the
//! session, and then carries the remaining bytes transparently. CONNECT requests
//! are answered with `200 Connection Established` once the destination is reachable;
//! plain proxy requests are rewritten to origin-form and forwarded as the first
//! bytes of the stream.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::{future::BoxFuture, FutureExt};
use http::StatusCode;

use super::{DataFlow, FlowError, FlowStatus, LocalDataFlow, State};
use crate::{
  common::{
    http::{
      rewriter::starts_request_line, FeedStatus, HttpMessageHandler, HttpMessageStreamRewriter,
      MessageHead,
    },
    session::{Endpoint, Session},
  },
  util::{buffer::Buffer, dropkick::Dropkick},
};

const NEGOTIATION_READ_CAPACITY: usize = 4096;
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Failures of the HTTP proxy handshake, with stable numeric codes
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HttpServerError {
  #[error("No error")]
  NoError = 0,
  #[error("Client sent data before the CONNECT request finished")]
  DataBeforeConnectRequestFinish = 1,
  #[error("Client sent an invalid proxy request")]
  InvalidRequest = 2,
}

impl HttpServerError {
  pub fn code(&self) -> u8 {
    *self as u8
  }
}

#[derive(Debug, Default)]
struct Negotiation {
  reportable: bool,
  reporting: bool,
  is_connect: bool,
  has_read_method: bool,
  reading_first_header: bool,
  first_header_offset: usize,
  responded: bool,
  method: Option<String>,
  host_header: Option<String>,
  pending: Option<Buffer>,
}

/// Collects the first request head's facts as the parser reports them
struct Negotiator<'a> {
  negotiation: &'a mut Negotiation,
}

impl<'a> HttpMessageHandler for Negotiator<'a> {
  fn on_method(&mut self, method: &str) -> bool {
    self.negotiation.has_read_method = true;
    self.negotiation.is_connect = method == "CONNECT";
    self.negotiation.method = Some(method.to_string());
    true
  }

  fn on_header_pair(&mut self, name: &str, value: &[u8]) -> bool {
    if name.eq_ignore_ascii_case("host") {
      self.negotiation.host_header = Some(String::from_utf8_lossy(value).into_owned());
    }
    true
  }

  fn on_message_complete(&mut self, buffer_offset: usize, _upgrade: bool) -> bool {
    self.negotiation.reading_first_header = false;
    self.negotiation.first_header_offset = buffer_offset;
    true
  }
}

pub struct HttpServerDataFlow {
  inner: Box<dyn LocalDataFlow>,
  session: Arc<Session>,
  status: FlowStatus,
  negotiation: Mutex<Negotiation>,
}

impl HttpServerDataFlow {
  pub fn new(inner: Box<dyn LocalDataFlow>) -> Self {
    let session = Arc::clone(inner.session());
    Self {
      inner,
      session,
      status: FlowStatus::new(),
      negotiation: Mutex::new(Negotiation::default()),
    }
  }

  fn negotiation(&self) -> MutexGuard<'_, Negotiation> {
    self.negotiation.lock().expect("Mutex poisoned")
  }

  async fn negotiate(&self) -> Result<(), FlowError> {
    self.inner.open().await?;
    {
      let mut negotiation = self.negotiation();
      negotiation.reportable = true;
      negotiation.reading_first_header = true;
    }
    let mut rewriter = HttpMessageStreamRewriter::requests();
    loop {
      let buffer = self
        .inner
        .read(Buffer::with_capacity(NEGOTIATION_READ_CAPACITY))
        .await?;
      if buffer.is_empty() {
        let started = self.negotiation().has_read_method;
        tracing::debug!(started, "client closed before finishing its request head");
        return Err(HttpServerError::InvalidRequest.into());
      }
      let fed = {
        let mut negotiation = self.negotiation();
        let mut negotiator = Negotiator {
          negotiation: &mut negotiation,
        };
        rewriter.feed(buffer.as_slice(), &mut negotiator)
      };
      match fed {
        Ok(FeedStatus::Partial) => continue,
        Ok(FeedStatus::Complete { .. }) => {
          let head = rewriter
            .take_head()
            .ok_or(HttpServerError::InvalidRequest)?;
          return self.accept_head(head, buffer);
        }
        Err(error) => {
          tracing::debug!(%error, "malformed proxy request");
          return Err(HttpServerError::InvalidRequest.into());
        }
      }
    }
  }

  /// Validates the first request head and stashes the bytes which must be replayed to the destination
  fn accept_head(&self, mut head: MessageHead, mut last_chunk: Buffer) -> Result<(), FlowError> {
    let mut negotiation = self.negotiation();
    debug_assert!(!negotiation.reading_first_header);
    last_chunk.consume(negotiation.first_header_offset);
    let trailing = last_chunk;
    let target = head.target().unwrap_or_default().to_string();

    let (endpoint, mut pending) = if negotiation.is_connect {
      // A tunnel's first bytes must wait for our 200 response; another request here is a client error
      if starts_request_line(trailing.as_slice()) {
        return Err(HttpServerError::DataBeforeConnectRequestFinish.into());
      }
      let endpoint =
        Endpoint::from_authority(&target, None).map_err(|_| HttpServerError::InvalidRequest)?;
      (endpoint, Buffer::new())
    } else {
      let (endpoint, origin_form) =
        absolute_target(&target, negotiation.host_header.as_deref())
          .ok_or(HttpServerError::InvalidRequest)?;
      head.set_target(origin_form);
      head.remove_headers(|name| {
        name.len() > 6 && name.as_bytes()[..6].eq_ignore_ascii_case(b"proxy-")
      });
      (endpoint, Buffer::from(head.serialize()))
    };
    pending.extend_from_slice(trailing.as_slice());
    negotiation.pending = if pending.is_empty() {
      None
    } else {
      Some(pending)
    };

    let is_connect = negotiation.is_connect;
    let method = negotiation.method.clone();
    drop(negotiation);

    tracing::debug!(%endpoint, ?method, "proxy request accepted");
    self.session.update_facts(|facts| {
      facts.protocol = Some(if is_connect { "http-connect" } else { "http" });
      facts.method = method;
    });
    self.session.set_endpoint(endpoint);
    Ok(())
  }
}

/// Splits an absolute-form target into its endpoint and origin-form path
fn absolute_target(target: &str, host_header: Option<&str>) -> Option<(Endpoint, String)> {
  let uri: http::Uri = target.parse().ok()?;
  let origin_form = uri
    .path_and_query()
    .map(|path| path.as_str())
    .filter(|path| !path.is_empty())
    .unwrap_or("/")
    .to_string();
  let endpoint = match uri.authority() {
    Some(authority) => {
      if uri.scheme_str().map_or(false, |scheme| scheme != "http") {
        return None;
      }
      Endpoint::from_authority(authority.as_str(), Some(80)).ok()?
    }
    // Origin-form request addressed to us; the Host header names the destination
    None => Endpoint::from_authority(host_header?, Some(80)).ok()?,
  };
  Some((endpoint, origin_form))
}

fn error_response(status: StatusCode) -> Vec<u8> {
  format!(
    "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Error")
  )
  .into_bytes()
}

impl DataFlow for HttpServerDataFlow {
  fn name(&self) -> &'static str {
    "http-server"
  }

  fn open(&self) -> BoxFuture<'_, Result<(), FlowError>> {
    async move {
      let _opening = self.status.begin_open()?;
      match self.negotiate().await {
        Ok(()) => {
          self.status.open_succeeded();
          Ok(())
        }
        Err(error) => {
          self.status.fail();
          Err(error)
        }
      }
    }
    .boxed()
  }

  fn read(&self, buffer: Buffer) -> BoxFuture<'_, Result<Buffer, FlowError>> {
    async move {
      let _reading = self.status.begin_read()?;
      let pending = self.negotiation().pending.take();
      if let Some(mut pending) = pending {
        let limit = match buffer.capacity() {
          0 => pending.len(),
          capacity => capacity,
        };
        if pending.len() > limit {
          let chunk = pending.split_to(limit);
          self.negotiation().pending = Some(pending);
          return Ok(chunk);
        }
        return Ok(pending);
      }
      match self.inner.read(buffer).await {
        Ok(buffer) => {
          self.status.finish_read(buffer.is_empty());
          Ok(buffer)
        }
        Err(error) => {
          self.status.fail();
          Err(error)
        }
      }
    }
    .boxed()
  }

  fn write(&self, buffer: Buffer) -> BoxFuture<'_, Result<Buffer, FlowError>> {
    async move {
      let _writing = self.status.begin_write()?;
      self.inner.write(buffer).await.map_err(|error| {
        self.status.fail();
        error
      })
    }
    .boxed()
  }

  fn close_write(&self) -> BoxFuture<'_, Result<(), FlowError>> {
    async move {
      let _closing = self.status.begin_close_write()?;
      match self.inner.close_write().await {
        Ok(()) => {
          self.status.finish_close_write();
          Ok(())
        }
        Err(error) => {
          self.status.fail();
          Err(error)
        }
      }
    }
    .boxed()
  }

  fn resume(&self) -> BoxFuture<'_, Result<(), FlowError>> {
    async move {
      let _writing = self.status.begin_write()?;
      let respond = {
        let mut negotiation = self.negotiation();
        let respond = negotiation.is_connect && !negotiation.responded;
        negotiation.responded = true;
        negotiation.reportable = false;
        respond
      };
      if respond {
        if let Err(error) = self.inner.write(Buffer::from_slice(CONNECT_ESTABLISHED)).await {
          self.status.fail();
          return Err(error);
        }
      }
      Ok(())
    }
    .boxed()
  }

  fn report_error<'a>(&'a self, error: &'a FlowError) -> BoxFuture<'a, Result<(), FlowError>> {
    async move {
      {
        let mut negotiation = self.negotiation();
        if !negotiation.reportable || negotiation.reporting {
          return Err(FlowError::NotReportable);
        }
        negotiation.reporting = true;
      }
      let _reported = Dropkick::callback(|| {
        let mut negotiation = self.negotiation();
        negotiation.reporting = false;
        negotiation.reportable = false;
      });
      let status = error.http_status();
      tracing::debug!(%status, %error, "reporting failure to proxy client");
      let reported = async {
        self.inner.write(Buffer::from(error_response(status))).await?;
        self.inner.close_write().await
      };
      match reported.await {
        Ok(()) => {
          self.status.finish_close_write();
          Ok(())
        }
        Err(error) => {
          self.status.fail();
          Err(error)
        }
      }
    }
    .boxed()
  }

  fn state(&self) -> State {
    self.status.state()
  }

  fn is_read_closed(&self) -> bool {
    self.status.snapshot().read_closed
  }

  fn is_write_closed(&self) -> bool {
    self.status.snapshot().write_closed
  }

  fn is_write_closing(&self) -> bool {
    self.status.snapshot().write_closing
  }

  fn is_reading(&self) -> bool {
    self.status.snapshot().reading
  }

  fn is_writing(&self) -> bool {
    self.status.snapshot().writing
  }

  fn is_reportable(&self) -> bool {
    self.negotiation().reportable
  }

  fn session(&self) -> &Arc<Session> {
    &self.session
  }

  fn next_hop(&self) -> Option<&dyn DataFlow> {
    Some(self.inner.as_data_flow())
  }
}

impl LocalDataFlow for HttpServerDataFlow {
  fn next_local_hop(&self) -> Option<&dyn LocalDataFlow> {
    Some(self.inner.as_ref())
  }

  fn as_data_flow(&self) -> &dyn DataFlow {
    self
  }
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

  use super::{HttpServerDataFlow, HttpServerError};
  use crate::{
    common::{
      data_flow::{describe_chain, DataFlow, FlowError, SocketDataFlow, State},
      session::{Endpoint, Session},
    },
    util::buffer::Buffer,
  };

  async fn flow_with_request(request: &[u8]) -> (HttpServerDataFlow, DuplexStream) {
    let (local, mut client) = tokio::io::duplex(4096);
    client.write_all(request).await.unwrap();
    let socket = SocketDataFlow::new(local, Session::new(None));
    (HttpServerDataFlow::new(Box::new(socket)), client)
  }

  #[tokio::test]
  async fn connect_with_early_data() {
    let (flow, mut client) =
      flow_with_request(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nhello").await;
    flow.open().await.unwrap();
    assert_eq!(flow.state(), State::Established);
    assert_eq!(
      flow.session().endpoint(),
      Some("example.com:443".parse::<Endpoint>().unwrap())
    );
    assert_eq!(flow.session().facts().protocol, Some("http-connect"));
    assert_eq!(describe_chain(&flow), "http-server > socket");

    let first = flow.read(Buffer::with_capacity(1024)).await.unwrap();
    assert_eq!(first.as_slice(), b"hello");

    flow.resume().await.unwrap();
    assert!(!flow.is_reportable());
    let mut response = vec![0u8; 39];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"HTTP/1.1 200 Connection Established\r\n\r\n");
  }

  #[tokio::test]
  async fn head_split_across_reads() {
    let (local, mut client) = tokio::io::duplex(4096);
    let flow = HttpServerDataFlow::new(Box::new(SocketDataFlow::new(local, Session::new(None))));
    let opening = tokio::task::spawn(async move {
      flow.open().await?;
      Ok::<_, FlowError>(flow)
    });
    client.write_all(b"CONNECT 10.0.0.1:").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    client.write_all(b"8443 HTTP/1.1\r\n\r\n").await.unwrap();
    let flow = opening.await.unwrap().unwrap();
    assert_eq!(
      flow.session().endpoint(),
      Some("10.0.0.1:8443".parse::<Endpoint>().unwrap())
    );
  }

  #[tokio::test]
  async fn pipelined_request_after_connect_is_refused() {
    let (flow, _client) =
      flow_with_request(b"CONNECT example.com:443 HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n").await;
    let error = flow.open().await.unwrap_err();
    assert!(matches!(
      error,
      FlowError::Http(HttpServerError::DataBeforeConnectRequestFinish)
    ));
    assert_eq!(flow.state(), State::Error);
    assert!(flow.session().endpoint().is_none());
  }

  #[tokio::test]
  async fn garbage_is_an_invalid_request() {
    let (flow, mut client) = flow_with_request(b"\x00\x01\x02").await;
    let error = flow.open().await.unwrap_err();
    assert!(matches!(error, FlowError::Http(HttpServerError::InvalidRequest)));
    assert_eq!(HttpServerError::InvalidRequest.code(), 2);

    assert!(flow.is_reportable());
    flow.report_error(&error).await.unwrap();
    assert!(!flow.is_reportable());
    assert!(flow.is_write_closed());
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);
    assert!(matches!(
      flow.report_error(&error).await,
      Err(FlowError::NotReportable)
    ));
  }

  #[tokio::test]
  async fn failed_acknowledgement_fails_the_flow() {
    let (flow, client) = flow_with_request(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await;
    flow.open().await.unwrap();
    drop(client);
    assert!(matches!(flow.resume().await, Err(FlowError::Io(_))));
    assert_eq!(flow.state(), State::Error);
  }

  #[tokio::test]
  async fn early_close_is_an_invalid_request() {
    let (flow, mut client) = flow_with_request(b"CONNECT example.com").await;
    client.shutdown().await.unwrap();
    assert!(matches!(
      flow.open().await,
      Err(FlowError::Http(HttpServerError::InvalidRequest))
    ));
  }

  #[tokio::test]
  async fn plain_requests_are_rewritten() {
    let (flow, _client) = flow_with_request(
      b"GET http://example.com/index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
    )
    .await;
    flow.open().await.unwrap();
    assert_eq!(
      flow.session().endpoint(),
      Some("example.com:80".parse::<Endpoint>().unwrap())
    );
    assert_eq!(flow.session().facts().method.as_deref(), Some("GET"));

    let forwarded = flow.read(Buffer::new()).await.unwrap();
    assert_eq!(
      forwarded.as_slice(),
      &b"GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n"[..]
    );
    // Nothing to acknowledge for a plain request
    flow.resume().await.unwrap();
  }

  #[tokio::test]
  async fn pending_bytes_respect_read_capacity() {
    let (flow, _client) = flow_with_request(b"CONNECT a.test:1 HTTP/1.1\r\n\r\n0123456789").await;
    flow.open().await.unwrap();
    let first = flow.read(Buffer::with_capacity(4)).await.unwrap();
    assert_eq!(first.as_slice(), b"0123");
    let rest = flow.read(Buffer::with_capacity(64)).await.unwrap();
    assert_eq!(rest.as_slice(), b"456789");
  }
}
