// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The contract shared by every protocol layer of a chain.
//!
//! A chain is a stack of [DataFlow]s where each layer owns the next hop it wraps.
//! Layers are driven through `&self`; each keeps its own status so that at most one
//! read, one write, and one open are outstanding at a time, and a second concurrent
//! operation of the same class is rejected instead of interleaving.

use std::sync::Arc;

use futures::future::BoxFuture;
use http::StatusCode;

use crate::{
  common::{
    resolver::ResolveError,
    session::{Endpoint, Session},
  },
  util::buffer::Buffer,
};

pub mod http_server;
pub mod routed;
pub mod socket;
mod status;

pub use self::http_server::{HttpServerDataFlow, HttpServerError};
pub use self::routed::RoutedDataFlow;
pub use self::socket::SocketDataFlow;
pub(crate) use self::status::FlowStatus;

/// Lifecycle of a single data flow
///
/// `Closed -> Opening -> Established -> Closing -> Closed`, with `Error`
/// reachable from any non-terminal state once an operation fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
  Closed,
  Opening,
  Established,
  Closing,
  Error,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
  Stream,
  Packet,
}

#[derive(thiserror::Error, Debug)]
pub enum FlowError {
  #[error("Operation is not valid while the flow is {0:?}")]
  InvalidState(State),
  #[error("A read is already in progress")]
  ReadInProgress,
  #[error("A write is already in progress")]
  WriteInProgress,
  #[error("The read side of the flow is closed")]
  ReadClosed,
  #[error("The write side of the flow is closed")]
  WriteClosed,
  #[error("The flow cannot report errors to its peer")]
  NotReportable,
  #[error("HTTP proxy negotiation failed: {0}")]
  Http(#[from] HttpServerError),
  #[error("No destination was negotiated for the session")]
  NoEndpoint,
  #[error("Connection to {0} refused by rule")]
  Rejected(Endpoint),
  #[error(transparent)]
  Resolve(#[from] ResolveError),
  #[error("Connecting to {0} timed out")]
  ConnectTimeout(Endpoint),
  #[error("Connecting to {endpoint} failed: {source}")]
  Connect {
    endpoint: Endpoint,
    #[source]
    source: std::io::Error,
  },
  #[error("I/O failure: {0}")]
  Io(#[from] std::io::Error),
}

impl FlowError {
  /// Negotiation and routing failures, as opposed to transport failures or misuse
  /// of a flow, which are worth reporting to the peer
  pub fn is_protocol_error(&self) -> bool {
    matches!(
      self,
      Self::Http(_)
        | Self::NoEndpoint
        | Self::Rejected(_)
        | Self::Resolve(_)
        | Self::ConnectTimeout(_)
        | Self::Connect { .. }
    )
  }

  /// The HTTP status used when this failure is reported to an HTTP client
  pub fn http_status(&self) -> StatusCode {
    match self {
      Self::Http(HttpServerError::NoError) => StatusCode::INTERNAL_SERVER_ERROR,
      Self::Http(_) | Self::NoEndpoint => StatusCode::BAD_REQUEST,
      Self::Rejected(_) => StatusCode::FORBIDDEN,
      Self::Resolve(_) | Self::Connect { .. } | Self::Io(_) => StatusCode::BAD_GATEWAY,
      Self::ConnectTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

/// One protocol layer of a chain.
///
/// Every operation returns a future; dropping that future before it resolves
/// cancels the operation, and the layer releases its in-flight marker for it.
/// Buffers passed to [DataFlow::read] and [DataFlow::write] are owned by the
/// layer until they come back in the successful result.
pub trait DataFlow: Send + Sync {
  /// Short name of this layer, for diagnostics
  fn name(&self) -> &'static str;

  /// Performs this layer's handshake, opening the next hop first where there is one.
  ///
  /// Valid only once, from the initial [State::Closed].
  fn open(&self) -> BoxFuture<'_, Result<(), FlowError>>;

  /// Reads decoded application bytes, up to the buffer's capacity.
  ///
  /// An empty buffer signals a clean end of stream and closes the read side.
  fn read(&self, buffer: Buffer) -> BoxFuture<'_, Result<Buffer, FlowError>>;

  /// Writes the whole buffer, handing it back cleared once flushed to the next hop
  fn write(&self, buffer: Buffer) -> BoxFuture<'_, Result<Buffer, FlowError>>;

  /// Half-closes the write direction
  fn close_write(&self) -> BoxFuture<'_, Result<(), FlowError>>;

  /// Lets the layer proceed after a successful open, once the peer chain is ready
  fn resume(&self) -> BoxFuture<'_, Result<(), FlowError>>;

  /// Tries to tell the remote peer about a failure before the flow is torn down
  fn report_error<'a>(&'a self, error: &'a FlowError) -> BoxFuture<'a, Result<(), FlowError>>;

  fn state(&self) -> State;

  fn is_read_closed(&self) -> bool;

  fn is_write_closed(&self) -> bool;

  fn is_write_closing(&self) -> bool;

  fn is_reading(&self) -> bool;

  fn is_writing(&self) -> bool;

  /// Whether [DataFlow::report_error] can currently reach the peer
  fn is_reportable(&self) -> bool {
    false
  }

  fn data_type(&self) -> DataType {
    DataType::Stream
  }

  fn session(&self) -> &Arc<Session>;

  fn next_hop(&self) -> Option<&dyn DataFlow>;
}

/// A layer facing the accepted client connection
pub trait LocalDataFlow: DataFlow {
  fn next_local_hop(&self) -> Option<&dyn LocalDataFlow>;

  fn as_data_flow(&self) -> &dyn DataFlow;
}

pub type BoxedDataFlow = Box<dyn DataFlow>;
pub type BoxedLocalDataFlow = Box<dyn LocalDataFlow>;

/// Names each layer of a chain, outermost first, such as `http-server > socket`
pub fn describe_chain(flow: &dyn DataFlow) -> String {
  let mut names = vec![flow.name()];
  let mut hop = flow.next_hop();
  while let Some(layer) = hop {
    names.push(layer.name());
    hop = layer.next_hop();
  }
  names.join(" > ")
}
