// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Pairs a local chain with a destination-facing chain and relays between them

use std::sync::Arc;

use super::{
  data_flow::{describe_chain, BoxedDataFlow, BoxedLocalDataFlow, DataFlow, FlowError},
  session::Session,
};
use crate::util::{
  buffer::Buffer,
  cancellation::{Cancelable, Cancelled},
  RELAY_BUFFER_CAPACITY,
};

pub mod id;
pub mod registry;

pub use self::id::{MonotonicAtomicGenerator, TunnelId, TunnelIdGenerator};
pub use self::registry::{TunnelRecord, TunnelTable};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
  /// The chain facing the accepted client
  Near,
  /// The chain facing the destination
  Far,
}

impl Side {
  pub fn opposite(self) -> Side {
    match self {
      Side::Near => Side::Far,
      Side::Far => Side::Near,
    }
  }
}

impl std::fmt::Display for Side {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Side::Near => "near",
      Side::Far => "far",
    })
  }
}

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
  #[error("Failed to open {side} flow: {source}")]
  Open {
    side: Side,
    #[source]
    source: FlowError,
  },
  #[error("Relay failed on {side} flow: {source}")]
  Relay {
    side: Side,
    #[source]
    source: FlowError,
  },
  #[error("Tunnel was cancelled")]
  Cancelled,
}

impl From<Cancelled> for TunnelError {
  fn from(_: Cancelled) -> Self {
    TunnelError::Cancelled
  }
}

/// Bytes moved in each direction over a tunnel's lifetime
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RelayStats {
  pub near_to_far: u64,
  pub far_to_near: u64,
}

/// Two chains relayed to each other.
///
/// Opening runs both chains' handshakes concurrently; when either fails, the other
/// is cancelled and the failure is reported to the client where the near chain can.
/// Relaying then runs one pump per direction. End of stream on one side half-closes
/// the other side exactly once; an error on either side cancels both pumps.
pub struct Tunnel {
  id: TunnelId,
  near: BoxedLocalDataFlow,
  far: BoxedDataFlow,
  cancel: Cancelable,
  buffer_capacity: usize,
}

impl Tunnel {
  pub fn new(id: TunnelId, near: BoxedLocalDataFlow, far: BoxedDataFlow) -> Self {
    Self {
      id,
      near,
      far,
      cancel: Cancelable::new(),
      buffer_capacity: RELAY_BUFFER_CAPACITY,
    }
  }

  /// Binds the tunnel to an external cancellation token, such as an instance's shutdown
  pub fn with_cancelable(mut self, cancel: Cancelable) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
    self.buffer_capacity = buffer_capacity.max(1);
    self
  }

  pub fn id(&self) -> TunnelId {
    self.id
  }

  pub fn session(&self) -> &Arc<Session> {
    self.near.session()
  }

  pub async fn open(&self) -> Result<(), TunnelError> {
    let near_op = self.cancel.child();
    let far_op = self.cancel.child();
    let near = self.near.as_data_flow();
    let far: &dyn DataFlow = self.far.as_ref();

    let open_near = async {
      let result = near_op.run(near.open()).await;
      if matches!(result, Ok(Err(_))) {
        far_op.cancel();
      }
      result
    };
    let open_far = async {
      let result = far_op.run(far.open()).await;
      if matches!(result, Ok(Err(_))) {
        near_op.cancel();
      }
      result
    };
    let (near_opened, far_opened) = futures::future::join(open_near, open_far).await;

    let failure = match (near_opened, far_opened) {
      (Ok(Ok(())), Ok(Ok(()))) => None,
      (Ok(Err(source)), _) => Some((Side::Near, source)),
      (_, Ok(Err(source))) => Some((Side::Far, source)),
      _ => return Err(TunnelError::Cancelled),
    };
    if let Some((side, source)) = failure {
      self.report(&source).await;
      return Err(TunnelError::Open { side, source });
    }

    tracing::trace!(
      near = %describe_chain(near),
      far = %describe_chain(far),
      "tunnel open"
    );
    self
      .cancel
      .run(far.resume())
      .await?
      .map_err(|source| TunnelError::Open {
        side: Side::Far,
        source,
      })?;
    self
      .cancel
      .run(near.resume())
      .await?
      .map_err(|source| TunnelError::Open {
        side: Side::Near,
        source,
      })
  }

  async fn report(&self, error: &FlowError) {
    if !error.is_protocol_error() || !self.near.is_reportable() {
      return;
    }
    match self.cancel.run(self.near.report_error(error)).await {
      Ok(Ok(())) => tracing::trace!("failure reported to client"),
      Ok(Err(report_error)) => {
        tracing::debug!(error = %report_error, "failed to report failure to client")
      }
      Err(Cancelled) => {}
    }
  }

  pub async fn relay(&self) -> Result<RelayStats, TunnelError> {
    let abort = self.cancel.child();
    let near = self.near.as_data_flow();
    let far: &dyn DataFlow = self.far.as_ref();
    let (near_to_far, far_to_near) = futures::future::join(
      self.pump(Side::Near, near, far, &abort),
      self.pump(Side::Far, far, near, &abort),
    )
    .await;
    match (near_to_far, far_to_near) {
      (Ok(near_to_far), Ok(far_to_near)) => Ok(RelayStats {
        near_to_far,
        far_to_near,
      }),
      // The pump which failed first cancelled its sibling; report the failure, not the cancellation
      (Err(error @ TunnelError::Relay { .. }), _) | (_, Err(error @ TunnelError::Relay { .. })) => {
        Err(error)
      }
      (Err(error), _) | (_, Err(error)) => Err(error),
    }
  }

  /// Moves bytes read from `origin` into the opposite side until end of stream
  async fn pump(
    &self,
    origin: Side,
    from: &dyn DataFlow,
    to: &dyn DataFlow,
    abort: &Cancelable,
  ) -> Result<u64, TunnelError> {
    let target = origin.opposite();
    let fail = |side: Side| {
      move |source: FlowError| {
        abort.cancel();
        TunnelError::Relay { side, source }
      }
    };
    let mut transferred = 0u64;
    let mut buffer = Buffer::with_capacity(self.buffer_capacity);
    loop {
      let data = abort.run(from.read(buffer)).await?.map_err(fail(origin))?;
      if data.is_empty() {
        tracing::trace!(from = %origin, bytes = transferred, "end of stream, half-closing {}", target);
        abort.run(to.close_write()).await?.map_err(fail(target))?;
        return Ok(transferred);
      }
      transferred += data.len() as u64;
      buffer = abort.run(to.write(data)).await?.map_err(fail(target))?;
      buffer.reserve(self.buffer_capacity);
    }
  }

  /// Opens both chains and relays between them until both directions finish
  pub async fn run(self) -> Result<RelayStats, TunnelError> {
    self.open().await?;
    self.relay().await
  }
}

impl std::fmt::Debug for Tunnel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Tunnel")
      .field("id", &self.id)
      .field("session", self.session())
      .finish_non_exhaustive()
  }
}
