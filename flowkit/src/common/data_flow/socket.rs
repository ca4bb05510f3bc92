// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
  sync::Mutex,
};

use super::{DataFlow, FlowError, FlowStatus, LocalDataFlow, State};
use crate::{
  common::session::Session,
  util::{buffer::Buffer, RELAY_BUFFER_CAPACITY},
};

/// The bottom layer of a chain, moving bytes to and from a byte stream.
///
/// Reads and writes lock independent halves of the stream, so one of each may
/// be in flight at the same time.
pub struct SocketDataFlow<S> {
  reader: Mutex<ReadHalf<S>>,
  writer: Mutex<WriteHalf<S>>,
  session: Arc<Session>,
  status: FlowStatus,
}

impl<S> SocketDataFlow<S>
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  /// Wraps an accepted stream; [DataFlow::open] moves it straight to [State::Established]
  pub fn new(stream: S, session: Arc<Session>) -> Self {
    Self::with_status(stream, session, FlowStatus::new())
  }

  /// Wraps a stream which was connected by its owner and needs no further opening
  pub fn connected(stream: S, session: Arc<Session>) -> Self {
    Self::with_status(stream, session, FlowStatus::established())
  }

  fn with_status(stream: S, session: Arc<Session>, status: FlowStatus) -> Self {
    let (reader, writer) = tokio::io::split(stream);
    Self {
      reader: Mutex::new(reader),
      writer: Mutex::new(writer),
      session,
      status,
    }
  }
}

impl<S> DataFlow for SocketDataFlow<S>
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  fn name(&self) -> &'static str {
    "socket"
  }

  fn open(&self) -> BoxFuture<'_, Result<(), FlowError>> {
    async move {
      let _opening = self.status.begin_open()?;
      self.status.open_succeeded();
      Ok(())
    }
    .boxed()
  }

  fn read(&self, mut buffer: Buffer) -> BoxFuture<'_, Result<Buffer, FlowError>> {
    async move {
      let _reading = self.status.begin_read()?;
      buffer.clear();
      if buffer.capacity() == 0 {
        buffer.reserve(RELAY_BUFFER_CAPACITY);
      }
      let mut reader = self.reader.lock().await;
      match reader.read_buf(buffer.bytes_mut()).await {
        Ok(read) => {
          self.status.finish_read(read == 0);
          Ok(buffer)
        }
        Err(error) => {
          self.status.fail();
          Err(error.into())
        }
      }
    }
    .boxed()
  }

  fn write(&self, mut buffer: Buffer) -> BoxFuture<'_, Result<Buffer, FlowError>> {
    async move {
      let _writing = self.status.begin_write()?;
      let mut writer = self.writer.lock().await;
      let written = async {
        writer.write_all(buffer.as_slice()).await?;
        writer.flush().await
      }
      .await;
      match written {
        Ok(()) => {
          buffer.clear();
          Ok(buffer)
        }
        Err(error) => {
          self.status.fail();
          Err(error.into())
        }
      }
    }
    .boxed()
  }

  fn close_write(&self) -> BoxFuture<'_, Result<(), FlowError>> {
    async move {
      let _closing = self.status.begin_close_write()?;
      let mut writer = self.writer.lock().await;
      match writer.shutdown().await {
        Ok(()) => {
          self.status.finish_close_write();
          Ok(())
        }
        Err(error) => {
          self.status.fail();
          Err(error.into())
        }
      }
    }
    .boxed()
  }

  fn resume(&self) -> BoxFuture<'_, Result<(), FlowError>> {
    futures::future::ready(Ok(())).boxed()
  }

  fn report_error<'a>(&'a self, _error: &'a FlowError) -> BoxFuture<'a, Result<(), FlowError>> {
    futures::future::ready(Err(FlowError::NotReportable)).boxed()
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

  fn session(&self) -> &Arc<Session> {
    &self.session
  }

  fn next_hop(&self) -> Option<&dyn DataFlow> {
    None
  }
}

impl<S> LocalDataFlow for SocketDataFlow<S>
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  fn next_local_hop(&self) -> Option<&dyn LocalDataFlow> {
    None
  }

  fn as_data_flow(&self) -> &dyn DataFlow {
    self
  }
}
