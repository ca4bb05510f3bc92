// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use bytes::{Buf, BytesMut};

/// Owned byte region passed by value between data flow layers.
///
/// Consumed bytes are dropped from the front, so [Buffer::as_slice] always
/// yields only the bytes that have not yet been consumed. Moving a buffer into
/// a read or write call hands ownership to the callee until it returns it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
  bytes: BytesMut,
}

impl Buffer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      bytes: BytesMut::with_capacity(capacity),
    }
  }

  pub fn from_slice(data: &[u8]) -> Self {
    Self {
      bytes: BytesMut::from(data),
    }
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.bytes.capacity()
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.bytes
  }

  /// Marks the first `count` bytes as consumed
  pub fn consume(&mut self, count: usize) {
    self.bytes.advance(count.min(self.bytes.len()));
  }

  /// Drops every unconsumed byte but keeps the allocation for reuse
  pub fn clear(&mut self) {
    self.bytes.clear();
  }

  /// Ensures room for at least `additional` more bytes without reallocating
  pub fn reserve(&mut self, additional: usize) {
    self.bytes.reserve(additional);
  }

  pub fn extend_from_slice(&mut self, data: &[u8]) {
    self.bytes.extend_from_slice(data);
  }

  /// Splits off the first `count` unconsumed bytes into a new buffer
  pub fn split_to(&mut self, count: usize) -> Buffer {
    Buffer {
      bytes: self.bytes.split_to(count.min(self.bytes.len())),
    }
  }

  pub(crate) fn bytes_mut(&mut self) -> &mut BytesMut {
    &mut self.bytes
  }
}

impl From<Vec<u8>> for Buffer {
  fn from(data: Vec<u8>) -> Self {
    Self {
      bytes: BytesMut::from(&data[..]),
    }
  }
}

impl AsRef<[u8]> for Buffer {
  fn as_ref(&self) -> &[u8] {
    self.as_slice()
  }
}

impl std::fmt::Debug for Buffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Buffer")
      .field("len", &self.len())
      .field("capacity", &self.capacity())
      .finish()
  }
}
