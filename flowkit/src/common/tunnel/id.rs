// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TunnelId(u64);

impl TunnelId {
  pub fn new(inner: u64) -> TunnelId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for TunnelId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<TunnelId> for u64 {
  fn from(id: TunnelId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for TunnelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "TunnelId({})", self.0)
  }
}

impl std::fmt::Display for TunnelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait TunnelIdGenerator {
  fn next(&self) -> TunnelId;
}

/// Hands out ascending ids, starting from the given value
#[derive(Debug)]
pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }
}

impl TunnelIdGenerator for MonotonicAtomicGenerator {
  fn next(&self) -> TunnelId {
    TunnelId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

#[cfg(test)]
mod tests {
  use super::{MonotonicAtomicGenerator, TunnelId, TunnelIdGenerator};

  #[test]
  fn ids_ascend() {
    let generator = MonotonicAtomicGenerator::new(7);
    assert_eq!(generator.next(), TunnelId::new(7));
    assert_eq!(u64::from(generator.next()), 8);
    assert_eq!(format!("{:?}", generator.next()), "TunnelId(9)");
  }
}
