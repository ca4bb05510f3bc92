// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Instant};

use dashmap::DashMap;
use tokio::sync::Notify;

use super::id::TunnelId;
use crate::{common::session::Session, util::cancellation::Cancelable};

#[derive(Debug, Clone)]
pub struct TunnelRecord {
  pub session: Arc<Session>,
  pub cancel: Cancelable,
  pub opened_at: Instant,
}

impl TunnelRecord {
  pub fn new(session: Arc<Session>, cancel: Cancelable) -> Self {
    Self {
      session,
      cancel,
      opened_at: Instant::now(),
    }
  }
}

/// Live tunnels of an instance, keyed by id.
///
/// A tunnel is inserted when spawned and removed by its own task once it finishes,
/// so the table keeps no tunnel alive by itself.
#[derive(Debug, Default)]
pub struct TunnelTable {
  tunnels: DashMap<TunnelId, TunnelRecord>,
  drained: Notify,
}

impl TunnelTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, id: TunnelId, record: TunnelRecord) {
    self.tunnels.insert(id, record);
  }

  pub fn remove(&self, id: TunnelId) -> Option<TunnelRecord> {
    let record = self.tunnels.remove(&id).map(|(_, record)| record);
    if self.tunnels.is_empty() {
      self.drained.notify_waiters();
    }
    record
  }

  pub fn len(&self) -> usize {
    self.tunnels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tunnels.is_empty()
  }

  /// Cancels every tunnel currently in the table; each removes itself as it unwinds
  pub fn cancel_all(&self) {
    for entry in self.tunnels.iter() {
      entry.value().cancel.cancel();
    }
  }

  /// Resolves once the table holds no tunnels
  pub async fn wait_drained(&self) {
    loop {
      let drained = self.drained.notified();
      if self.is_empty() {
        return;
      }
      drained.await;
    }
  }
}
