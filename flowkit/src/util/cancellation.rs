// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  future::Future,
  pin::Pin,
  task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("Operation was cancelled before completion")]
pub struct Cancelled;

/// Cancellation handle for in-flight operations.
///
/// The issuer of an operation keeps the [Cancelable] and binds the operation to it
/// with [Cancelable::run] or [Cancelable::on_complete]. Once [Cancelable::cancel] has
/// been called, the bound operation's result is never observed, even if the operation
/// itself finishes afterwards. Side effects the operation already committed stay committed.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct Cancelable {
  token: CancellationToken,
}

impl Cancelable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Cancels every operation bound to this token or one of its children. Idempotent.
  pub fn cancel(&self) {
    self.token.cancel()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// A token which is cancelled alongside this one, but can also be cancelled on its own
  pub fn child(&self) -> Cancelable {
    Self {
      token: self.token.child_token(),
    }
  }

  /// Binds an operation to this token.
  ///
  /// The returned future resolves to `Err(Cancelled)` if the token is cancelled
  /// before the operation's output is observed; cancellation is checked first on every poll.
  pub fn run<F: Future>(&self, operation: F) -> Guarded<F> {
    Guarded {
      operation,
      cancelled: self.token.clone().cancelled_owned(),
    }
  }

  /// Spawns the operation and registers a completion handler for it.
  ///
  /// The handler runs at most once, and never if the token is cancelled first.
  pub fn on_complete<F, H>(&self, operation: F, handler: H) -> tokio::task::JoinHandle<()>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    H: FnOnce(F::Output) + Send + 'static,
  {
    let guarded = self.run(operation);
    tokio::task::spawn(async move {
      if let Ok(output) = guarded.await {
        handler(output);
      }
    })
  }
}

impl From<CancellationToken> for Cancelable {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

pin_project! {
  /// An operation bound to a [Cancelable]
  #[must_use = "futures do nothing unless polled"]
  pub struct Guarded<F> {
    #[pin]
    operation: F,
    #[pin]
    cancelled: WaitForCancellationFutureOwned,
  }
}

impl<F: Future> Future for Guarded<F> {
  type Output = Result<F::Output, Cancelled>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.project();
    if this.cancelled.poll(cx).is_ready() {
      return Poll::Ready(Err(Cancelled));
    }
    match this.operation.poll(cx) {
      Poll::Ready(output) => Poll::Ready(Ok(output)),
      Poll::Pending => Poll::Pending,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };
  use std::time::Duration;

  use super::{Cancelable, Cancelled};

  fn counting_handler(counter: &Arc<AtomicUsize>) -> impl FnOnce(()) + Send + 'static {
    let counter = Arc::clone(counter);
    move |()| {
      counter.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn cancel_before_completion_suppresses_handler() {
    let fired = Arc::new(AtomicUsize::new(0));
    let token = Cancelable::new();
    let task = token.on_complete(
      tokio::time::sleep(Duration::from_secs(10)),
      counting_handler(&fired),
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();
    // Run the clock well past the point where the operation would have finished
    tokio::time::sleep(Duration::from_secs(30)).await;
    task.await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn cancel_after_completion_is_a_no_op() {
    let fired = Arc::new(AtomicUsize::new(0));
    let token = Cancelable::new();
    let task = token.on_complete(
      tokio::time::sleep(Duration::from_secs(1)),
      counting_handler(&fired),
    );
    tokio::time::sleep(Duration::from_secs(2)).await;
    task.await.unwrap();
    token.cancel();
    token.cancel();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn cancellation_wins_over_ready_output() {
    let token = Cancelable::new();
    token.cancel();
    assert_eq!(token.run(futures::future::ready(5u8)).await, Err(Cancelled));
  }

  #[tokio::test]
  async fn parent_cancels_children() {
    let parent = Cancelable::new();
    let child = parent.child();
    let sibling = parent.child();
    sibling.cancel();
    assert!(!parent.is_cancelled());
    assert!(!child.is_cancelled());
    parent.cancel();
    assert!(child.is_cancelled());
    assert!(parent.is_cancelled());
    assert_eq!(
      child.run(futures::future::pending::<()>()).await,
      Err(Cancelled)
    );
  }
}
