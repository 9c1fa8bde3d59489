//! Delayed work for retry backoff and saga deadlines.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;

/// Runs a future after a delay.
///
/// The engine never sleeps itself; it hands retry and timeout deliveries to a
/// scheduler and keeps the returned handle so it can cancel them.
pub trait Scheduler: Send + Sync {
  fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle;
}

/// Cancels a scheduled task. Dropping the handle does not cancel.
pub struct TimerHandle {
  cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl TimerHandle {
  pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
    Self {
      cancel: Some(Box::new(cancel)),
    }
  }

  /// Prevent the task from running if it has not run yet.
  pub fn cancel(mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

impl fmt::Debug for TimerHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TimerHandle")
      .field("armed", &self.cancel.is_some())
      .finish()
  }
}

/// Scheduler backed by `tokio::time`.
///
/// Under a paused tokio clock (`tokio::time::pause`) delays elapse
/// deterministically, which is how the engine tests drive backoff and
/// timeouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
  fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      task.await;
    });
    let abort = handle.abort_handle();
    TimerHandle::new(move || abort.abort())
  }
}
