//! Per-saga timers.
//!
//! Every active saga owns at most one deadline and at most one pending retry.
//! Both are delivered back to the engine as commands, so a timer that fires
//! after its saga moved on is handled like any other stale input.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sagaflow_workflow::SagaId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::Command;
use crate::scheduler::{Scheduler, TimerHandle};

#[derive(Debug, Default)]
struct SagaTimers {
  timeout: Option<TimerHandle>,
  retry: Option<TimerHandle>,
}

pub(crate) struct TimeoutSupervisor {
  scheduler: Arc<dyn Scheduler>,
  inbox: mpsc::Sender<Command>,
  timers: HashMap<SagaId, SagaTimers>,
}

impl TimeoutSupervisor {
  pub(crate) fn new(scheduler: Arc<dyn Scheduler>, inbox: mpsc::Sender<Command>) -> Self {
    Self {
      scheduler,
      inbox,
      timers: HashMap::new(),
    }
  }

  /// Arm the saga deadline, replacing any previous one.
  pub(crate) fn arm_timeout(&mut self, saga_id: &str, after: Duration) {
    let command = Command::TimeoutFired {
      saga_id: saga_id.to_string(),
    };
    let handle = self.deliver_after(after, command);
    let timers = self.timers.entry(saga_id.to_string()).or_default();
    if let Some(previous) = timers.timeout.replace(handle) {
      previous.cancel();
    }
  }

  /// Arm a retry delivery, replacing any pending one.
  pub(crate) fn arm_retry(&mut self, saga_id: &str, step_index: usize, attempt: u32, after: Duration) {
    let command = Command::RetryDue {
      saga_id: saga_id.to_string(),
      step_index,
      attempt,
    };
    let handle = self.deliver_after(after, command);
    let timers = self.timers.entry(saga_id.to_string()).or_default();
    if let Some(previous) = timers.retry.replace(handle) {
      previous.cancel();
    }
  }

  pub(crate) fn cancel_retry(&mut self, saga_id: &str) {
    if let Some(retry) = self.timers.get_mut(saga_id).and_then(|t| t.retry.take()) {
      debug!(saga_id, "cancelled pending retry");
      retry.cancel();
    }
  }

  /// Cancel every timer of a saga.
  pub(crate) fn release(&mut self, saga_id: &str) {
    if let Some(timers) = self.timers.remove(saga_id) {
      if let Some(timeout) = timers.timeout {
        timeout.cancel();
      }
      if let Some(retry) = timers.retry {
        retry.cancel();
      }
    }
  }

  pub(crate) fn release_all(&mut self) {
    let ids: Vec<SagaId> = self.timers.keys().cloned().collect();
    for id in ids {
      self.release(&id);
    }
  }

  /// Number of sagas with at least one armed timer.
  pub(crate) fn armed(&self) -> usize {
    self
      .timers
      .values()
      .filter(|t| t.timeout.is_some() || t.retry.is_some())
      .count()
  }

  fn deliver_after(&self, after: Duration, command: Command) -> TimerHandle {
    let inbox = self.inbox.clone();
    self.scheduler.schedule(
      after,
      Box::pin(async move {
        // The engine may already be gone.
        let _ = inbox.send(command).await;
      }),
    )
  }
}
