//! Backward path: undoing completed steps in reverse order.
//!
//! Compensations run one at a time. The next one is requested only after the
//! previous one is acknowledged, so a later compensation never races an
//! earlier one for the same resources.

use chrono::{DateTime, Utc};
use sagaflow_bus::{CompensationCompleted, CompensationFailed, CompensationRequest, SagaFailed};
use sagaflow_workflow::{
  Awaiting, CompensatedStep, CompensationFailure, FailureReason, SagaStatus,
};

use crate::saga::{Effect, Outcome, Saga};

impl Saga {
  /// Leave the forward path and start undoing completed steps.
  ///
  /// Steps without a compensation are skipped. If nothing needs undoing the
  /// saga fails immediately.
  pub(crate) fn begin_compensation(
    &mut self,
    reason: FailureReason,
    now: DateTime<Utc>,
  ) -> Vec<Effect> {
    let mut completed: Vec<usize> = self
      .instance
      .completed_steps
      .iter()
      .map(|c| c.step_index)
      .filter(|&i| self.definition.compensation(i).is_some())
      .collect();
    completed.sort_unstable_by(|a, b| b.cmp(a));

    self.instance.status = SagaStatus::Compensating;
    self.instance.failure_reason = Some(reason);
    self.instance.compensation_queue = completed;
    self.instance.awaiting = Awaiting::Nothing;
    self.instance.last_activity = now;

    let mut effects = vec![Effect::CancelRetry];
    effects.extend(self.request_next_compensation(now));
    effects
  }

  /// Request the compensation at the head of the queue, or fail the saga when
  /// the queue is empty.
  pub(crate) fn request_next_compensation(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
    let Some(&index) = self.instance.compensation_queue.first() else {
      return self.fail(now);
    };
    let Some(compensation) = self.definition.compensation(index) else {
      // Queue entries are filtered on construction; a recovered snapshot
      // may still carry one for a definition that changed.
      self.instance.compensation_queue.remove(0);
      return self.request_next_compensation(now);
    };

    self.instance.awaiting = Awaiting::CompensationOutcome;
    self.instance.last_activity = now;

    let original_result = self
      .instance
      .completed_result(index)
      .cloned()
      .unwrap_or(serde_json::Value::Null);

    vec![Effect::RequestCompensation {
      action: compensation.action.clone(),
      request: CompensationRequest {
        saga_id: self.instance.id.clone(),
        step_index: index,
        original_result,
        compensation_data: compensation.data.clone(),
        saga_data: self.instance.data.clone(),
        correlation_id: self.instance.correlation_id.clone(),
      },
    }]
  }

  pub(crate) fn on_compensation_completed(
    &mut self,
    event: &CompensationCompleted,
    now: DateTime<Utc>,
  ) -> Outcome {
    if let Some(reason) = self.stale_compensation_outcome(event.step_index) {
      return Outcome::Ignored(reason);
    }

    self.instance.compensation_queue.remove(0);
    self.instance.compensated_steps.push(CompensatedStep {
      step_index: event.step_index,
      compensated_at: now,
      result: event.result.clone(),
    });
    self.instance.awaiting = Awaiting::Nothing;
    self.instance.last_activity = now;

    Outcome::Applied(self.request_next_compensation(now))
  }

  pub(crate) fn on_compensation_failed(
    &mut self,
    event: &CompensationFailed,
    now: DateTime<Utc>,
  ) -> Outcome {
    if let Some(reason) = self.stale_compensation_outcome(event.step_index) {
      return Outcome::Ignored(reason);
    }

    let compensation_name = self
      .definition
      .compensation(event.step_index)
      .map(|c| c.name.clone())
      .unwrap_or_default();

    self.instance.status = SagaStatus::CompensationFailed;
    self.instance.compensation_error = Some(CompensationFailure {
      step_index: event.step_index,
      compensation_name,
      error: event.error.clone(),
    });
    self.instance.awaiting = Awaiting::Nothing;
    self.instance.last_activity = now;
    self.instance.end_time = Some(now);

    Outcome::Applied(vec![
      Effect::AnnounceFailed(self.failed_announcement(now)),
      Effect::Finished,
    ])
  }

  fn stale_compensation_outcome(&self, step_index: usize) -> Option<&'static str> {
    if self.instance.status != SagaStatus::Compensating {
      return Some("saga is not compensating");
    }
    if self.instance.awaiting != Awaiting::CompensationOutcome {
      return Some("no compensation outcome outstanding");
    }
    if self.instance.compensation_queue.first() != Some(&step_index) {
      return Some("outcome for a compensation other than the pending one");
    }
    None
  }

  fn fail(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
    self.instance.status = SagaStatus::Failed;
    self.instance.awaiting = Awaiting::Nothing;
    self.instance.last_activity = now;
    self.instance.end_time = Some(now);

    vec![Effect::AnnounceFailed(self.failed_announcement(now)), Effect::Finished]
  }

  fn failed_announcement(&self, now: DateTime<Utc>) -> SagaFailed {
    SagaFailed {
      saga_id: self.instance.id.clone(),
      name: self.definition.name().to_string(),
      failure_reason: self.instance.failure_reason.as_ref().map(ToString::to_string),
      duration: self.instance.duration_ms(now),
      correlation_id: self.instance.correlation_id.clone(),
      status: self.instance.status.as_str().to_string(),
      compensation_error: self
        .instance
        .compensation_error
        .as_ref()
        .map(ToString::to_string),
    }
  }
}
