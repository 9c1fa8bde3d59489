//! Saga state machine.
//!
//! A [`Saga`] pairs an instance with its definition. Every transition is a
//! plain method taking the triggering input and the current time, mutating
//! the instance, and returning the [`Effect`]s the engine must carry out.
//! Nothing here touches the bus, the log, or a timer.
//!
//! ```text
//!            step ok (more steps)           step ok (last)
//!          ┌──────────────────┐       ┌──────────────────────▶ COMPLETED
//!          ▼                  │       │
//!  start ▶ RUNNING ───────────┴───────┘
//!          │  ▲  step failed, retries left: backoff, same index
//!          │  └──────┘
//!          │ retries exhausted / timeout
//!          ▼
//!      COMPENSATING ── all requested compensations done ─▶ FAILED
//!          │
//!          └── a compensation failed ─▶ COMPENSATION_FAILED
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sagaflow_bus::{
  CompensationRequest, SagaCompleted, SagaEvent, SagaFailed, StepCompleted, StepFailed,
  StepRequest,
};
use sagaflow_workflow::{
  Awaiting, CompletedStep, FailedStep, FailureReason, SagaInstance, SagaStatus, WorkflowDefinition,
};
use tracing::debug;

/// Work the engine performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
  /// Publish on `saga:step:<action>`.
  RequestStep { action: String, request: StepRequest },
  /// Publish on `saga:compensation:<action>`.
  RequestCompensation {
    action: String,
    request: CompensationRequest,
  },
  AnnounceCompleted(SagaCompleted),
  AnnounceFailed(SagaFailed),
  /// Deliver a retry for `step_index` after `delay`.
  ScheduleRetry {
    step_index: usize,
    attempt: u32,
    delay: Duration,
  },
  /// Drop any pending retry delivery.
  CancelRetry,
  /// The saga reached a terminal state; release its timers and evict it.
  Finished,
}

/// Result of feeding an input to a saga.
#[derive(Debug, PartialEq)]
pub(crate) enum Outcome {
  Applied(Vec<Effect>),
  /// The input was stale or duplicated; nothing changed.
  Ignored(&'static str),
}

/// A live saga: its mutable instance and the definition it runs.
#[derive(Debug)]
pub(crate) struct Saga {
  pub(crate) instance: SagaInstance,
  pub(crate) definition: Arc<WorkflowDefinition>,
}

impl Saga {
  pub(crate) fn new(instance: SagaInstance, definition: Arc<WorkflowDefinition>) -> Self {
    Self {
      instance,
      definition,
    }
  }

  /// Begin forward execution at the current step.
  pub(crate) fn start(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
    self.execute_next_step(now)
  }

  /// Re-issue whatever the saga was waiting for when it was last recorded.
  ///
  /// Used after recovery; handlers may see a request twice.
  pub(crate) fn resume(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
    match (self.instance.status, self.instance.awaiting) {
      (SagaStatus::Running, Awaiting::RetryBackoff) => {
        let attempt = self.instance.retry_count;
        vec![Effect::ScheduleRetry {
          step_index: self.instance.current_step_index,
          attempt,
          delay: self.definition.retry_policy().delay_for(attempt),
        }]
      }
      (SagaStatus::Running, _) => self.execute_next_step(now),
      (SagaStatus::Compensating, _) => self.request_next_compensation(now),
      _ => Vec::new(),
    }
  }

  /// Request the current step, or complete the saga if none are left.
  pub(crate) fn execute_next_step(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
    let index = self.instance.current_step_index;
    let Some(step) = self.definition.step(index) else {
      return self.complete(now);
    };

    self.instance.awaiting = Awaiting::StepOutcome;
    self.instance.last_activity = now;

    vec![Effect::RequestStep {
      action: step.action.clone(),
      request: StepRequest {
        saga_id: self.instance.id.clone(),
        step_index: index,
        step_data: step.data.clone(),
        saga_data: self.instance.data.clone(),
        correlation_id: self.instance.correlation_id.clone(),
        retry_count: self.instance.retry_count,
      },
    }]
  }

  /// Route an inbound outcome event.
  pub(crate) fn apply(&mut self, event: &SagaEvent, now: DateTime<Utc>) -> Outcome {
    match event {
      SagaEvent::StepCompleted(e) => self.on_step_completed(e, now),
      SagaEvent::StepFailed(e) => self.on_step_failed(e, now),
      SagaEvent::CompensationCompleted(e) => self.on_compensation_completed(e, now),
      SagaEvent::CompensationFailed(e) => self.on_compensation_failed(e, now),
    }
  }

  fn on_step_completed(&mut self, event: &StepCompleted, now: DateTime<Utc>) -> Outcome {
    if let Some(reason) = self.stale_step_outcome(event.step_index) {
      return Outcome::Ignored(reason);
    }

    let index = self.instance.current_step_index;
    self.instance.completed_steps.push(CompletedStep {
      step_index: index,
      completed_at: now,
      result: event.result.clone(),
    });
    self.merge_result(index, &event.result);
    self.instance.current_step_index += 1;
    self.instance.retry_count = 0;
    self.instance.awaiting = Awaiting::Nothing;
    self.instance.last_activity = now;

    Outcome::Applied(self.execute_next_step(now))
  }

  fn on_step_failed(&mut self, event: &StepFailed, now: DateTime<Utc>) -> Outcome {
    if let Some(reason) = self.stale_step_outcome(event.step_index) {
      return Outcome::Ignored(reason);
    }

    let index = self.instance.current_step_index;
    let retries = self.instance.retry_count;
    if let Some(reported) = event.retry_count
      && reported != retries
    {
      debug!(
        saga_id = %self.instance.id,
        step_index = index,
        reported,
        tracked = retries,
        "handler reported a different retry count"
      );
    }

    self.instance.failed_steps.push(FailedStep {
      step_index: index,
      failed_at: now,
      error: event.error.clone(),
      retry_count: retries,
    });
    self.instance.last_activity = now;

    let policy = self.definition.retry_policy();
    if policy.allows_retry(retries) {
      let attempt = retries + 1;
      self.instance.retry_count = attempt;
      self.instance.awaiting = Awaiting::RetryBackoff;
      return Outcome::Applied(vec![Effect::ScheduleRetry {
        step_index: index,
        attempt,
        delay: policy.delay_for(attempt),
      }]);
    }

    let step_name = self
      .definition
      .step(index)
      .map(|s| s.name.clone())
      .unwrap_or_default();
    let reason = FailureReason::StepExhausted {
      step_index: index,
      step_name,
      retries,
      error: event.error.clone(),
    };
    Outcome::Applied(self.begin_compensation(reason, now))
  }

  /// A retry backoff elapsed.
  pub(crate) fn on_retry_due(
    &mut self,
    step_index: usize,
    attempt: u32,
    now: DateTime<Utc>,
  ) -> Outcome {
    let instance = &self.instance;
    if instance.status != SagaStatus::Running
      || instance.awaiting != Awaiting::RetryBackoff
      || instance.current_step_index != step_index
      || instance.retry_count != attempt
    {
      return Outcome::Ignored("stale retry timer");
    }
    Outcome::Applied(self.execute_next_step(now))
  }

  /// The saga deadline elapsed.
  pub(crate) fn on_timeout(&mut self, now: DateTime<Utc>) -> Outcome {
    if self.instance.status != SagaStatus::Running {
      return Outcome::Ignored("saga is no longer running");
    }
    let timeout_ms = u64::try_from(self.definition.timeout().as_millis()).unwrap_or(u64::MAX);
    let reason = FailureReason::Timeout {
      timeout_ms,
      step_index: self.instance.current_step_index,
    };
    Outcome::Applied(self.begin_compensation(reason, now))
  }

  /// Why a step outcome must be dropped, if it must.
  ///
  /// Outcomes are accepted only while a request for the current step is
  /// outstanding, and only for the current index when the handler echoes one.
  fn stale_step_outcome(&self, step_index: Option<usize>) -> Option<&'static str> {
    if self.instance.status != SagaStatus::Running {
      return Some("saga is not running");
    }
    if self.instance.awaiting != Awaiting::StepOutcome {
      return Some("no step outcome outstanding");
    }
    match step_index {
      Some(index) if index != self.instance.current_step_index => {
        Some("outcome for a step other than the current one")
      }
      _ => None,
    }
  }

  /// Object results merge key by key; other non-null results are stored under
  /// the step's name.
  fn merge_result(&mut self, index: usize, result: &serde_json::Value) {
    match result {
      serde_json::Value::Object(map) => {
        for (key, value) in map {
          self.instance.data.insert(key.clone(), value.clone());
        }
      }
      serde_json::Value::Null => {}
      other => {
        let key = self
          .definition
          .step(index)
          .map(|s| s.name.clone())
          .unwrap_or_else(|| index.to_string());
        self.instance.data.insert(key, other.clone());
      }
    }
  }

  fn complete(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
    self.instance.status = SagaStatus::Completed;
    self.instance.awaiting = Awaiting::Nothing;
    self.instance.last_activity = now;
    self.instance.end_time = Some(now);

    vec![
      Effect::AnnounceCompleted(SagaCompleted {
        saga_id: self.instance.id.clone(),
        name: self.definition.name().to_string(),
        result: self.instance.data.clone(),
        duration: self.instance.duration_ms(now),
        correlation_id: self.instance.correlation_id.clone(),
      }),
      Effect::Finished,
    ]
  }
}
