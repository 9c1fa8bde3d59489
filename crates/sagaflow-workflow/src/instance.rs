//! Saga instance data model.
//!
//! A [`SagaInstance`] is a plain snapshot: the orchestrator mutates it, the
//! log persists it, and queries hand out clones of it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one saga execution.
pub type SagaId = String;

/// Lifecycle state of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
  Running,
  Compensating,
  Completed,
  Failed,
  CompensationFailed,
}

impl SagaStatus {
  /// Terminal states never transition again automatically.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      SagaStatus::Completed | SagaStatus::Failed | SagaStatus::CompensationFailed
    )
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      SagaStatus::Running => "running",
      SagaStatus::Compensating => "compensating",
      SagaStatus::Completed => "completed",
      SagaStatus::Failed => "failed",
      SagaStatus::CompensationFailed => "compensation_failed",
    }
  }
}

impl fmt::Display for SagaStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The outcome an instance is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Awaiting {
  #[default]
  Nothing,
  /// A step request is outstanding for `current_step_index`.
  StepOutcome,
  /// The current step failed and a retry timer is armed.
  RetryBackoff,
  /// A compensation request is outstanding for the head of the queue.
  CompensationOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
  pub step_index: usize,
  pub completed_at: DateTime<Utc>,
  pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedStep {
  pub step_index: usize,
  pub failed_at: DateTime<Utc>,
  pub error: String,
  /// Retries already issued for the step when this failure was reported.
  pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensatedStep {
  pub step_index: usize,
  pub compensated_at: DateTime<Utc>,
  pub result: serde_json::Value,
}

/// Why a saga left the forward path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
  /// A step kept failing after every retry was spent.
  #[error("step '{step_name}' (index {step_index}) failed after {retries} retries: {error}")]
  StepExhausted {
    step_index: usize,
    step_name: String,
    retries: u32,
    error: String,
  },

  /// The saga deadline elapsed while it was still running.
  #[error("saga timed out after {timeout_ms}ms at step {step_index}")]
  Timeout { timeout_ms: u64, step_index: usize },
}

/// A compensation handler reported failure. Needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("compensation '{compensation_name}' for step {step_index} failed: {error}")]
pub struct CompensationFailure {
  pub step_index: usize,
  pub compensation_name: String,
  pub error: String,
}

/// One execution of a registered saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
  pub id: SagaId,
  pub definition_name: String,
  pub status: SagaStatus,
  pub current_step_index: usize,
  /// Initial payload merged with every successful step result.
  pub data: serde_json::Map<String, serde_json::Value>,
  pub completed_steps: Vec<CompletedStep>,
  pub failed_steps: Vec<FailedStep>,
  pub compensated_steps: Vec<CompensatedStep>,
  pub correlation_id: String,
  pub start_time: DateTime<Utc>,
  pub last_activity: DateTime<Utc>,
  pub end_time: Option<DateTime<Utc>>,
  /// Retries issued so far for `current_step_index`.
  pub retry_count: u32,
  pub awaiting: Awaiting,
  /// Step indices still to compensate, head first.
  pub compensation_queue: Vec<usize>,
  pub failure_reason: Option<FailureReason>,
  pub compensation_error: Option<CompensationFailure>,
}

impl SagaInstance {
  /// A fresh RUNNING instance positioned at step 0.
  ///
  /// The correlation id defaults to the saga id.
  pub fn new(
    id: SagaId,
    definition_name: impl Into<String>,
    data: serde_json::Map<String, serde_json::Value>,
    correlation_id: Option<String>,
    now: DateTime<Utc>,
  ) -> Self {
    let correlation_id = correlation_id.unwrap_or_else(|| id.clone());
    Self {
      id,
      definition_name: definition_name.into(),
      status: SagaStatus::Running,
      current_step_index: 0,
      data,
      completed_steps: Vec::new(),
      failed_steps: Vec::new(),
      compensated_steps: Vec::new(),
      correlation_id,
      start_time: now,
      last_activity: now,
      end_time: None,
      retry_count: 0,
      awaiting: Awaiting::Nothing,
      compensation_queue: Vec::new(),
      failure_reason: None,
      compensation_error: None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal()
  }

  /// The result recorded when `step_index` completed.
  pub fn completed_result(&self, step_index: usize) -> Option<&serde_json::Value> {
    self
      .completed_steps
      .iter()
      .find(|c| c.step_index == step_index)
      .map(|c| &c.result)
  }

  /// Milliseconds from start to `end_time`, or to `now` if still active.
  pub fn duration_ms(&self, now: DateTime<Utc>) -> u64 {
    let end = self.end_time.unwrap_or(now);
    u64::try_from((end - self.start_time).num_milliseconds()).unwrap_or(0)
  }
}
