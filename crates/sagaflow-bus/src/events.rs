//! Event payloads.
//!
//! Requests flow from the orchestrator to handlers, outcomes flow back, and
//! saga-level announcements go to any observer.

use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::message::{BusMessage, topics};

type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Published on `saga:step:<action>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
  pub saga_id: String,
  pub step_index: usize,
  pub step_data: JsonMap,
  pub saga_data: JsonMap,
  pub correlation_id: String,
  /// Retries already issued for this step; 0 on the first attempt.
  pub retry_count: u32,
}

/// Published by a handler on `saga:step:completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCompleted {
  pub saga_id: String,
  #[serde(default)]
  pub result: serde_json::Value,
  /// Echo of the request's `stepIndex`; used to drop duplicate deliveries.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub step_index: Option<usize>,
}

/// Published by a handler on `saga:step:failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailed {
  pub saga_id: String,
  pub error: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry_count: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub step_index: Option<usize>,
}

/// Published on `saga:compensation:<action>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationRequest {
  pub saga_id: String,
  pub step_index: usize,
  pub original_result: serde_json::Value,
  pub compensation_data: JsonMap,
  pub saga_data: JsonMap,
  pub correlation_id: String,
}

/// Published by a handler on `saga:compensation:completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationCompleted {
  pub saga_id: String,
  pub step_index: usize,
  #[serde(default)]
  pub result: serde_json::Value,
}

/// Published by a handler on `saga:compensation:failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationFailed {
  pub saga_id: String,
  pub step_index: usize,
  pub error: String,
}

/// Announced on `saga:completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaCompleted {
  pub saga_id: String,
  pub name: String,
  pub result: JsonMap,
  /// Milliseconds from start to completion.
  pub duration: u64,
  pub correlation_id: String,
}

/// Announced on `saga:failed`, for both FAILED and COMPENSATION_FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaFailed {
  pub saga_id: String,
  pub name: String,
  pub failure_reason: Option<String>,
  pub duration: u64,
  pub correlation_id: String,
  /// `failed` or `compensation_failed`.
  pub status: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub compensation_error: Option<String>,
}

/// An inbound outcome event, routed to the saga named by `saga_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaEvent {
  StepCompleted(StepCompleted),
  StepFailed(StepFailed),
  CompensationCompleted(CompensationCompleted),
  CompensationFailed(CompensationFailed),
}

impl SagaEvent {
  pub fn saga_id(&self) -> &str {
    match self {
      SagaEvent::StepCompleted(e) => &e.saga_id,
      SagaEvent::StepFailed(e) => &e.saga_id,
      SagaEvent::CompensationCompleted(e) => &e.saga_id,
      SagaEvent::CompensationFailed(e) => &e.saga_id,
    }
  }

  pub fn topic(&self) -> &'static str {
    match self {
      SagaEvent::StepCompleted(_) => topics::STEP_COMPLETED,
      SagaEvent::StepFailed(_) => topics::STEP_FAILED,
      SagaEvent::CompensationCompleted(_) => topics::COMPENSATION_COMPLETED,
      SagaEvent::CompensationFailed(_) => topics::COMPENSATION_FAILED,
    }
  }

  /// A step outcome that does not say which step it answers.
  pub fn is_unindexed_step_outcome(&self) -> bool {
    match self {
      SagaEvent::StepCompleted(e) => e.step_index.is_none(),
      SagaEvent::StepFailed(e) => e.step_index.is_none(),
      _ => false,
    }
  }

  /// Parse an outcome event.
  ///
  /// Returns `Ok(None)` for topics that are not inbound outcomes.
  pub fn from_message(message: &BusMessage) -> Result<Option<Self>, BusError> {
    let event = match message.topic.as_str() {
      topics::STEP_COMPLETED => SagaEvent::StepCompleted(message.decode()?),
      topics::STEP_FAILED => SagaEvent::StepFailed(message.decode()?),
      topics::COMPENSATION_COMPLETED => SagaEvent::CompensationCompleted(message.decode()?),
      topics::COMPENSATION_FAILED => SagaEvent::CompensationFailed(message.decode()?),
      _ => return Ok(None),
    };
    Ok(Some(event))
  }

  /// Encode for publishing, as a handler would.
  pub fn to_message(&self) -> Result<BusMessage, BusError> {
    match self {
      SagaEvent::StepCompleted(e) => BusMessage::encode(self.topic(), e),
      SagaEvent::StepFailed(e) => BusMessage::encode(self.topic(), e),
      SagaEvent::CompensationCompleted(e) => BusMessage::encode(self.topic(), e),
      SagaEvent::CompensationFailed(e) => BusMessage::encode(self.topic(), e),
    }
  }
}
