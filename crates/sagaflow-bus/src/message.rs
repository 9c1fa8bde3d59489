use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Logical event names.
pub mod topics {
  pub const STEP_COMPLETED: &str = "saga:step:completed";
  pub const STEP_FAILED: &str = "saga:step:failed";
  pub const COMPENSATION_COMPLETED: &str = "saga:compensation:completed";
  pub const COMPENSATION_FAILED: &str = "saga:compensation:failed";
  pub const SAGA_COMPLETED: &str = "saga:completed";
  pub const SAGA_FAILED: &str = "saga:failed";

  const STEP_PREFIX: &str = "saga:step:";
  const COMPENSATION_PREFIX: &str = "saga:compensation:";

  /// Topic on which requests for a step's `action` are published.
  pub fn step_request(action: &str) -> String {
    format!("{STEP_PREFIX}{action}")
  }

  /// Topic on which requests for a compensation's `action` are published.
  pub fn compensation_request(action: &str) -> String {
    format!("{COMPENSATION_PREFIX}{action}")
  }

  /// The action of a step request topic, if `topic` is one.
  pub fn step_action(topic: &str) -> Option<&str> {
    match topic {
      STEP_COMPLETED | STEP_FAILED => None,
      _ => topic.strip_prefix(STEP_PREFIX),
    }
  }

  /// The action of a compensation request topic, if `topic` is one.
  pub fn compensation_action(topic: &str) -> Option<&str> {
    match topic {
      COMPENSATION_COMPLETED | COMPENSATION_FAILED => None,
      _ => topic.strip_prefix(COMPENSATION_PREFIX),
    }
  }
}

/// A message on the bus: topic plus JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
  pub topic: String,
  pub payload: serde_json::Value,
}

impl BusMessage {
  /// Serialize `payload` under `topic`.
  pub fn encode(topic: impl Into<String>, payload: &impl Serialize) -> Result<Self, BusError> {
    let topic = topic.into();
    let payload = serde_json::to_value(payload).map_err(|source| BusError::Encode {
      topic: topic.clone(),
      source,
    })?;
    Ok(Self { topic, payload })
  }

  /// Deserialize the payload into `T`.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
    T::deserialize(&self.payload).map_err(|source| BusError::Decode {
      topic: self.topic.clone(),
      source,
    })
  }
}
