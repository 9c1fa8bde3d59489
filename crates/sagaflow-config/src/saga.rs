use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicyDef;
use crate::step::{CompensationDef, StepDef};

/// A saga definition as written in a catalog file.
///
/// `compensations` is positional: entry `i` undoes `steps[i]`, and `null`
/// means the step needs no undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDef {
  pub name: String,
  pub steps: Vec<StepDef>,
  pub compensations: Vec<Option<CompensationDef>>,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  #[serde(default)]
  pub retry_policy: RetryPolicyDef,
}

fn default_timeout_ms() -> u64 {
  300_000
}

impl SagaDef {
  /// Create a definition with default timeout and retry policy.
  pub fn new(
    name: impl Into<String>,
    steps: Vec<StepDef>,
    compensations: Vec<Option<CompensationDef>>,
  ) -> Self {
    Self {
      name: name.into(),
      steps,
      compensations,
      timeout_ms: default_timeout_ms(),
      retry_policy: RetryPolicyDef::default(),
    }
  }

  pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
    self.timeout_ms = timeout_ms;
    self
  }

  pub fn with_retry_policy(mut self, max_retries: u32, backoff_base_ms: u64) -> Self {
    self.retry_policy = RetryPolicyDef {
      max_retries,
      backoff_base_ms,
    };
    self
  }
}
