use serde::{Deserialize, Serialize};

/// Retry policy for the steps of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicyDef {
  /// Retries allowed per step after the first attempt.
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Delay before the first retry; doubled for each further retry.
  #[serde(default = "default_backoff_base_ms")]
  pub backoff_base_ms: u64,
}

fn default_max_retries() -> u32 {
  3
}

fn default_backoff_base_ms() -> u64 {
  1000
}

impl Default for RetryPolicyDef {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
      backoff_base_ms: default_backoff_base_ms(),
    }
  }
}
