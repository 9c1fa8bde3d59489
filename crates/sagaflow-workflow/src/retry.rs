use std::time::Duration;

use sagaflow_config::RetryPolicyDef;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Exponential backoff policy applied to a failing step as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  max_retries: u32,
  backoff_base: Duration,
}

impl RetryPolicy {
  pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
    Self {
      max_retries,
      backoff_base,
    }
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  pub fn backoff_base(&self) -> Duration {
    self.backoff_base
  }

  /// Whether another retry may be issued after `retries_done` retries.
  pub fn allows_retry(&self, retries_done: u32) -> bool {
    retries_done < self.max_retries
  }

  /// Delay before retry `attempt` (1-indexed): `base * 2^(attempt - 1)`.
  ///
  /// Saturates to `Duration::MAX` once the product no longer fits.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    1u128
      .checked_shl(exponent)
      .and_then(|factor| self.backoff_base.as_nanos().checked_mul(factor))
      .and_then(|nanos| {
        let secs = u64::try_from(nanos / NANOS_PER_SEC).ok()?;
        Some(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
      })
      .unwrap_or(Duration::MAX)
  }
}

impl From<RetryPolicyDef> for RetryPolicy {
  fn from(def: RetryPolicyDef) -> Self {
    Self::new(def.max_retries, Duration::from_millis(def.backoff_base_ms))
  }
}
