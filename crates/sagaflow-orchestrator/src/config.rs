/// Configuration for the saga engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Capacity of the engine's command channel.
  pub inbox_capacity: usize,
  /// Drop `saga:step:completed` / `saga:step:failed` events that do not echo
  /// `stepIndex`. Without the index a redelivered outcome cannot be told apart
  /// from the outcome of the step that followed it.
  pub require_step_index: bool,
  /// Remove COMPLETED and FAILED sagas from the log as they finish.
  pub forget_finished: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      inbox_capacity: 1024,
      require_step_index: false,
      forget_finished: false,
    }
  }
}

/// Per-start options.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
  /// Threaded through every event of the saga. Defaults to the saga id.
  pub correlation_id: Option<String>,
}

impl StartOptions {
  pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
    Self {
      correlation_id: Some(correlation_id.into()),
    }
  }
}
