use chrono::{DateTime, Utc};
use sagaflow_workflow::{SagaInstance, SagaStatus};

/// One recorded transition.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
  /// Position in the log; strictly increasing.
  pub sequence: i64,
  pub saga_id: String,
  pub status: SagaStatus,
  pub recorded_at: DateTime<Utc>,
  pub snapshot: SagaInstance,
}

/// Statuses whose latest snapshot makes a saga eligible for recovery.
pub(crate) fn is_unfinished(status: SagaStatus) -> bool {
  matches!(
    status,
    SagaStatus::Running | SagaStatus::Compensating | SagaStatus::CompensationFailed
  )
}
