//! Sagaflow Store
//!
//! This crate provides the write-ahead transition log for saga instances.
//! The orchestrator appends a full snapshot of an instance after every state
//! transition, before acting on it, so a restarted process can rebuild the
//! sagas that were still in flight.
//!
//! The [`SagaLog`] trait defines operations for:
//! - Appending instance snapshots
//! - Loading the latest snapshot of every unfinished saga
//! - Reading the transition history of one saga
//! - Forgetting sagas and pruning finished ones

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryLog;
pub use sqlite::SqliteLog;
pub use types::LogEntry;

use async_trait::async_trait;
use sagaflow_workflow::SagaInstance;

/// Error type for log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// A snapshot could not be encoded or decoded.
  #[error("invalid saga snapshot: {0}")]
  Snapshot(#[from] serde_json::Error),
}

/// Append-only log of saga instance snapshots.
#[async_trait]
pub trait SagaLog: Send + Sync {
  /// Record the current state of `instance`.
  async fn append(&self, instance: &SagaInstance) -> Result<(), LogError>;

  /// Latest snapshot of every saga whose last recorded status is RUNNING,
  /// COMPENSATING, or COMPENSATION_FAILED, oldest first.
  async fn load_unfinished(&self) -> Result<Vec<SagaInstance>, LogError>;

  /// Every recorded snapshot of one saga, in append order.
  async fn history(&self, saga_id: &str) -> Result<Vec<LogEntry>, LogError>;

  /// Drop every entry of one saga.
  async fn forget(&self, saga_id: &str) -> Result<(), LogError>;

  /// Drop every entry of sagas that reached COMPLETED or FAILED.
  ///
  /// Returns the number of entries removed.
  async fn prune_finished(&self) -> Result<u64, LogError>;
}
