//! Orchestrator error types.
//!
//! Only synchronous, caller-facing failures live here. Step failures,
//! timeouts, and compensation failures are saga state transitions, not
//! errors; see `FailureReason` and `CompensationFailure`.

use sagaflow_bus::BusError;
use sagaflow_store::LogError;
use sagaflow_workflow::{DefinitionError, NotFoundError};

/// Errors returned to callers of the orchestrator API.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
  /// A definition was rejected at registration.
  #[error(transparent)]
  Definition(#[from] DefinitionError),

  /// A saga name is not registered.
  #[error(transparent)]
  NotFound(#[from] NotFoundError),

  /// An inbound bus message could not be decoded.
  #[error(transparent)]
  Bus(#[from] BusError),

  /// The transition log could not be read.
  #[error(transparent)]
  Log(#[from] LogError),

  /// The engine task has stopped.
  #[error("saga engine is not running")]
  Closed,
}
