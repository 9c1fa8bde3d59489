use thiserror::Error;

/// A saga definition that cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
  #[error("saga name must not be empty")]
  EmptyName,

  #[error("saga '{saga}' has no steps")]
  NoSteps { saga: String },

  #[error("saga '{saga}' has {steps} steps but {compensations} compensations")]
  CompensationCountMismatch {
    saga: String,
    steps: usize,
    compensations: usize,
  },

  #[error("saga '{saga}': step {index} has an empty name")]
  MissingStepName { saga: String, index: usize },

  #[error("saga '{saga}': step {index} has an empty action")]
  MissingStepAction { saga: String, index: usize },

  #[error("saga '{saga}': compensation {index} has an empty name")]
  MissingCompensationName { saga: String, index: usize },

  #[error("saga '{saga}': compensation {index} has an empty action")]
  MissingCompensationAction { saga: String, index: usize },

  #[error("saga '{saga}': action '{action}' is reserved for outcome events")]
  ReservedAction { saga: String, action: String },

  #[error("saga '{saga}' must have a non-zero timeout")]
  ZeroTimeout { saga: String },

  #[error("saga '{0}' is defined more than once in the catalog")]
  Duplicate(String),
}

/// A lookup for a saga name that was never registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("saga not found: {0}")]
pub struct NotFoundError(pub String);
