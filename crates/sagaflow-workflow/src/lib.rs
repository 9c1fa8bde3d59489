//! Sagaflow Workflow
//!
//! This crate provides the validated ("registered") saga representation for
//! sagaflow, the catalog that holds registered sagas, and the data model of a
//! running saga instance.
//!
//! Key differences from `sagaflow-config`:
//! - Step/compensation lists are guaranteed to line up
//! - Every step and compensation has a name and a routable action
//! - Definitions are immutable once registered and shared via `Arc`

mod catalog;
mod definition;
mod error;
mod instance;
mod retry;

pub use catalog::Catalog;
pub use definition::{Compensation, Step, WorkflowDefinition};
pub use error::{DefinitionError, NotFoundError};
pub use instance::{
  Awaiting, CompensatedStep, CompensationFailure, CompletedStep, FailedStep, FailureReason,
  SagaId, SagaInstance, SagaStatus,
};
pub use retry::RetryPolicy;
