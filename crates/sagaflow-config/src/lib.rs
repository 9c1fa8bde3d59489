//! Sagaflow Config
//!
//! This crate contains the serializable saga configuration types for sagaflow.
//! These types represent workflow definitions before they are validated and
//! registered in the catalog.
//!
//! Configuration can be loaded from:
//! - JSON catalog files (via CLI with `sagaflow run catalog.json`)
//! - Inline definitions built in code
//!
//! The orchestrator takes these configuration types, validates them, and
//! turns them into immutable `WorkflowDefinition`s for execution.

mod catalog;
mod retry;
mod saga;
mod step;

pub use catalog::CatalogDef;
pub use retry::RetryPolicyDef;
pub use saga::SagaDef;
pub use step::{CompensationDef, StepDef};
