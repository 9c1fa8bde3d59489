use std::time::Duration;

use sagaflow_config::{CompensationDef, SagaDef, StepDef};

use crate::error::DefinitionError;
use crate::retry::RetryPolicy;

/// Actions that would make `saga:step:<action>` collide with an outcome topic.
const RESERVED_ACTIONS: [&str; 2] = ["completed", "failed"];

/// A validated forward step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
  pub name: String,
  pub action: String,
  pub data: serde_json::Map<String, serde_json::Value>,
}

/// A validated compensation.
#[derive(Debug, Clone, PartialEq)]
pub struct Compensation {
  pub name: String,
  pub action: String,
  pub data: serde_json::Map<String, serde_json::Value>,
}

/// A registered saga workflow.
///
/// Can only be built through [`WorkflowDefinition::from_def`], so every value
/// upholds `compensations().len() == steps().len()` and non-empty
/// names/actions.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
  name: String,
  steps: Vec<Step>,
  compensations: Vec<Option<Compensation>>,
  timeout: Duration,
  retry_policy: RetryPolicy,
}

impl WorkflowDefinition {
  /// Validate a configuration and build the registered form.
  pub fn from_def(def: SagaDef) -> Result<Self, DefinitionError> {
    validate(&def)?;

    let SagaDef {
      name,
      steps,
      compensations,
      timeout_ms,
      retry_policy,
    } = def;

    Ok(Self {
      name,
      steps: steps.into_iter().map(Step::from).collect(),
      compensations: compensations
        .into_iter()
        .map(|c| c.map(Compensation::from))
        .collect(),
      timeout: Duration::from_millis(timeout_ms),
      retry_policy: retry_policy.into(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn steps(&self) -> &[Step] {
    &self.steps
  }

  pub fn step(&self, index: usize) -> Option<&Step> {
    self.steps.get(index)
  }

  pub fn compensations(&self) -> &[Option<Compensation>] {
    &self.compensations
  }

  /// The compensation paired with step `index`, if it has one.
  pub fn compensation(&self, index: usize) -> Option<&Compensation> {
    self.compensations.get(index).and_then(Option::as_ref)
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.retry_policy
  }
}

fn validate(def: &SagaDef) -> Result<(), DefinitionError> {
  let saga = || def.name.clone();

  if def.name.trim().is_empty() {
    return Err(DefinitionError::EmptyName);
  }
  if def.steps.is_empty() {
    return Err(DefinitionError::NoSteps { saga: saga() });
  }
  if def.compensations.len() != def.steps.len() {
    return Err(DefinitionError::CompensationCountMismatch {
      saga: saga(),
      steps: def.steps.len(),
      compensations: def.compensations.len(),
    });
  }
  if def.timeout_ms == 0 {
    return Err(DefinitionError::ZeroTimeout { saga: saga() });
  }

  for (index, step) in def.steps.iter().enumerate() {
    if step.name.trim().is_empty() {
      return Err(DefinitionError::MissingStepName {
        saga: saga(),
        index,
      });
    }
    if step.action.trim().is_empty() {
      return Err(DefinitionError::MissingStepAction {
        saga: saga(),
        index,
      });
    }
    check_reserved(&def.name, &step.action)?;
  }

  for (index, comp) in def.compensations.iter().enumerate() {
    let Some(comp) = comp else { continue };
    if comp.name.trim().is_empty() {
      return Err(DefinitionError::MissingCompensationName {
        saga: saga(),
        index,
      });
    }
    if comp.action.trim().is_empty() {
      return Err(DefinitionError::MissingCompensationAction {
        saga: saga(),
        index,
      });
    }
    check_reserved(&def.name, &comp.action)?;
  }

  Ok(())
}

fn check_reserved(saga: &str, action: &str) -> Result<(), DefinitionError> {
  if RESERVED_ACTIONS.contains(&action) {
    return Err(DefinitionError::ReservedAction {
      saga: saga.to_string(),
      action: action.to_string(),
    });
  }
  Ok(())
}

impl From<StepDef> for Step {
  fn from(def: StepDef) -> Self {
    Self {
      name: def.name,
      action: def.action,
      data: def.data,
    }
  }
}

impl From<CompensationDef> for Compensation {
  fn from(def: CompensationDef) -> Self {
    Self {
      name: def.name,
      action: def.action,
      data: def.data,
    }
  }
}
