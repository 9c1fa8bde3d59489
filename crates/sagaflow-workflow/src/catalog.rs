//! Registry of saga definitions.
//!
//! The catalog is read on every saga start and written rarely (startup and
//! ad hoc registrations), so a single coarse `RwLock` guards it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use sagaflow_config::{CatalogDef, SagaDef};

use crate::definition::WorkflowDefinition;
use crate::error::{DefinitionError, NotFoundError};

/// Named, validated saga definitions.
#[derive(Debug, Default)]
pub struct Catalog {
  definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl Catalog {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build a catalog from a catalog file.
  ///
  /// All-or-nothing: every definition is validated and names must be unique
  /// before anything is registered.
  pub fn from_def(def: CatalogDef) -> Result<Self, DefinitionError> {
    let mut seen = HashSet::new();
    let mut definitions = HashMap::with_capacity(def.sagas.len());

    for saga in def.sagas {
      if !seen.insert(saga.name.clone()) {
        return Err(DefinitionError::Duplicate(saga.name));
      }
      let definition = WorkflowDefinition::from_def(saga)?;
      definitions.insert(definition.name().to_string(), Arc::new(definition));
    }

    Ok(Self {
      definitions: RwLock::new(definitions),
    })
  }

  /// Validate and register a saga, replacing any definition with the same name.
  ///
  /// On error the catalog is left untouched.
  pub fn define(&self, def: SagaDef) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
    let definition = Arc::new(WorkflowDefinition::from_def(def)?);
    let mut definitions = self
      .definitions
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    definitions.insert(definition.name().to_string(), definition.clone());
    Ok(definition)
  }

  /// Look up a registered saga.
  pub fn get(&self, name: &str) -> Result<Arc<WorkflowDefinition>, NotFoundError> {
    self
      .definitions
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .cloned()
      .ok_or_else(|| NotFoundError(name.to_string()))
  }

  /// Registered names, sorted.
  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .definitions
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect();
    names.sort();
    names
  }

  pub fn len(&self) -> usize {
    self
      .definitions
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
