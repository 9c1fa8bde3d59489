use serde::{Deserialize, Serialize};

/// A forward step of a saga.
///
/// `action` selects the handler: the orchestrator publishes requests for this
/// step on `saga:step:<action>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  pub name: String,
  pub action: String,
  /// Static data passed to the handler alongside the saga data.
  #[serde(default)]
  pub data: serde_json::Map<String, serde_json::Value>,
}

impl StepDef {
  pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      action: action.into(),
      data: serde_json::Map::new(),
    }
  }

  /// Attach static handler data.
  pub fn with_data(mut self, data: serde_json::Map<String, serde_json::Value>) -> Self {
    self.data = data;
    self
  }
}

/// The undo action paired with a step.
///
/// Requests are published on `saga:compensation:<action>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationDef {
  pub name: String,
  pub action: String,
  #[serde(default)]
  pub data: serde_json::Map<String, serde_json::Value>,
}

impl CompensationDef {
  pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      action: action.into(),
      data: serde_json::Map::new(),
    }
  }

  pub fn with_data(mut self, data: serde_json::Map<String, serde_json::Value>) -> Self {
    self.data = data;
    self
  }
}
