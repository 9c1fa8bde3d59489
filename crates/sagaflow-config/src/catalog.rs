use serde::{Deserialize, Serialize};

use crate::saga::SagaDef;

/// A catalog file: every saga definition an orchestrator loads at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDef {
  pub sagas: Vec<SagaDef>,
}

impl CatalogDef {
  /// Parse a catalog from JSON text.
  pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(content)
  }
}
