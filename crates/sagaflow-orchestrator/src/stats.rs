use serde::Serialize;

/// Point-in-time counts of the engine's sagas.
///
/// `active_sagas` includes COMPENSATION_FAILED sagas still awaiting an
/// operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
  pub active_sagas: usize,
  pub running: usize,
  pub compensating: usize,
  pub compensation_failed: usize,
  pub defined_sagas: usize,
}
