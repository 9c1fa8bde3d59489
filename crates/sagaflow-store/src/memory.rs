use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sagaflow_workflow::{SagaInstance, SagaStatus};

use crate::types::{LogEntry, is_unfinished};
use crate::{LogError, SagaLog};

/// Process-local log. Survives nothing, but exercises the same contract.
///
/// Entries are only dropped by `forget` and `prune_finished`; a long-running
/// engine should set `forget_finished` or prune periodically.
#[derive(Debug, Default)]
pub struct MemoryLog {
  entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
  pub fn new() -> Self {
    Self::default()
  }

  /// Total number of entries currently held.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Latest entry per saga, in order of that entry's sequence.
fn latest_per_saga(entries: &[LogEntry]) -> Vec<&LogEntry> {
  let mut latest: HashMap<&str, &LogEntry> = HashMap::new();
  for entry in entries {
    latest.insert(&entry.saga_id, entry);
  }
  let mut latest: Vec<&LogEntry> = latest.into_values().collect();
  latest.sort_by_key(|e| e.sequence);
  latest
}

#[async_trait]
impl SagaLog for MemoryLog {
  async fn append(&self, instance: &SagaInstance) -> Result<(), LogError> {
    let mut entries = self.lock();
    let sequence = entries.last().map_or(1, |e| e.sequence + 1);
    entries.push(LogEntry {
      sequence,
      saga_id: instance.id.clone(),
      status: instance.status,
      recorded_at: instance.last_activity,
      snapshot: instance.clone(),
    });
    Ok(())
  }

  async fn load_unfinished(&self) -> Result<Vec<SagaInstance>, LogError> {
    let entries = self.lock();
    Ok(
      latest_per_saga(&entries)
        .into_iter()
        .filter(|e| is_unfinished(e.status))
        .map(|e| e.snapshot.clone())
        .collect(),
    )
  }

  async fn history(&self, saga_id: &str) -> Result<Vec<LogEntry>, LogError> {
    Ok(
      self
        .lock()
        .iter()
        .filter(|e| e.saga_id == saga_id)
        .cloned()
        .collect(),
    )
  }

  async fn forget(&self, saga_id: &str) -> Result<(), LogError> {
    self.lock().retain(|e| e.saga_id != saga_id);
    Ok(())
  }

  async fn prune_finished(&self) -> Result<u64, LogError> {
    let mut entries = self.lock();
    let finished: HashSet<String> = latest_per_saga(&entries)
      .into_iter()
      .filter(|e| matches!(e.status, SagaStatus::Completed | SagaStatus::Failed))
      .map(|e| e.saga_id.clone())
      .collect();

    let before = entries.len();
    entries.retain(|e| !finished.contains(&e.saga_id));
    Ok((before - entries.len()) as u64)
  }
}
