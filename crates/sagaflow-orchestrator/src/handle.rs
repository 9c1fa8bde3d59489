//! Caller-facing API of a running engine.

use std::sync::Arc;

use sagaflow_bus::{BusError, BusMessage, SagaEvent};
use sagaflow_config::SagaDef;
use sagaflow_workflow::{Catalog, SagaId, SagaInstance, WorkflowDefinition};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::StartOptions;
use crate::engine::Command;
use crate::error::SagaError;
use crate::stats::Statistics;

/// Cloneable handle to a [`crate::SagaEngine`].
///
/// Definitions are read and written directly on the shared catalog; anything
/// touching saga instances goes through the engine's command channel.
#[derive(Clone)]
pub struct SagaHandle {
  catalog: Arc<Catalog>,
  sender: mpsc::Sender<Command>,
}

impl SagaHandle {
  pub(crate) fn new(catalog: Arc<Catalog>, sender: mpsc::Sender<Command>) -> Self {
    Self { catalog, sender }
  }

  /// Validate and register a saga, replacing any definition of the same name.
  ///
  /// A rejected definition leaves the catalog untouched.
  pub fn define_saga(&self, def: SagaDef) -> Result<Arc<WorkflowDefinition>, SagaError> {
    let definition = self.catalog.define(def)?;
    info!(
      definition = %definition.name(),
      steps = definition.steps().len(),
      "saga_defined"
    );
    Ok(definition)
  }

  pub fn get_workflow(&self, name: &str) -> Result<Arc<WorkflowDefinition>, SagaError> {
    Ok(self.catalog.get(name)?)
  }

  /// Start a new saga and return its id.
  ///
  /// Returns once the instance is registered and its first step requested;
  /// it never waits on a handler.
  #[instrument(
    name = "start_saga",
    skip(self, name, initial_data, options),
    fields(definition = %name)
  )]
  pub async fn start_saga(
    &self,
    name: &str,
    initial_data: serde_json::Map<String, serde_json::Value>,
    options: StartOptions,
  ) -> Result<SagaId, SagaError> {
    let definition = self.catalog.get(name)?;
    let saga_id = uuid::Uuid::new_v4().to_string();

    self
      .request(|reply| Command::Start {
        saga_id: saga_id.clone(),
        definition,
        data: initial_data,
        correlation_id: options.correlation_id,
        reply,
      })
      .await?;
    Ok(saga_id)
  }

  /// Feed an outcome event to the engine.
  pub async fn handle_saga_event(&self, event: SagaEvent) -> Result<(), SagaError> {
    self
      .sender
      .send(Command::Event(event))
      .await
      .map_err(|_| SagaError::Closed)
  }

  /// Decode and feed a raw bus message.
  ///
  /// Returns `false` for topics the engine does not consume, such as its own
  /// requests and announcements.
  pub async fn handle_message(&self, message: &BusMessage) -> Result<bool, SagaError> {
    match SagaEvent::from_message(message)? {
      Some(event) => {
        self.handle_saga_event(event).await?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Snapshot of an active or operator-retained saga.
  pub async fn get_saga_status(&self, saga_id: &str) -> Result<Option<SagaInstance>, SagaError> {
    self
      .request(|reply| Command::Status {
        saga_id: saga_id.to_string(),
        reply,
      })
      .await
  }

  /// Snapshots of every saga the engine holds, oldest first.
  pub async fn get_active_sagas(&self) -> Result<Vec<SagaInstance>, SagaError> {
    self.request(|reply| Command::Active { reply }).await
  }

  pub async fn get_statistics(&self) -> Result<Statistics, SagaError> {
    self.request(|reply| Command::Statistics { reply }).await
  }

  /// Release a COMPENSATION_FAILED saga after manual remediation.
  ///
  /// Returns the evicted instance, or `None` if no such saga is waiting.
  pub async fn acknowledge_compensation_failure(
    &self,
    saga_id: &str,
  ) -> Result<Option<SagaInstance>, SagaError> {
    self
      .request(|reply| Command::Acknowledge {
        saga_id: saga_id.to_string(),
        reply,
      })
      .await
  }

  /// Forward outcome events from a broadcast subscription until `cancel`
  /// fires or the bus closes.
  pub fn listen(
    &self,
    mut messages: broadcast::Receiver<BusMessage>,
    cancel: CancellationToken,
  ) -> JoinHandle<()> {
    let handle = self.clone();
    tokio::spawn(async move {
      loop {
        let message = tokio::select! {
          _ = cancel.cancelled() => break,
          message = messages.recv() => message,
        };

        match message {
          Ok(message) => match handle.handle_message(&message).await {
            Ok(_) => {}
            Err(SagaError::Closed) => break,
            Err(SagaError::Bus(e @ BusError::Decode { .. })) => {
              warn!(error = %e, "dropping malformed outcome event");
            }
            Err(e) => warn!(error = %e, "failed to forward bus message"),
          },
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "bus listener lagged; events lost");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
      debug!("bus listener stopped");
    })
  }

  async fn request<T>(
    &self,
    command: impl FnOnce(oneshot::Sender<T>) -> Command,
  ) -> Result<T, SagaError> {
    let (reply, response) = oneshot::channel();
    self
      .sender
      .send(command(reply))
      .await
      .map_err(|_| SagaError::Closed)?;
    response.await.map_err(|_| SagaError::Closed)
  }
}
