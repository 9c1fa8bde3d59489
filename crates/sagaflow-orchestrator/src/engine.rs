//! The saga engine task.
//!
//! `SagaEngine` owns every active saga and is the only code that mutates
//! them. Callers, timers, and the bus listener talk to it through a bounded
//! command channel; see [`crate::SagaHandle`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sagaflow_bus::{BusMessage, EventBus, SagaEvent, topics};
use sagaflow_store::SagaLog;
use sagaflow_workflow::{Catalog, SagaId, SagaInstance, SagaStatus, WorkflowDefinition};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::SagaError;
use crate::handle::SagaHandle;
use crate::saga::{Effect, Outcome, Saga};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::stats::Statistics;
use crate::timeout::TimeoutSupervisor;

/// Input to the engine task.
#[derive(Debug)]
pub(crate) enum Command {
  Start {
    saga_id: SagaId,
    definition: Arc<WorkflowDefinition>,
    data: serde_json::Map<String, serde_json::Value>,
    correlation_id: Option<String>,
    reply: oneshot::Sender<()>,
  },
  Event(SagaEvent),
  RetryDue {
    saga_id: SagaId,
    step_index: usize,
    attempt: u32,
  },
  TimeoutFired {
    saga_id: SagaId,
  },
  Status {
    saga_id: SagaId,
    reply: oneshot::Sender<Option<SagaInstance>>,
  },
  Active {
    reply: oneshot::Sender<Vec<SagaInstance>>,
  },
  Statistics {
    reply: oneshot::Sender<Statistics>,
  },
  Acknowledge {
    saga_id: SagaId,
    reply: oneshot::Sender<Option<SagaInstance>>,
  },
}

/// Single-writer saga orchestrator.
///
/// # Usage
///
/// ```ignore
/// let engine = SagaEngine::new(catalog, bus).with_log(log);
/// let handle = engine.handle();
///
/// let cancel = CancellationToken::new();
/// tokio::spawn(engine.start(cancel.clone()));
///
/// let saga_id = handle.start_saga("order", data, StartOptions::default()).await?;
/// ```
pub struct SagaEngine {
  catalog: Arc<Catalog>,
  bus: Arc<dyn EventBus>,
  log: Option<Arc<dyn SagaLog>>,
  clock: Arc<dyn Clock>,
  sender: mpsc::Sender<Command>,
  receiver: mpsc::Receiver<Command>,
  active: HashMap<SagaId, Saga>,
  /// COMPENSATION_FAILED sagas kept until an operator acknowledges them.
  stranded: HashMap<SagaId, SagaInstance>,
  supervisor: TimeoutSupervisor,
  require_step_index: bool,
  forget_finished: bool,
}

impl SagaEngine {
  pub fn new(catalog: Arc<Catalog>, bus: Arc<dyn EventBus>) -> Self {
    Self::with_config(catalog, bus, EngineConfig::default())
  }

  pub fn with_config(catalog: Arc<Catalog>, bus: Arc<dyn EventBus>, config: EngineConfig) -> Self {
    let (sender, receiver) = mpsc::channel(config.inbox_capacity.max(1));
    let supervisor = TimeoutSupervisor::new(Arc::new(TokioScheduler), sender.clone());
    Self {
      catalog,
      bus,
      log: None,
      clock: Arc::new(SystemClock),
      sender,
      receiver,
      active: HashMap::new(),
      stranded: HashMap::new(),
      supervisor,
      require_step_index: config.require_step_index,
      forget_finished: config.forget_finished,
    }
  }

  /// Record every transition to `log` before acting on it.
  pub fn with_log(mut self, log: Arc<dyn SagaLog>) -> Self {
    self.log = Some(log);
    self
  }

  pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
    self.supervisor = TimeoutSupervisor::new(scheduler, self.sender.clone());
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// A cloneable handle for callers. Valid for as long as the engine runs.
  pub fn handle(&self) -> SagaHandle {
    SagaHandle::new(self.catalog.clone(), self.sender.clone())
  }

  /// Rebuild unfinished sagas from the log.
  ///
  /// Running sagas get their deadline re-armed with whatever budget is left
  /// and their outstanding request published again. Returns the number of
  /// sagas restored.
  #[instrument(name = "engine_recover", skip(self))]
  pub async fn recover(&mut self) -> Result<usize, SagaError> {
    let Some(log) = self.log.clone() else {
      return Ok(0);
    };

    let now = self.clock.now();
    let mut restored = 0;
    for instance in log.load_unfinished().await? {
      let definition = match self.catalog.get(&instance.definition_name) {
        Ok(definition) => definition,
        Err(e) => {
          warn!(
            saga_id = %instance.id,
            definition = %instance.definition_name,
            error = %e,
            "skipping recovered saga with unknown definition"
          );
          continue;
        }
      };

      let id = instance.id.clone();
      restored += 1;

      if instance.status == SagaStatus::CompensationFailed {
        info!(saga_id = %id, "restored saga awaiting operator");
        self.stranded.insert(id, instance);
        continue;
      }

      if instance.status == SagaStatus::Running {
        let elapsed = (now - instance.start_time).to_std().unwrap_or_default();
        let remaining = definition.timeout().saturating_sub(elapsed);
        self.supervisor.arm_timeout(&id, remaining);
      }

      info!(
        saga_id = %id,
        definition = %instance.definition_name,
        status = %instance.status,
        step_index = instance.current_step_index,
        "saga_recovered"
      );

      let mut saga = Saga::new(instance, definition);
      let effects = saga.resume(now);
      self.active.insert(id.clone(), saga);
      self.commit(&id, effects).await;
    }

    Ok(restored)
  }

  /// Run the engine loop until `cancel` fires.
  pub async fn start(mut self, cancel: CancellationToken) -> Result<(), SagaError> {
    info!(
      active = self.active.len(),
      defined = self.catalog.len(),
      "starting saga engine"
    );

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("saga engine cancelled");
          break;
        }
        command = self.receiver.recv() => {
          match command {
            Some(command) => self.dispatch(command).await,
            None => {
              info!("saga engine channel closed");
              break;
            }
          }
        }
      }
    }

    debug!(armed = self.supervisor.armed(), "releasing timers");
    self.supervisor.release_all();
    info!(
      active = self.active.len(),
      awaiting_operator = self.stranded.len(),
      "saga engine stopped"
    );
    Ok(())
  }

  async fn dispatch(&mut self, command: Command) {
    let now = self.clock.now();
    match command {
      Command::Start {
        saga_id,
        definition,
        data,
        correlation_id,
        reply,
      } => {
        let id = saga_id.clone();
        let instance =
          SagaInstance::new(saga_id, definition.name(), data, correlation_id, now);
        info!(
          saga_id = %id,
          definition = %definition.name(),
          correlation_id = %instance.correlation_id,
          "saga_started"
        );
        self.supervisor.arm_timeout(&id, definition.timeout());
        let mut saga = Saga::new(instance, definition);
        let effects = saga.start(now);
        self.active.insert(id.clone(), saga);
        self.commit(&id, effects).await;
        let _ = reply.send(());
      }

      Command::Event(event) => {
        let id = event.saga_id().to_string();
        if self.require_step_index && event.is_unindexed_step_outcome() {
          debug!(saga_id = %id, topic = event.topic(), "step outcome without stepIndex dropped");
          return;
        }
        let Some(saga) = self.active.get_mut(&id) else {
          if self.stranded.contains_key(&id) {
            debug!(saga_id = %id, topic = event.topic(), "event for saga awaiting operator dropped");
          } else {
            warn!(saga_id = %id, topic = event.topic(), "event for unknown saga dropped");
          }
          return;
        };
        match saga.apply(&event, now) {
          Outcome::Applied(effects) => self.commit(&id, effects).await,
          Outcome::Ignored(reason) => {
            debug!(saga_id = %id, topic = event.topic(), reason, "event ignored");
          }
        }
      }

      Command::RetryDue {
        saga_id,
        step_index,
        attempt,
      } => {
        let Some(saga) = self.active.get_mut(&saga_id) else {
          debug!(saga_id = %saga_id, "retry timer for finished saga");
          return;
        };
        match saga.on_retry_due(step_index, attempt, now) {
          Outcome::Applied(effects) => {
            info!(saga_id = %saga_id, step_index, attempt, "retrying step");
            self.commit(&saga_id, effects).await;
          }
          Outcome::Ignored(reason) => debug!(saga_id = %saga_id, reason, "retry ignored"),
        }
      }

      Command::TimeoutFired { saga_id } => {
        let Some(saga) = self.active.get_mut(&saga_id) else {
          debug!(saga_id = %saga_id, "timeout for finished saga");
          return;
        };
        match saga.on_timeout(now) {
          Outcome::Applied(effects) => {
            warn!(
              saga_id = %saga_id,
              step_index = saga.instance.current_step_index,
              "saga timed out"
            );
            self.commit(&saga_id, effects).await;
          }
          Outcome::Ignored(reason) => debug!(saga_id = %saga_id, reason, "timeout ignored"),
        }
      }

      Command::Status { saga_id, reply } => {
        let instance = self
          .active
          .get(&saga_id)
          .map(|s| s.instance.clone())
          .or_else(|| self.stranded.get(&saga_id).cloned());
        let _ = reply.send(instance);
      }

      Command::Active { reply } => {
        let _ = reply.send(self.snapshot());
      }

      Command::Statistics { reply } => {
        let _ = reply.send(self.statistics());
      }

      Command::Acknowledge { saga_id, reply } => {
        let instance = self.stranded.remove(&saga_id);
        if instance.is_some() {
          info!(saga_id = %saga_id, "compensation failure acknowledged");
          if let Some(log) = &self.log
            && let Err(e) = log.forget(&saga_id).await
          {
            error!(saga_id = %saga_id, error = %e, "failed to forget acknowledged saga");
          }
        }
        let _ = reply.send(instance);
      }
    }
  }

  /// Record the saga's new state, then carry out the transition's effects.
  async fn commit(&mut self, saga_id: &str, effects: Vec<Effect>) {
    if let (Some(log), Some(saga)) = (&self.log, self.active.get(saga_id))
      && let Err(e) = log.append(&saga.instance).await
    {
      error!(saga_id, error = %e, "failed to record saga transition");
    }

    for effect in effects {
      self.perform(saga_id, effect).await;
    }
  }

  async fn perform(&mut self, saga_id: &str, effect: Effect) {
    match effect {
      Effect::RequestStep { action, request } => {
        debug!(saga_id, step_index = request.step_index, action = %action, "step_requested");
        self.publish(topics::step_request(&action), &request).await;
      }
      Effect::RequestCompensation { action, request } => {
        info!(saga_id, step_index = request.step_index, action = %action, "compensation_requested");
        self
          .publish(topics::compensation_request(&action), &request)
          .await;
      }
      Effect::AnnounceCompleted(payload) => {
        self.publish(topics::SAGA_COMPLETED.to_string(), &payload).await;
      }
      Effect::AnnounceFailed(payload) => {
        self.publish(topics::SAGA_FAILED.to_string(), &payload).await;
      }
      Effect::ScheduleRetry {
        step_index,
        attempt,
        delay,
      } => {
        warn!(
          saga_id,
          step_index,
          attempt,
          delay_ms = delay_ms(delay),
          "step failed, retry scheduled"
        );
        self.supervisor.arm_retry(saga_id, step_index, attempt, delay);
      }
      Effect::CancelRetry => self.supervisor.cancel_retry(saga_id),
      Effect::Finished => self.finish(saga_id).await,
    }
  }

  async fn publish(&self, topic: String, payload: &impl Serialize) {
    let message = match BusMessage::encode(topic, payload) {
      Ok(message) => message,
      Err(e) => {
        error!(error = %e, "failed to encode bus message");
        return;
      }
    };
    let topic = message.topic.clone();
    if let Err(e) = self.bus.publish(message).await {
      error!(topic = %topic, error = %e, "failed to publish bus message");
    }
  }

  /// Evict a terminal saga and release its timers.
  async fn finish(&mut self, saga_id: &str) {
    self.supervisor.release(saga_id);
    let Some(saga) = self.active.remove(saga_id) else {
      return;
    };
    let instance = saga.instance;
    let duration_ms = instance.duration_ms(self.clock.now());
    let forget = self.forget_finished
      && matches!(instance.status, SagaStatus::Completed | SagaStatus::Failed);

    match instance.status {
      SagaStatus::Completed => {
        info!(saga_id, definition = %instance.definition_name, duration_ms, "saga_completed");
      }
      SagaStatus::CompensationFailed => {
        if let Some(failure) = &instance.compensation_error {
          error!(
            saga_id,
            definition = %instance.definition_name,
            step_index = failure.step_index,
            compensation = %failure.compensation_name,
            error = %failure.error,
            "saga_compensation_failed"
          );
        }
        self.stranded.insert(instance.id.clone(), instance);
      }
      status => {
        info!(
          saga_id,
          definition = %instance.definition_name,
          status = %status,
          duration_ms,
          "saga_failed"
        );
      }
    }

    if forget
      && let Some(log) = &self.log
      && let Err(e) = log.forget(saga_id).await
    {
      error!(saga_id, error = %e, "failed to forget finished saga");
    }
  }

  fn snapshot(&self) -> Vec<SagaInstance> {
    let mut instances: Vec<SagaInstance> = self
      .active
      .values()
      .map(|s| s.instance.clone())
      .chain(self.stranded.values().cloned())
      .collect();
    instances.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
    instances
  }

  fn statistics(&self) -> Statistics {
    let mut stats = Statistics {
      active_sagas: self.active.len() + self.stranded.len(),
      compensation_failed: self.stranded.len(),
      defined_sagas: self.catalog.len(),
      ..Statistics::default()
    };
    for saga in self.active.values() {
      match saga.instance.status {
        SagaStatus::Running => stats.running += 1,
        SagaStatus::Compensating => stats.compensating += 1,
        _ => {}
      }
    }
    stats
  }
}

fn delay_ms(delay: Duration) -> u64 {
  u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
