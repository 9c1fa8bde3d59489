//! End-to-end tests for the saga engine.
//!
//! Handlers are played by the test itself: it reads requests off a
//! `ChannelBus` and answers through the handle. Time is paused, so backoff
//! and deadlines elapse only when every task is idle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use sagaflow_bus::{
  BusMessage, ChannelBus, CompensationCompleted, CompensationFailed, CompensationRequest,
  EventBus, InMemoryBus, SagaCompleted, SagaEvent, SagaFailed, StepCompleted, StepFailed,
  StepRequest, topics,
};
use sagaflow_config::{CompensationDef, SagaDef, StepDef};
use sagaflow_orchestrator::{
  Catalog, Clock, EngineConfig, SagaEngine, SagaError, SagaHandle, SagaInstance, SagaStatus,
  Scheduler, StartOptions, TimerHandle,
};
use sagaflow_store::{MemoryLog, SagaLog};
use sagaflow_workflow::{Awaiting, FailureReason};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
  handle: SagaHandle,
  outbox: UnboundedReceiver<BusMessage>,
  cancel: CancellationToken,
  engine: JoinHandle<Result<(), SagaError>>,
}

impl Harness {
  async fn new(catalog: Arc<Catalog>, log: Option<Arc<dyn SagaLog>>) -> Self {
    Self::build(|bus| {
      let engine = SagaEngine::new(catalog, bus);
      match log {
        Some(log) => engine.with_log(log),
        None => engine,
      }
    })
    .await
  }

  async fn build(make: impl FnOnce(Arc<dyn EventBus>) -> SagaEngine) -> Self {
    let (bus, outbox) = ChannelBus::pair();
    let mut engine = make(Arc::new(bus));
    engine.recover().await.unwrap();

    let handle = engine.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(engine.start(cancel.clone()));
    Self {
      handle,
      outbox,
      cancel,
      engine: task,
    }
  }

  async fn next(&mut self) -> BusMessage {
    tokio::time::timeout(Duration::from_secs(3600), self.outbox.recv())
      .await
      .expect("no bus message within an hour")
      .expect("bus closed")
  }

  async fn next_step(&mut self, action: &str) -> StepRequest {
    let message = self.next().await;
    assert_eq!(message.topic, topics::step_request(action));
    message.decode().unwrap()
  }

  async fn next_compensation(&mut self, action: &str) -> CompensationRequest {
    let message = self.next().await;
    assert_eq!(message.topic, topics::compensation_request(action));
    message.decode().unwrap()
  }

  async fn complete(&self, saga_id: &str, result: serde_json::Value) {
    self
      .handle
      .handle_saga_event(SagaEvent::StepCompleted(StepCompleted {
        saga_id: saga_id.to_string(),
        result,
        step_index: None,
      }))
      .await
      .unwrap();
  }

  async fn fail(&self, saga_id: &str, error: &str) {
    self
      .handle
      .handle_saga_event(SagaEvent::StepFailed(StepFailed {
        saga_id: saga_id.to_string(),
        error: error.to_string(),
        retry_count: None,
        step_index: None,
      }))
      .await
      .unwrap();
  }

  async fn compensated(&self, saga_id: &str, step_index: usize) {
    self
      .handle
      .handle_saga_event(SagaEvent::CompensationCompleted(CompensationCompleted {
        saga_id: saga_id.to_string(),
        step_index,
        result: json!({}),
      }))
      .await
      .unwrap();
  }

  async fn stop(self) {
    self.cancel.cancel();
    self.engine.await.unwrap().unwrap();
  }
}

fn abc(max_retries: u32, backoff_base_ms: u64) -> SagaDef {
  SagaDef::new(
    "abc",
    vec![
      StepDef::new("a", "do-a"),
      StepDef::new("b", "do-b"),
      StepDef::new("c", "do-c"),
    ],
    vec![
      Some(CompensationDef::new("undo-a", "undo-a")),
      Some(CompensationDef::new("undo-b", "undo-b")),
      Some(CompensationDef::new("undo-c", "undo-c")),
    ],
  )
  .with_retry_policy(max_retries, backoff_base_ms)
}

fn catalog_with(defs: Vec<SagaDef>) -> Arc<Catalog> {
  let catalog = Catalog::new();
  for def in defs {
    catalog.define(def).unwrap();
  }
  Arc::new(catalog)
}

fn data(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
  value.as_object().cloned().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_all_steps_complete() {
  let mut h = Harness::new(catalog_with(vec![abc(3, 1000)]), None).await;

  let id = h
    .handle
    .start_saga(
      "abc",
      data(json!({ "user": "u-1" })),
      StartOptions::with_correlation_id("corr-1"),
    )
    .await
    .unwrap();

  for (i, action) in ["do-a", "do-b", "do-c"].into_iter().enumerate() {
    let request = h.next_step(action).await;
    assert_eq!(request.saga_id, id);
    assert_eq!(request.step_index, i);
    assert_eq!(request.correlation_id, "corr-1");
    assert_eq!(request.saga_data["user"], "u-1");
    h.complete(&id, json!({ format!("out{i}"): i })).await;
  }

  let message = h.next().await;
  assert_eq!(message.topic, topics::SAGA_COMPLETED);
  let done: SagaCompleted = message.decode().unwrap();
  assert_eq!(done.saga_id, id);
  assert_eq!(done.name, "abc");
  assert_eq!(done.correlation_id, "corr-1");
  assert_eq!(done.result["user"], "u-1");
  assert_eq!(done.result["out2"], 2);

  assert!(h.handle.get_saga_status(&id).await.unwrap().is_none());
  let stats = h.handle.get_statistics().await.unwrap();
  assert_eq!(stats.active_sagas, 0);
  assert_eq!(stats.defined_sagas, 1);

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_step_compensates_in_reverse() {
  let mut h = Harness::new(catalog_with(vec![abc(0, 1000)]), None).await;
  let id = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();

  h.next_step("do-a").await;
  h.complete(&id, json!({ "a": 1 })).await;
  h.next_step("do-b").await;
  h.complete(&id, json!({ "b": 2 })).await;
  h.next_step("do-c").await;
  h.fail(&id, "c broke").await;

  let undo_b = h.next_compensation("undo-b").await;
  assert_eq!(undo_b.step_index, 1);
  assert_eq!(undo_b.original_result, json!({ "b": 2 }));

  let status = h.handle.get_saga_status(&id).await.unwrap().unwrap();
  assert_eq!(status.status, SagaStatus::Compensating);
  assert_eq!(status.awaiting, Awaiting::CompensationOutcome);

  h.compensated(&id, 1).await;
  let undo_a = h.next_compensation("undo-a").await;
  assert_eq!(undo_a.step_index, 0);
  h.compensated(&id, 0).await;

  let message = h.next().await;
  assert_eq!(message.topic, topics::SAGA_FAILED);
  let failed: SagaFailed = message.decode().unwrap();
  assert_eq!(failed.status, "failed");
  assert!(failed.failure_reason.unwrap().contains("c broke"));
  assert!(failed.compensation_error.is_none());
  assert!(h.handle.get_saga_status(&id).await.unwrap().is_none());

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_step_is_retried_with_backoff() {
  let mut h = Harness::new(catalog_with(vec![abc(2, 1000)]), None).await;
  let id = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();

  let first = h.next_step("do-a").await;
  assert_eq!(first.retry_count, 0);

  let failed_at = tokio::time::Instant::now();
  h.fail(&id, "flaky").await;
  let second = h.next_step("do-a").await;
  let waited = failed_at.elapsed();
  assert!(waited >= Duration::from_millis(1000), "waited {waited:?}");
  assert!(waited < Duration::from_millis(1100), "waited {waited:?}");
  assert_eq!(second.step_index, 0);
  assert_eq!(second.retry_count, 1);

  let failed_at = tokio::time::Instant::now();
  h.fail(&id, "flaky").await;
  let third = h.next_step("do-a").await;
  let waited = failed_at.elapsed();
  assert!(waited >= Duration::from_millis(2000), "waited {waited:?}");
  assert!(waited < Duration::from_millis(2100), "waited {waited:?}");
  assert_eq!(third.retry_count, 2);

  // Retries spent and nothing to undo: straight to FAILED.
  h.fail(&id, "flaky").await;
  let message = h.next().await;
  assert_eq!(message.topic, topics::SAGA_FAILED);
  let failed: SagaFailed = message.decode().unwrap();
  assert_eq!(failed.status, "failed");

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_compensation_failure_is_retained_until_acknowledged() {
  let log = Arc::new(MemoryLog::new());
  let shared: Arc<dyn SagaLog> = log.clone();
  let mut h = Harness::new(catalog_with(vec![abc(0, 1000)]), Some(shared)).await;
  let id = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();

  h.next_step("do-a").await;
  h.complete(&id, json!({})).await;
  h.next_step("do-b").await;
  h.fail(&id, "b broke").await;

  h.next_compensation("undo-a").await;
  h.handle
    .handle_saga_event(SagaEvent::CompensationFailed(CompensationFailed {
      saga_id: id.clone(),
      step_index: 0,
      error: "refund api down".to_string(),
    }))
    .await
    .unwrap();

  let message = h.next().await;
  assert_eq!(message.topic, topics::SAGA_FAILED);
  let failed: SagaFailed = message.decode().unwrap();
  assert_eq!(failed.status, "compensation_failed");
  assert!(failed.compensation_error.unwrap().contains("refund api down"));

  let retained = h.handle.get_saga_status(&id).await.unwrap().unwrap();
  assert_eq!(retained.status, SagaStatus::CompensationFailed);
  let stats = h.handle.get_statistics().await.unwrap();
  assert_eq!(stats.active_sagas, 1);
  assert_eq!(stats.compensation_failed, 1);
  assert_eq!(stats.running, 0);

  // Late outcomes change nothing.
  h.compensated(&id, 0).await;
  let still = h.handle.get_saga_status(&id).await.unwrap().unwrap();
  assert_eq!(still.status, SagaStatus::CompensationFailed);
  assert!(h.outbox.try_recv().is_err());

  let acknowledged = h
    .handle
    .acknowledge_compensation_failure(&id)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(acknowledged.id, id);
  assert!(h.handle.get_saga_status(&id).await.unwrap().is_none());
  assert!(
    h.handle
      .acknowledge_compensation_failure(&id)
      .await
      .unwrap()
      .is_none()
  );
  assert!(log.history(&id).await.unwrap().is_empty());

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_starts_compensation() {
  let def = abc(3, 1000).with_timeout_ms(5_000);
  let mut h = Harness::new(catalog_with(vec![def]), None).await;
  let id = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();

  h.next_step("do-a").await;
  h.complete(&id, json!({})).await;
  h.next_step("do-b").await;

  // No handler answers step b.
  let undo_a = h.next_compensation("undo-a").await;
  assert_eq!(undo_a.step_index, 0);

  let status = h.handle.get_saga_status(&id).await.unwrap().unwrap();
  assert_eq!(status.status, SagaStatus::Compensating);
  assert_eq!(
    status.failure_reason,
    Some(FailureReason::Timeout {
      timeout_ms: 5_000,
      step_index: 1,
    })
  );

  // Step b answering late is ignored.
  h.complete(&id, json!({ "late": true })).await;
  h.compensated(&id, 0).await;
  let failed: SagaFailed = h.next().await.decode().unwrap();
  assert_eq!(failed.status, "failed");
  assert!(failed.failure_reason.unwrap().contains("timed out"));

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_saga_name_creates_nothing() {
  let h = Harness::new(catalog_with(vec![abc(3, 1000)]), None).await;

  let err = h
    .handle
    .start_saga("missing", data(json!({})), StartOptions::default())
    .await
    .unwrap_err();
  assert!(matches!(err, SagaError::NotFound(_)));
  assert!(h.handle.get_active_sagas().await.unwrap().is_empty());

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_completion_is_ignored() {
  let mut h = Harness::new(catalog_with(vec![abc(3, 1000)]), None).await;
  let id = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();

  h.next_step("do-a").await;
  for n in [1, 2] {
    h.handle
      .handle_saga_event(SagaEvent::StepCompleted(StepCompleted {
        saga_id: id.clone(),
        result: json!({ "n": n }),
        step_index: Some(0),
      }))
      .await
      .unwrap();
  }

  let status = h.handle.get_saga_status(&id).await.unwrap().unwrap();
  assert_eq!(status.current_step_index, 1);
  assert_eq!(status.completed_steps.len(), 1);
  assert_eq!(status.data["n"], 1);

  h.next_step("do-b").await;
  assert!(h.outbox.try_recv().is_err());

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unindexed_redelivery_dropped_when_index_required() {
  let config = EngineConfig {
    require_step_index: true,
    ..EngineConfig::default()
  };
  let catalog = catalog_with(vec![abc(3, 1000)]);
  let mut h = Harness::build(|bus| SagaEngine::with_config(catalog, bus, config)).await;
  let id = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();

  h.next_step("do-a").await;
  h.handle
    .handle_saga_event(SagaEvent::StepCompleted(StepCompleted {
      saga_id: id.clone(),
      result: json!({ "n": 1 }),
      step_index: Some(0),
    }))
    .await
    .unwrap();
  h.next_step("do-b").await;

  // Step a's completion again, this time without its index.
  h.complete(&id, json!({ "n": 2 })).await;
  h.fail(&id, "replayed failure").await;

  let status = h.handle.get_saga_status(&id).await.unwrap().unwrap();
  assert_eq!(status.current_step_index, 1);
  assert_eq!(status.completed_steps.len(), 1);
  assert!(status.failed_steps.is_empty());
  assert_eq!(status.data["n"], 1);
  assert!(h.outbox.try_recv().is_err());

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_finished_sagas_are_forgotten_when_configured() {
  let log = Arc::new(MemoryLog::new());
  let shared: Arc<dyn SagaLog> = log.clone();
  let config = EngineConfig {
    forget_finished: true,
    ..EngineConfig::default()
  };
  let catalog = catalog_with(vec![abc(0, 1000)]);
  let mut h =
    Harness::build(|bus| SagaEngine::with_config(catalog, bus, config).with_log(shared)).await;

  let done = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();
  for action in ["do-a", "do-b", "do-c"] {
    h.next_step(action).await;
    h.complete(&done, json!({})).await;
  }
  assert_eq!(h.next().await.topic, topics::SAGA_COMPLETED);
  assert!(h.handle.get_saga_status(&done).await.unwrap().is_none());
  assert!(log.history(&done).await.unwrap().is_empty());

  // A saga awaiting an operator keeps its history.
  let stuck = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();
  h.next_step("do-a").await;
  h.complete(&stuck, json!({})).await;
  h.next_step("do-b").await;
  h.fail(&stuck, "b broke").await;
  h.next_compensation("undo-a").await;
  h.handle
    .handle_saga_event(SagaEvent::CompensationFailed(CompensationFailed {
      saga_id: stuck.clone(),
      step_index: 0,
      error: "still broken".to_string(),
    }))
    .await
    .unwrap();
  assert_eq!(h.next().await.topic, topics::SAGA_FAILED);
  let retained = h.handle.get_saga_status(&stuck).await.unwrap().unwrap();
  assert_eq!(retained.status, SagaStatus::CompensationFailed);
  assert!(!log.history(&stuck).await.unwrap().is_empty());
  assert_eq!(log.load_unfinished().await.unwrap()[0].id, stuck);

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_default_correlation_id_is_saga_id() {
  let mut h = Harness::new(catalog_with(vec![abc(3, 1000)]), None).await;
  let id = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();

  let request = h.next_step("do-a").await;
  assert_eq!(request.correlation_id, id);
  let status = h.handle.get_saga_status(&id).await.unwrap().unwrap();
  assert_eq!(status.correlation_id, id);

  h.stop().await;
}

struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
  fn now(&self) -> DateTime<Utc> {
    self.0
  }
}

/// Holds scheduled tasks until the test runs them.
#[derive(Default)]
struct ManualScheduler {
  pending: Mutex<Vec<(Duration, BoxFuture<'static, ()>)>>,
}

impl ManualScheduler {
  fn take(&self) -> Vec<(Duration, BoxFuture<'static, ()>)> {
    std::mem::take(&mut *self.pending.lock().unwrap())
  }
}

impl Scheduler for ManualScheduler {
  fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
    self.pending.lock().unwrap().push((delay, task));
    TimerHandle::new(|| {})
  }
}

#[tokio::test]
async fn test_injected_clock_and_scheduler() {
  let started = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
  let clock = Arc::new(FixedClock(started));
  let scheduler = Arc::new(ManualScheduler::default());
  let catalog = catalog_with(vec![abc(3, 1000).with_timeout_ms(5_000)]);

  let mut h = Harness::build(|bus| {
    SagaEngine::new(catalog, bus)
      .with_clock(clock)
      .with_scheduler(scheduler.clone())
  })
  .await;
  let id = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();

  h.next_step("do-a").await;
  h.complete(&id, json!({})).await;
  h.next_step("do-b").await;

  let status = h.handle.get_saga_status(&id).await.unwrap().unwrap();
  assert_eq!(status.start_time, started);
  assert_eq!(status.last_activity, started);

  // Only the deadline was scheduled; fire it by hand.
  let mut pending = scheduler.take();
  assert_eq!(pending.len(), 1);
  let (delay, deadline) = pending.remove(0);
  assert_eq!(delay, Duration::from_secs(5));
  deadline.await;

  let undo_a = h.next_compensation("undo-a").await;
  assert_eq!(undo_a.step_index, 0);
  let status = h.handle.get_saga_status(&id).await.unwrap().unwrap();
  assert_eq!(status.status, SagaStatus::Compensating);
  assert_eq!(status.duration_ms(started), 0);

  h.stop().await;
}

#[tokio::test]
async fn test_recovered_requests_reach_early_subscribers() {
  let log = Arc::new(MemoryLog::new());
  let mut instance = SagaInstance::new(
    "saga-1".to_string(),
    "abc",
    data(json!({ "user": "u-2" })),
    None,
    Utc::now(),
  );
  instance.current_step_index = 1;
  log.append(&instance).await.unwrap();

  let bus = Arc::new(InMemoryBus::new());
  let mut handlers = bus.subscribe();
  let mut engine =
    SagaEngine::new(catalog_with(vec![abc(3, 1000)]), bus.clone()).with_log(log.clone());
  assert_eq!(engine.recover().await.unwrap(), 1);

  let message = handlers.recv().await.unwrap();
  assert_eq!(message.topic, topics::step_request("do-b"));
  let request: StepRequest = message.decode().unwrap();
  assert_eq!(request.saga_id, "saga-1");
  assert_eq!(request.saga_data["user"], "u-2");
}

#[tokio::test(start_paused = true)]
async fn test_events_for_unknown_sagas_are_dropped() {
  let h = Harness::new(catalog_with(vec![abc(3, 1000)]), None).await;

  h.complete("no-such-saga", json!({})).await;
  let stats = h.handle.get_statistics().await.unwrap();
  assert_eq!(stats.active_sagas, 0);

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_handle_message_routes_outcome_topics() {
  let mut h = Harness::new(catalog_with(vec![abc(3, 1000)]), None).await;
  let id = h
    .handle
    .start_saga("abc", data(json!({})), StartOptions::default())
    .await
    .unwrap();
  let request = h.next().await;

  // The engine's own requests are not inbound events.
  assert!(!h.handle.handle_message(&request).await.unwrap());

  let completed = BusMessage {
    topic: topics::STEP_COMPLETED.to_string(),
    payload: json!({ "sagaId": id, "result": { "ok": true }, "stepIndex": 0 }),
  };
  assert!(h.handle.handle_message(&completed).await.unwrap());
  h.next_step("do-b").await;

  let malformed = BusMessage {
    topic: topics::STEP_FAILED.to_string(),
    payload: json!({ "nope": 1 }),
  };
  assert!(matches!(
    h.handle.handle_message(&malformed).await,
    Err(SagaError::Bus(_))
  ));

  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_resumes_from_log() {
  let log = Arc::new(MemoryLog::new());
  let catalog = catalog_with(vec![abc(3, 1000)]);

  let shared: Arc<dyn SagaLog> = log.clone();
  let mut first = Harness::new(catalog.clone(), Some(shared.clone())).await;
  let id = first
    .handle
    .start_saga("abc", data(json!({ "user": "u-9" })), StartOptions::default())
    .await
    .unwrap();
  first.next_step("do-a").await;
  first.complete(&id, json!({ "a": "done" })).await;
  first.next_step("do-b").await;
  first.stop().await;

  let mut second = Harness::new(catalog, Some(shared)).await;
  let request = second.next_step("do-b").await;
  assert_eq!(request.saga_id, id);
  assert_eq!(request.step_index, 1);
  assert_eq!(request.saga_data["a"], "done");
  assert_eq!(request.saga_data["user"], "u-9");

  second.complete(&id, json!({})).await;
  second.next_step("do-c").await;
  second.complete(&id, json!({})).await;
  assert_eq!(second.next().await.topic, topics::SAGA_COMPLETED);

  assert!(log.load_unfinished().await.unwrap().is_empty());
  let statuses: Vec<SagaStatus> = log
    .history(&id)
    .await
    .unwrap()
    .into_iter()
    .map(|e| e.status)
    .collect();
  assert_eq!(statuses.first(), Some(&SagaStatus::Running));
  assert_eq!(statuses.last(), Some(&SagaStatus::Completed));

  second.stop().await;
}

#[tokio::test]
async fn test_invalid_definition_leaves_catalog_unchanged() {
  let h = Harness::new(catalog_with(vec![abc(3, 1000)]), None).await;

  let broken = SagaDef::new(
    "abc",
    vec![StepDef::new("only", "do-only")],
    vec![None, None],
  );
  let err = h.handle.define_saga(broken).unwrap_err();
  assert!(matches!(err, SagaError::Definition(_)));

  let kept = h.handle.get_workflow("abc").unwrap();
  assert_eq!(kept.steps().len(), 3);
  assert!(matches!(
    h.handle.get_workflow("nope"),
    Err(SagaError::NotFound(_))
  ));

  h.stop().await;
}
