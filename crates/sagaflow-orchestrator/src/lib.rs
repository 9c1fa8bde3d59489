//! Sagaflow Orchestrator
//!
//! This crate drives saga instances: it dispatches steps to handlers over the
//! bus, retries failed steps with exponential backoff, enforces the saga
//! deadline, and compensates completed steps in reverse order when a saga
//! cannot finish.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SagaHandle                           │
//! │  - define_saga / get_workflow (shared Catalog)              │
//! │  - start_saga, handle_saga_event, queries → Command         │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ mpsc
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SagaEngine                           │
//! │  - owns every active saga (single writer)                   │
//! │  - Saga state machine → effects                             │
//! │  - appends each transition to the SagaLog, then publishes   │
//! └─────────────────────────────────────────────────────────────┘
//!           │                                      ▲
//!           ▼                                      │ RetryDue / TimeoutFired
//! ┌──────────────────────┐          ┌──────────────────────────┐
//! │       EventBus       │          │    TimeoutSupervisor     │
//! │  step / compensation │          │  Scheduler + handles     │
//! │  requests, announce  │          │  per saga                │
//! └──────────────────────┘          └──────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sagaflow_orchestrator::{SagaEngine, StartOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let bus = Arc::new(InMemoryBus::new());
//! let engine = SagaEngine::new(Arc::new(catalog), bus.clone());
//! let handle = engine.handle();
//!
//! let cancel = CancellationToken::new();
//! handle.listen(bus.subscribe(), cancel.clone());
//! tokio::spawn(engine.start(cancel.clone()));
//!
//! let saga_id = handle
//!     .start_saga("user-registration", data, StartOptions::default())
//!     .await?;
//! ```

mod clock;
mod compensation;
mod config;
mod engine;
mod error;
mod handle;
mod saga;
mod scheduler;
mod stats;
mod timeout;

pub use clock::{Clock, SystemClock};
pub use config::{EngineConfig, StartOptions};
pub use engine::SagaEngine;
pub use error::SagaError;
pub use handle::SagaHandle;
pub use scheduler::{Scheduler, TimerHandle, TokioScheduler};
pub use stats::Statistics;

// Re-exported so embedders need only this crate.
pub use sagaflow_bus::{BusMessage, EventBus, SagaEvent};
pub use sagaflow_config::SagaDef;
pub use sagaflow_workflow::{Catalog, SagaId, SagaInstance, SagaStatus, WorkflowDefinition};
