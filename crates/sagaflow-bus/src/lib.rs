//! Sagaflow Bus
//!
//! The orchestrator talks to step and compensation handlers only through
//! messages. This crate defines that contract:
//!
//! - [`topics`]: logical event names (`saga:step:<action>`, ...)
//! - [`BusMessage`]: a topic plus a JSON payload
//! - payload structs for every event, serialized with camelCase keys
//! - [`SagaEvent`]: the four inbound outcome events the engine reacts to
//! - [`EventBus`]: the publish side of a transport, with in-process
//!   implementations for tests and embedding
//!
//! The physical transport is not defined here. Delivery is assumed to be
//! at-least-once with no ordering guarantee across topics.

mod bus;
mod error;
mod events;
mod message;

pub use bus::{ChannelBus, EventBus, InMemoryBus, NoopBus};
pub use error::BusError;
pub use events::{
  CompensationCompleted, CompensationFailed, CompensationRequest, SagaCompleted, SagaEvent,
  SagaFailed, StepCompleted, StepFailed, StepRequest,
};
pub use message::{BusMessage, topics};
