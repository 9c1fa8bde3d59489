//! Event bus implementations.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::error::BusError;
use crate::message::BusMessage;

/// Publish side of a message transport.
///
/// The orchestrator holds one of these and calls `publish` for every request
/// and announcement. Implementations decide delivery; the orchestrator only
/// assumes at-least-once.
#[async_trait]
pub trait EventBus: Send + Sync {
  async fn publish(&self, message: BusMessage) -> Result<(), BusError>;
}

/// A bus that discards every message.
///
/// Useful for tests that only inspect saga state.
#[derive(Debug, Clone, Default)]
pub struct NoopBus;

#[async_trait]
impl EventBus for NoopBus {
  async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
    trace!(topic = %message.topic, "discarding bus message");
    Ok(())
  }
}

/// A bus that forwards every message to an unbounded channel.
///
/// Gives tests (or an embedding process) the full ordered stream of what the
/// orchestrator published.
#[derive(Debug, Clone)]
pub struct ChannelBus {
  // NOTE: Unbounded so a slow consumer never stalls the engine loop. Volume is
  // a handful of messages per saga step.
  sender: mpsc::UnboundedSender<BusMessage>,
}

impl ChannelBus {
  pub fn new(sender: mpsc::UnboundedSender<BusMessage>) -> Self {
    Self { sender }
  }

  /// Create a bus together with the receiving end.
  pub fn pair() -> (Self, mpsc::UnboundedReceiver<BusMessage>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }
}

#[async_trait]
impl EventBus for ChannelBus {
  async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
    self.sender.send(message).map_err(|_| BusError::Closed)
  }
}

/// In-process publish/subscribe bus.
///
/// Every subscriber sees every message published after it subscribed.
/// Publishing with no subscribers succeeds and drops the message.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
  sender: broadcast::Sender<BusMessage>,
}

impl InMemoryBus {
  pub fn new() -> Self {
    Self::with_capacity(1024)
  }

  /// Create a bus whose subscribers buffer up to `capacity` messages.
  pub fn with_capacity(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity);
    Self { sender }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
    self.sender.subscribe()
  }
}

impl Default for InMemoryBus {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl EventBus for InMemoryBus {
  async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
    if self.sender.send(message).is_err() {
      trace!("no subscribers on in-memory bus");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn message(topic: &str) -> BusMessage {
    BusMessage {
      topic: topic.to_string(),
      payload: json!({}),
    }
  }

  #[tokio::test]
  async fn test_channel_bus_preserves_order() {
    let (bus, mut receiver) = ChannelBus::pair();
    bus.publish(message("a")).await.unwrap();
    bus.publish(message("b")).await.unwrap();

    assert_eq!(receiver.recv().await.unwrap().topic, "a");
    assert_eq!(receiver.recv().await.unwrap().topic, "b");
  }

  #[tokio::test]
  async fn test_channel_bus_closed() {
    let (bus, receiver) = ChannelBus::pair();
    drop(receiver);
    assert!(matches!(
      bus.publish(message("a")).await,
      Err(BusError::Closed)
    ));
  }

  #[tokio::test]
  async fn test_in_memory_bus_fans_out() {
    let bus = InMemoryBus::new();
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();

    bus.publish(message("x")).await.unwrap();

    assert_eq!(first.recv().await.unwrap().topic, "x");
    assert_eq!(second.recv().await.unwrap().topic, "x");
  }

  #[tokio::test]
  async fn test_in_memory_bus_without_subscribers() {
    let bus = InMemoryBus::new();
    assert!(bus.publish(message("x")).await.is_ok());
  }
}
