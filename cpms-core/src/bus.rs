//! Event bus seam
//!
//! The engine only ever talks to the platform through [`EventBus`]. A broker
//! client (Kafka, NATS, Redis streams, ...) implements the trait outside this
//! workspace; [`MemoryBus`] is the in-process implementation used by the CLI
//! node and the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Default per-subscription buffer
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

/// A message travelling over the bus
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    /// Partition/correlation key (charger identity for domain events,
    /// `responseKey` for command responses)
    pub key: Option<String>,
    pub payload: Value,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
        }
    }

    pub fn keyed(topic: impl Into<String>, key: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            key: Some(key.into()),
            payload,
        }
    }
}

/// Errors raised by a bus implementation
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Event bus closed")]
    Closed,

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stream of messages for one topic
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// Wrap a receiver fed by a bus implementation
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<BusMessage>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the bus side has gone away
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Non-blocking poll, mainly for tests
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// Publish/subscribe transport
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to its topic
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    /// Subscribe to every message published to `topic` from now on
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

/// In-process bus: fan-out to per-subscriber bounded channels
pub struct MemoryBus {
    capacity: usize,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        debug!("Created memory bus (capacity {})", capacity.max(1));
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        // Snapshot senders so the lock is not held across the sends
        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let mut subscribers = self.subscribers.lock();
            match subscribers.get_mut(&message.topic) {
                Some(subs) => {
                    subs.retain(|tx| !tx.is_closed());
                    subs.clone()
                }
                None => Vec::new(),
            }
        };

        trace!(
            "Publishing to {} ({} subscribers)",
            message.topic,
            targets.len()
        );

        // Never waits on a subscriber: a full buffer drops the message for that subscriber only
        for tx in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber on {} is lagging, dropping message", message.topic);
                }
                // Dropped mid-publish; pruned on the next publish
                Err(TrySendError::Closed(_)) => {}
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        debug!("New subscription on {}", topic);
        Ok(Subscription::new(topic, rx))
    }
}
