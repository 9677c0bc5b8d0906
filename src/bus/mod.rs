//! Message bus boundary.
//!
//! Publishers send [`Envelope`]s to a topic. Consumers bind a named queue to
//! one or more topics and receive [`Delivery`]s from it. A delivery that is
//! dropped without [`Delivery::ack`] goes back to its queue, which gives
//! at-least-once delivery across handler failures and shutdowns.

pub mod in_memory;
#[cfg(feature = "kafka")]
pub mod kafka;
mod offsets;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::events::{DomainEvent, EventDecodeError, EventType, EVENT_VERSION};
use crate::domain::outbox::OutboxMessage;

pub use in_memory::InMemoryBus;

/// Message type tag of dead-letter envelopes.
pub const FAULT_MESSAGE_TYPE: &str = "Fault";

/// Message type tag for bytes a transport could not read as an envelope.
pub const UNREADABLE_MESSAGE_TYPE: &str = "Unreadable";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
    #[error("could not serialise envelope: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("queue '{0}' already has a consumer")]
    QueueInUse(String),
    #[error("{0}")]
    Unsupported(String),
}

/// Tagged, versioned payload as it travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Stable across redeliveries of the same outbox row.
    pub message_id: Uuid,
    pub message_type: String,
    pub version: u32,
    pub aggregate_id: String,
    pub sent_at: DateTime<Utc>,
    pub payload: Value,
}

impl Envelope {
    pub fn from_outbox(message: &OutboxMessage) -> Self {
        Self {
            message_id: message.id,
            message_type: message.event_type.clone(),
            version: message.version,
            aggregate_id: message.aggregate_id.clone(),
            sent_at: Utc::now(),
            payload: message.payload.clone(),
        }
    }

    /// Wraps an event that does not come from an outbox, e.g. bids published
    /// by the bidding side.
    pub fn from_event(event: &DomainEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            message_type: event.event_type().as_str().to_string(),
            version: EVENT_VERSION,
            aggregate_id: event.aggregate_id().to_string(),
            sent_at: Utc::now(),
            payload: event.to_payload()?,
        })
    }

    /// Carries bytes that are not an envelope. They fail decoding on the
    /// consumer and so take the redelivery and dead-letter path.
    pub fn unreadable(aggregate_id: Option<&str>, raw: &[u8]) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type: UNREADABLE_MESSAGE_TYPE.to_string(),
            version: EVENT_VERSION,
            aggregate_id: aggregate_id.unwrap_or_default().to_string(),
            sent_at: Utc::now(),
            payload: Value::String(String::from_utf8_lossy(raw).into_owned()),
        }
    }

    /// Topic the envelope is routed to, `None` for unknown message types.
    pub fn topic(&self) -> Option<&'static str> {
        EventType::parse(&self.message_type).map(|t| t.topic())
    }

    pub fn decode(&self) -> Result<DomainEvent, EventDecodeError> {
        DomainEvent::decode(&self.message_type, self.version, self.payload.clone())
    }
}

/// Dead-letter record for a message that exhausted its redeliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    pub queue: String,
    pub attempts: u32,
    pub error: String,
    pub message: Envelope,
}

impl Fault {
    pub fn into_envelope(self) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope {
            message_id: Uuid::new_v4(),
            message_type: FAULT_MESSAGE_TYPE.to_string(),
            version: EVENT_VERSION,
            aggregate_id: self.message.aggregate_id.clone(),
            sent_at: Utc::now(),
            payload: serde_json::to_value(&self)?,
        })
    }
}

/// Where messages that exhausted their retries on `queue` are sent.
pub fn dead_letter_topic(queue: &str) -> String {
    format!("{queue}_error")
}

/// Settles a delivery with the broker.
pub trait Acknowledge: Send {
    fn ack(self: Box<Self>);
    /// The delivery was not handled; the broker must offer it again.
    fn nack(self: Box<Self>);
}

pub struct Delivery {
    pub envelope: Envelope,
    /// Set when the broker has offered this message before.
    pub redelivered: bool,
    acker: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    pub fn new(envelope: Envelope, redelivered: bool, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            envelope,
            redelivered,
            acker: Some(acker),
        }
    }

    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    /// Discards the delivery without settling it with the broker.
    pub(crate) fn forget(mut self) {
        self.acker = None;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

type ReturnQueue = Box<dyn FnOnce(mpsc::UnboundedReceiver<Delivery>) + Send>;

/// Exclusive consumer handle on one queue.
pub struct Subscription {
    queue: String,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
    on_close: Option<ReturnQueue>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            queue: queue.into(),
            rx: Some(rx),
            on_close: None,
        }
    }

    /// Hands the receiver back to the bus when the subscription is dropped, so
    /// queued messages survive a consumer restart.
    pub(crate) fn on_close(mut self, hook: ReturnQueue) -> Self {
        self.on_close = Some(hook);
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let (Some(rx), Some(hook)) = (self.rx.take(), self.on_close.take()) {
            hook(rx);
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Returns only once the broker has accepted the message.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError>;

    /// Declares `queue`, binds it to `topics` and attaches the only consumer.
    async fn subscribe(&self, queue: &str, topics: &[&str]) -> Result<Subscription, BusError>;

    /// Declares `queue` and binds it to `topics` without consuming, so
    /// messages are kept for whoever subscribes later.
    async fn declare(&self, queue: &str, topics: &[&str]) -> Result<(), BusError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusSettings {
    /// Kafka bootstrap servers; `None` selects the in-process bus.
    pub kafka_brokers: Option<String>,
}

pub fn connect(settings: &BusSettings) -> Result<Arc<dyn MessageBus>, BusError> {
    match settings.kafka_brokers.as_deref() {
        None => {
            log::info!("Using the in-process message bus");
            Ok(Arc::new(InMemoryBus::new()))
        }
        #[cfg(feature = "kafka")]
        Some(brokers) => {
            log::info!("Connecting to Kafka at {}", brokers);
            Ok(Arc::new(kafka::KafkaBus::new(brokers)?))
        }
        #[cfg(not(feature = "kafka"))]
        Some(_) => Err(BusError::Unsupported(
            "KAFKA_BROKERS is set but this build has no kafka support".to_string(),
        )),
    }
}
