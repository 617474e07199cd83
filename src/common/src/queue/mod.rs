//! Durable work queues with delayed delivery.
//!
//! Delivery is at-least-once: a received message is leased to the consumer
//! until it is acknowledged or moved to the dead-letter store. Leased
//! messages that were never acknowledged become deliverable again when a
//! durable backend is reopened.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub mod file;
pub mod memory;

pub use file::FileQueue;
pub use memory::InMemoryQueue;

/// Header carrying the reason a message was dead-lettered
pub const HEADER_DEAD_LETTER_REASON: &str = "dead-letter-reason";

/// Serialized form of a message as stored by a queue backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    pub queue: String,
    /// Earliest time the message may be delivered
    pub deliver_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.deliver_at <= now
    }
}

/// Typed message envelope that can contain any serializable payload
#[derive(Debug, Clone)]
pub struct Message<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub id: Uuid,
    pub queue: String,
    pub payload: T,
    pub headers: HashMap<String, String>,
    pub deliver_at: DateTime<Utc>,
}

impl<T> Message<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Create a message that is deliverable immediately
    pub fn new(queue: impl Into<String>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            payload,
            headers: HashMap::new(),
            deliver_at: Utc::now(),
        }
    }

    /// Delay delivery by `delay` from now
    pub fn deliver_after(mut self, delay: Duration) -> Self {
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        self.deliver_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn to_envelope(&self) -> QueueResult<Envelope> {
        Ok(Envelope {
            id: self.id,
            queue: self.queue.clone(),
            deliver_at: self.deliver_at,
            enqueued_at: Utc::now(),
            headers: self.headers.clone(),
            body: serde_json::to_value(&self.payload)?,
        })
    }

    pub fn from_envelope(envelope: &Envelope) -> QueueResult<Self> {
        Ok(Self {
            id: envelope.id,
            queue: envelope.queue.clone(),
            payload: serde_json::from_value(envelope.body.clone())?,
            headers: envelope.headers.clone(),
            deliver_at: envelope.deliver_at,
        })
    }
}

/// Error types that can occur during queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to publish message: {0}")]
    PublishError(String),

    #[error("Failed to receive message: {0}")]
    ReceiveError(String),

    #[error("Message {0} is not leased by this consumer")]
    NotLeased(Uuid),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Trait implemented by all queue backends
#[async_trait]
pub trait Queue: std::fmt::Debug + Sync + Send + 'static {
    /// Store a message for delivery at its `deliver_at` time
    async fn publish(&self, envelope: Envelope) -> QueueResult<()>;

    /// Lease the next due message of `queue`, earliest delivery time first
    async fn receive(&self, queue: &str) -> QueueResult<Option<Envelope>>;

    /// Acknowledge that a leased message has been processed
    async fn ack(&self, queue: &str, id: Uuid) -> QueueResult<()>;

    /// Replace a leased message with `envelope` in the dead-letter store
    async fn dead_letter(&self, envelope: Envelope) -> QueueResult<()>;

    /// Messages that exhausted their retries
    async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<Envelope>>;

    /// Number of messages waiting for delivery, due or not
    async fn pending(&self, queue: &str) -> QueueResult<usize>;
}

/// Publish a typed message
pub async fn publish_message<T>(queue: &dyn Queue, message: &Message<T>) -> QueueResult<()>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    queue.publish(message.to_envelope()?).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct TestPayload {
        data: String,
    }

    #[test]
    fn test_message_envelope_conversion() {
        let message = Message::new(
            "orders",
            TestPayload {
                data: "test".to_string(),
            },
        )
        .with_header("origin", "unit-test");

        let envelope = message.to_envelope().unwrap();
        assert_eq!(envelope.id, message.id);
        assert_eq!(envelope.queue, "orders");
        assert_eq!(envelope.headers.get("origin").unwrap(), "unit-test");

        let decoded = Message::<TestPayload>::from_envelope(&envelope).unwrap();
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn test_deliver_after_moves_delivery_time() {
        let message = Message::new("orders", 1u32).deliver_after(Duration::from_secs(60));
        let envelope = message.to_envelope().unwrap();
        assert!(!envelope.is_due(Utc::now()));
        assert!(envelope.is_due(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_wrong_payload_type_fails_to_decode() {
        let envelope = Message::new("orders", "text".to_string()).to_envelope().unwrap();
        assert!(Message::<TestPayload>::from_envelope(&envelope).is_err());
    }
}
