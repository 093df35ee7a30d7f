//! Message-bus surface consumed by the gateway.
//!
//! The gateway talks to a broker driver through the narrow [`Subscriber`] /
//! [`Reader`] traits; drivers are looked up by key in a [`BrokerRegistry`].
//! The in-process [`memory::MemoryBroker`] is the default driver and the one
//! the test suite runs against.

pub mod memory;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bus error type.
#[derive(Debug, Error)]
pub enum BusError {
    /// The wait for the next message was cancelled. This is the clean
    /// shutdown path, not a failure.
    #[error("wait cancelled")]
    Timeout,

    /// The driver has been stopped and its queue closed.
    #[error("broker closed")]
    Closed,

    /// No driver registered under the requested key.
    #[error("unknown broker driver: {0}")]
    UnknownDriver(String),

    /// Driver-specific failure.
    #[error("broker driver error: {0}")]
    Driver(String),

    /// Message marshalling failure.
    #[error("message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// A single published message: an opaque payload under one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    topic: String,
    #[serde(with = "payload_bytes")]
    payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Topic the message was published under.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Raw message body.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Binary encoding used when a driver relays messages between nodes.
    pub fn marshal(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    /// Inverse of [`Message::marshal`].
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

mod payload_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(b: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(b)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        Ok(Vec::<u8>::deserialize(d)?.into())
    }
}

/// Topic membership registration.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Register a connection on one or more topics. Idempotent per
    /// (connection, topic) pair.
    async fn subscribe(&self, connection_id: Uuid, topics: &[String]) -> Result<()>;

    /// Remove a connection from the listed topics. Unknown pairs are
    /// silently ignored.
    async fn unsubscribe(&self, connection_id: Uuid, topics: &[String]) -> Result<()>;

    /// Collect the connections currently registered on `topic` into `out`.
    fn connections(&self, topic: &str, out: &mut HashSet<Uuid>);

    /// Stop the driver and release its resources.
    fn stop(&self);
}

/// Source of published messages.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Wait for the next published message. Returns [`BusError::Timeout`]
    /// when `cancel` fires and [`BusError::Closed`] once the driver is
    /// stopped and drained.
    async fn next(&self, cancel: &CancellationToken) -> Result<Message>;
}

/// The composite surface the gateway consumes.
pub trait SubReader: Subscriber + Reader {}

impl<T: Subscriber + Reader> SubReader for T {}

/// Publish side of a driver.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message, waiting for queue space.
    async fn publish(&self, msg: Message) -> Result<()>;

    /// Publish without waiting; failures are logged, not returned.
    fn publish_async(&self, msg: Message);
}

/// Driver registry keyed by configuration name.
#[derive(Default)]
pub struct BrokerRegistry {
    drivers: HashMap<String, Arc<dyn SubReader>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, driver: Arc<dyn SubReader>) {
        self.drivers.insert(key.into(), driver);
    }

    pub fn get_driver(&self, key: &str) -> Result<Arc<dyn SubReader>> {
        self.drivers
            .get(key)
            .cloned()
            .ok_or_else(|| BusError::UnknownDriver(key.to_string()))
    }
}
