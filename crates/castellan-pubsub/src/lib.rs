//! Broker-neutral publish/subscribe layer.
//!
//! The service talks to [`PubSubClient`] only; the MQTT and Kafka adapters
//! map the contract onto their broker, including topic-name sanitisation
//! and the strongest delivery class the broker offers. Subscribed traffic
//! is handed to a [`MessageMonitor`] for the analytics path.

mod kafka;
mod mock;
mod monitor;
mod mqtt;

pub use kafka::{KafkaConfig, KafkaPubSubClient};
pub use mock::{MockPubSubClient, PublishedMessage};
pub use monitor::{LoggedMessage, MessageMonitor, TracingMonitor};
pub use mqtt::{MqttConfig, MqttPubSubClient};

use async_trait::async_trait;
use castellan_store::Client;
use thiserror::Error;

/// Errors from pub/sub operations.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("topic has an invalid format: {0}")]
    InvalidTopic(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}

/// Delivery guarantee requested for a publish.
///
/// The adapters map [`QoS::ExactlyOnce`] to the strongest class their broker
/// offers (MQTT QoS 2, synchronous Kafka produce).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Adapter lifecycle. Only `Connected` accepts publish and subscribe calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// The pub/sub contract consumed by the E4 service.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Establish the broker connection.
    /// Fails with [`PubSubError::AlreadyConnected`] when already up.
    async fn connect(&self) -> Result<(), PubSubError>;

    /// Tear the connection down, cancelling every subscription. No monitor
    /// callbacks fire afterwards. Fails with [`PubSubError::NotConnected`]
    /// when there is nothing to tear down.
    async fn disconnect(&self) -> Result<(), PubSubError>;

    /// Subscribe to each topic in order; stops at the first failure.
    async fn subscribe_to_topics(&self, topics: &[String]) -> Result<(), PubSubError>;

    /// Start monitoring `topic`.
    async fn subscribe_to_topic(&self, topic: &str) -> Result<(), PubSubError>;

    /// Stop monitoring `topic`. Unsubscribing from a topic that was never
    /// subscribed is not an error.
    async fn unsubscribe_from_topic(&self, topic: &str) -> Result<(), PubSubError>;

    /// Publish `payload` to the client's private command topic.
    async fn publish(&self, payload: &[u8], client: &Client, qos: QoS)
        -> Result<(), PubSubError>;

    /// Check `topic` against this broker's naming rules.
    fn validate_topic(&self, topic: &str) -> Result<(), PubSubError>;
}
