//! Kafka adapter.
//!
//! Kafka restricts topic names to `[a-zA-Z0-9._-]`, so the `/` separators
//! used in logical topic names are rewritten to `-` on the wire; the
//! logical name is what the rest of the system sees. Publishes use the
//! synchronous producer; subscriptions consume from the newest offset.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use castellan_store::Client;
use rskafka::client::partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client as KafkaClient, ClientBuilder};
use rskafka::record::Record;
use rskafka::BackoffConfig;
use tokio::sync::{watch, Mutex};

use crate::{
    ConnectionState, LoggedMessage, MessageMonitor, PubSubClient, PubSubError, QoS,
};

const MAX_TOPIC_LEN: usize = 249;
const FETCH_MAX_BYTES: i32 = 1_048_576;
const FETCH_MAX_WAIT_MS: i32 = 500;

/// Kafka connection settings.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Broker addresses, e.g. `["localhost:9092"]`.
    pub brokers: Vec<String>,
}

/// [`PubSubClient`] backed by Kafka.
pub struct KafkaPubSubClient {
    cfg: KafkaConfig,
    monitor: Arc<dyn MessageMonitor>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    client: Option<Arc<KafkaClient>>,
    subscriptions: HashMap<String, watch::Sender<bool>>,
}

impl KafkaPubSubClient {
    pub fn new(cfg: KafkaConfig, monitor: Arc<dyn MessageMonitor>) -> Self {
        Self {
            cfg,
            monitor,
            inner: Mutex::new(Inner::default()),
        }
    }

    async fn connected_client(&self) -> Result<Arc<KafkaClient>, PubSubError> {
        let inner = self.inner.lock().await;
        match (&inner.state, &inner.client) {
            (ConnectionState::Connected, Some(client)) => Ok(Arc::clone(client)),
            _ => Err(PubSubError::NotConnected),
        }
    }
}

#[async_trait]
impl PubSubClient for KafkaPubSubClient {
    async fn connect(&self) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Disconnected {
            return Err(PubSubError::AlreadyConnected);
        }
        inner.state = ConnectionState::Connecting;

        let backoff = BackoffConfig {
            deadline: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        match ClientBuilder::new(self.cfg.brokers.clone())
            .backoff_config(backoff)
            .build()
            .await
        {
            Ok(client) => {
                inner.client = Some(Arc::new(client));
                inner.state = ConnectionState::Connected;
                tracing::info!(brokers = ?self.cfg.brokers, "connected to kafka");
                Ok(())
            }
            Err(err) => {
                inner.state = ConnectionState::Disconnected;
                Err(PubSubError::ConnectionFailed(err.to_string()))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            return Err(PubSubError::NotConnected);
        }
        inner.state = ConnectionState::Disconnecting;
        // Dropping the stop handles terminates every watch task.
        inner.subscriptions.clear();
        inner.client = None;
        inner.state = ConnectionState::Disconnected;
        tracing::info!("disconnected from kafka");
        Ok(())
    }

    async fn subscribe_to_topics(&self, topics: &[String]) -> Result<(), PubSubError> {
        for topic in topics {
            self.subscribe_to_topic(topic).await?;
        }
        Ok(())
    }

    async fn subscribe_to_topic(&self, topic: &str) -> Result<(), PubSubError> {
        let client = self.connected_client().await?;

        let partition = client
            .partition_client(wire_topic_name(topic), 0, UnknownTopicHandling::Retry)
            .await
            .map_err(|err| PubSubError::SubscribeFailed(err.to_string()))?;
        let offset = partition
            .get_offset(OffsetAt::Latest)
            .await
            .map_err(|err| PubSubError::SubscribeFailed(err.to_string()))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Connected {
                return Err(PubSubError::NotConnected);
            }
            inner.subscriptions.insert(topic.to_string(), stop_tx);
        }

        let monitor = Arc::clone(&self.monitor);
        let logical = topic.to_string();
        tokio::spawn(watch_partition(partition, offset, monitor, logical, stop_rx));

        tracing::info!(topic = %topic, "subscribed to topic");
        Ok(())
    }

    async fn unsubscribe_from_topic(&self, topic: &str) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().await;
        if inner.subscriptions.remove(topic).is_none() {
            tracing::warn!(topic = %topic, "cannot unsubscribe from a non subscribed topic");
            return Ok(());
        }
        tracing::info!(topic = %topic, "unsubscribed from topic");
        Ok(())
    }

    async fn publish(
        &self,
        payload: &[u8],
        client: &Client,
        _qos: QoS,
    ) -> Result<(), PubSubError> {
        // The synchronous producer is Kafka's strongest delivery class; the
        // requested QoS needs no further mapping.
        let kafka = self.connected_client().await?;
        let topic = client.command_topic();

        let partition = kafka
            .partition_client(wire_topic_name(&topic), 0, UnknownTopicHandling::Retry)
            .await
            .map_err(|err| PubSubError::PublishFailed(err.to_string()))?;

        let record = Record {
            key: None,
            value: Some(payload.to_vec()),
            headers: BTreeMap::new(),
            timestamp: chrono::Utc::now(),
        };
        let offsets = partition
            .produce(vec![record], Compression::NoCompression)
            .await
            .map_err(|err| PubSubError::PublishFailed(err.to_string()))?;

        tracing::debug!(topic = %topic, offset = ?offsets.first(), "published message");
        Ok(())
    }

    fn validate_topic(&self, topic: &str) -> Result<(), PubSubError> {
        let wire = wire_topic_name(topic);
        if wire.is_empty() {
            return Err(PubSubError::InvalidTopic("empty topic".into()));
        }
        if wire.len() > MAX_TOPIC_LEN {
            return Err(PubSubError::InvalidTopic(format!(
                "topic exceeds {} characters",
                MAX_TOPIC_LEN
            )));
        }
        if wire == "." || wire == ".." {
            return Err(PubSubError::InvalidTopic(format!("invalid topic {topic:?}")));
        }
        if let Some(bad) = wire
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-'))
        {
            return Err(PubSubError::InvalidTopic(format!(
                "invalid character {bad:?} in topic"
            )));
        }
        Ok(())
    }
}

async fn watch_partition(
    partition: PartitionClient,
    mut offset: i64,
    monitor: Arc<dyn MessageMonitor>,
    topic: String,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                tracing::debug!(topic = %topic, "stopping topic watch");
                return;
            }
            fetched = partition.fetch_records(offset, 1..FETCH_MAX_BYTES, FETCH_MAX_WAIT_MS) => {
                match fetched {
                    Ok((records, _high_watermark)) => {
                        for record in records {
                            offset = offset.max(record.offset + 1);
                            if let Some(value) = record.record.value {
                                monitor.on_message(LoggedMessage::classify(
                                    &topic, value, 0, false, false,
                                ));
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(topic = %topic, error = %err, "fetch failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

/// Rewrite a logical topic name into Kafka's restricted charset.
fn wire_topic_name(topic: &str) -> String {
    topic.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TracingMonitor;

    fn client() -> KafkaPubSubClient {
        KafkaPubSubClient::new(
            KafkaConfig {
                brokers: vec!["127.0.0.1:19092".into()],
            },
            Arc::new(TracingMonitor),
        )
    }

    #[test]
    fn wire_topic_rewrites_slashes() {
        assert_eq!(wire_topic_name("e4/dev1"), "e4-dev1");
        assert_eq!(wire_topic_name("plain"), "plain");
    }

    #[test]
    fn validate_topic_accepts_slashes_and_kafka_charset() {
        let client = client();
        assert!(client.validate_topic("e4/deadbeef").is_ok());
        assert!(client.validate_topic("metrics.device_1-a").is_ok());
    }

    #[test]
    fn validate_topic_rejects_bad_names() {
        let client = client();
        assert!(client.validate_topic("").is_err());
        assert!(client.validate_topic(".").is_err());
        assert!(client.validate_topic("..").is_err());
        assert!(client.validate_topic("with space").is_err());
        assert!(client.validate_topic("emoji\u{1f600}").is_err());
        assert!(client.validate_topic(&"x".repeat(MAX_TOPIC_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let kafka = client();
        let target = Client {
            id: vec![1; 16],
            name: "alice".into(),
            key: vec![],
        };
        assert!(matches!(
            kafka.publish(b"payload", &target, QoS::ExactlyOnce).await,
            Err(PubSubError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn disconnect_requires_connection() {
        let kafka = client();
        assert!(matches!(
            kafka.disconnect().await,
            Err(PubSubError::NotConnected)
        ));
    }
}
