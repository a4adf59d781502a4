//! Recording mock for tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use castellan_store::Client;
use parking_lot::RwLock;
use tokio::sync::Semaphore;

use crate::{ConnectionState, PubSubClient, PubSubError, QoS};

/// A recorded publish.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub payload: Vec<u8>,
    pub topic: String,
    pub qos: QoS,
}

#[derive(Default)]
struct MockState {
    state: ConnectionState,
    published: Vec<PublishedMessage>,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    fail_topics: HashSet<String>,
    fail_subscribe: bool,
}

/// [`PubSubClient`] that records every call and supports scripted failures.
///
/// With [`MockPubSubClient::with_publish_permits`], each publish consumes a
/// permit and publishes beyond the budget wait forever; cancellation tests
/// abort the caller mid-fan-out at a deterministic point.
#[derive(Default)]
pub struct MockPubSubClient {
    inner: RwLock<MockState>,
    permits: Option<Arc<Semaphore>>,
}

impl MockPubSubClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of publishes that may complete.
    pub fn with_publish_permits(permits: usize) -> Self {
        Self {
            inner: RwLock::new(MockState::default()),
            permits: Some(Arc::new(Semaphore::new(permits))),
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.read().published.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.inner.read().published.len()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.read().subscribed.clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.inner.read().unsubscribed.clone()
    }

    /// Fail publishes addressed to `topic`.
    pub fn fail_on_topic(&self, topic: &str) {
        self.inner.write().fail_topics.insert(topic.to_string());
    }

    /// Fail publishes addressed to `client`'s command topic.
    pub fn fail_on_client(&self, client: &Client) {
        self.fail_on_topic(&client.command_topic());
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.write().fail_subscribe = fail;
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.published.clear();
        inner.subscribed.clear();
        inner.unsubscribed.clear();
    }
}

#[async_trait]
impl PubSubClient for MockPubSubClient {
    async fn connect(&self) -> Result<(), PubSubError> {
        let mut inner = self.inner.write();
        if inner.state != ConnectionState::Disconnected {
            return Err(PubSubError::AlreadyConnected);
        }
        inner.state = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PubSubError> {
        let mut inner = self.inner.write();
        if inner.state != ConnectionState::Connected {
            return Err(PubSubError::NotConnected);
        }
        inner.state = ConnectionState::Disconnected;
        Ok(())
    }

    async fn subscribe_to_topics(&self, topics: &[String]) -> Result<(), PubSubError> {
        for topic in topics {
            self.subscribe_to_topic(topic).await?;
        }
        Ok(())
    }

    async fn subscribe_to_topic(&self, topic: &str) -> Result<(), PubSubError> {
        let mut inner = self.inner.write();
        if inner.fail_subscribe {
            return Err(PubSubError::SubscribeFailed("scripted failure".into()));
        }
        inner.subscribed.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe_from_topic(&self, topic: &str) -> Result<(), PubSubError> {
        self.inner.write().unsubscribed.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        payload: &[u8],
        client: &Client,
        qos: QoS,
    ) -> Result<(), PubSubError> {
        if let Some(permits) = &self.permits {
            let permit = permits
                .acquire()
                .await
                .map_err(|_| PubSubError::PublishFailed("permits closed".into()))?;
            permit.forget();
        }

        let topic = client.command_topic();
        let mut inner = self.inner.write();
        if inner.fail_topics.contains(&topic) {
            return Err(PubSubError::PublishFailed(format!(
                "scripted failure for {topic}"
            )));
        }
        inner.published.push(PublishedMessage {
            payload: payload.to_vec(),
            topic,
            qos,
        });
        Ok(())
    }

    fn validate_topic(&self, topic: &str) -> Result<(), PubSubError> {
        if topic.is_empty() || topic.contains(['+', '#', '\0']) {
            return Err(PubSubError::InvalidTopic(format!("invalid topic {topic:?}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Client {
        Client {
            id: vec![0xaa; 16],
            name: "alice".into(),
            key: vec![],
        }
    }

    #[tokio::test]
    async fn records_publishes_with_command_topic() {
        let mock = MockPubSubClient::new();
        mock.publish(b"payload", &alice(), QoS::ExactlyOnce)
            .await
            .unwrap();

        let published = mock.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, format!("e4/{}", "aa".repeat(16)));
        assert_eq!(published[0].qos, QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn scripted_failure_rejects_publish() {
        let mock = MockPubSubClient::new();
        mock.fail_on_client(&alice());

        assert!(matches!(
            mock.publish(b"payload", &alice(), QoS::ExactlyOnce).await,
            Err(PubSubError::PublishFailed(_))
        ));
        assert_eq!(mock.publish_count(), 0);
    }

    #[tokio::test]
    async fn connect_twice_is_already_connected() {
        let mock = MockPubSubClient::new();
        mock.connect().await.unwrap();
        assert!(matches!(
            mock.connect().await,
            Err(PubSubError::AlreadyConnected)
        ));

        mock.disconnect().await.unwrap();
        assert!(matches!(
            mock.disconnect().await,
            Err(PubSubError::NotConnected)
        ));
    }
}
