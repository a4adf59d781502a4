//! MQTT adapter.
//!
//! Commands go out on the client's private command topic at QoS 2; every
//! monitored topic is subscribed at QoS 2 as well. A single background task
//! drives the rumqttc event loop and feeds received publishes to the
//! monitor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use castellan_store::Client;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS as MqttQoS};
use tokio::sync::{watch, Mutex};

use crate::{
    ConnectionState, LoggedMessage, MessageMonitor, PubSubClient, PubSubError, QoS,
};

const MAX_TOPIC_LEN: usize = 65_535;

/// MQTT connection settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// [`PubSubClient`] backed by MQTT.
pub struct MqttPubSubClient {
    cfg: MqttConfig,
    monitor: Arc<dyn MessageMonitor>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    client: Option<AsyncClient>,
    stop: Option<watch::Sender<bool>>,
    subscriptions: HashSet<String>,
}

impl MqttPubSubClient {
    pub fn new(cfg: MqttConfig, monitor: Arc<dyn MessageMonitor>) -> Self {
        Self {
            cfg,
            monitor,
            inner: Mutex::new(Inner::default()),
        }
    }

    async fn connected_client(&self) -> Result<AsyncClient, PubSubError> {
        let inner = self.inner.lock().await;
        match (&inner.state, &inner.client) {
            (ConnectionState::Connected, Some(client)) => Ok(client.clone()),
            _ => Err(PubSubError::NotConnected),
        }
    }
}

#[async_trait]
impl PubSubClient for MqttPubSubClient {
    async fn connect(&self) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Disconnected {
            return Err(PubSubError::AlreadyConnected);
        }
        inner.state = ConnectionState::Connecting;

        let mut options =
            MqttOptions::new(self.cfg.client_id.clone(), self.cfg.host.clone(), self.cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&self.cfg.username, &self.cfg.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        // Wait for the broker handshake before reporting the adapter up.
        match tokio::time::timeout(Duration::from_secs(10), eventloop.poll()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                inner.state = ConnectionState::Disconnected;
                return Err(PubSubError::ConnectionFailed(err.to_string()));
            }
            Err(_) => {
                inner.state = ConnectionState::Disconnected;
                return Err(PubSubError::ConnectionFailed(
                    "timed out waiting for broker".into(),
                ));
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_event_loop(eventloop, Arc::clone(&self.monitor), stop_rx));

        inner.client = Some(client);
        inner.stop = Some(stop_tx);
        inner.state = ConnectionState::Connected;
        tracing::info!(host = %self.cfg.host, port = self.cfg.port, "connected to mqtt broker");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            return Err(PubSubError::NotConnected);
        }
        inner.state = ConnectionState::Disconnecting;

        if let Some(client) = inner.client.take() {
            let _ = client.disconnect().await;
        }
        // Dropping the stop handle terminates the event loop task.
        inner.stop = None;
        inner.subscriptions.clear();
        inner.state = ConnectionState::Disconnected;
        tracing::info!("disconnected from mqtt broker");
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
        client
            .subscribe(topic.to_string(), MqttQoS::ExactlyOnce)
            .await
            .map_err(|err| PubSubError::SubscribeFailed(err.to_string()))?;

        self.inner.lock().await.subscriptions.insert(topic.to_string());
        tracing::info!(topic = %topic, "subscribed to topic");
        Ok(())
    }

    async fn unsubscribe_from_topic(&self, topic: &str) -> Result<(), PubSubError> {
        let client = self.connected_client().await?;
        if !self.inner.lock().await.subscriptions.remove(topic) {
            tracing::warn!(topic = %topic, "cannot unsubscribe from a non subscribed topic");
            return Ok(());
        }
        client
            .unsubscribe(topic.to_string())
            .await
            .map_err(|err| PubSubError::SubscribeFailed(err.to_string()))?;
        tracing::info!(topic = %topic, "unsubscribed from topic");
        Ok(())
    }

    async fn publish(
        &self,
        payload: &[u8],
        client: &Client,
        qos: QoS,
    ) -> Result<(), PubSubError> {
        let mqtt = self.connected_client().await?;
        let topic = client.command_topic();
        mqtt.publish(topic.clone(), map_qos(qos), false, payload.to_vec())
            .await
            .map_err(|err| PubSubError::PublishFailed(err.to_string()))?;
        tracing::debug!(topic = %topic, "published message");
        Ok(())
    }

    fn validate_topic(&self, topic: &str) -> Result<(), PubSubError> {
        if topic.is_empty() {
            return Err(PubSubError::InvalidTopic("empty topic".into()));
        }
        if topic.len() > MAX_TOPIC_LEN {
            return Err(PubSubError::InvalidTopic(format!(
                "topic exceeds {} bytes",
                MAX_TOPIC_LEN
            )));
        }
        if topic.contains(['+', '#', '\0']) {
            return Err(PubSubError::InvalidTopic(
                "wildcard and NUL characters are not allowed".into(),
            ));
        }
        Ok(())
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    monitor: Arc<dyn MessageMonitor>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                tracing::debug!("stopping mqtt event loop");
                return;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    monitor.on_message(LoggedMessage::classify(
                        &publish.topic,
                        publish.payload.to_vec(),
                        publish.qos as u8,
                        publish.retain,
                        publish.dup,
                    ));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "mqtt event loop error, reconnecting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

fn map_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}
