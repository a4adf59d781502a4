//! Castellan daemon: bring up the store, the crypto module and the broker
//! connection, resume monitoring of every stored topic, then park until
//! shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use castellan::config::{BrokerKind, Config, CryptoMode, DbKind};
use castellan::{telemetry, E4Service, ServiceConfig};
use castellan_crypto::{E4Key, PubKeyE4Key, SymmetricE4Key};
use castellan_events::BroadcastDispatcher;
use castellan_pubsub::{
    KafkaConfig, KafkaPubSubClient, MqttConfig, MqttPubSubClient, PubSubClient, TracingMonitor,
};
use castellan_store::{KeyStore, PgStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "castellan", about = "E4 key-management control plane")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "castellan.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    telemetry::init_logging(&config.log.level, config.log.format)?;
    tracing::info!("castellan starting");

    let url = config.db.connection_url()?;
    let store: Arc<dyn KeyStore> = match config.db.kind {
        DbKind::Postgres => Arc::new(PgStore::connect(&url).await?),
        DbKind::Sqlite => Arc::new(SqliteStore::connect(&url).await?),
    };
    store.migrate().await.context("running store migration")?;

    let e4_key: Arc<dyn E4Key> = match config.crypto.mode {
        CryptoMode::Symmetric => Arc::new(SymmetricE4Key::new()),
        CryptoMode::Pubkey => {
            let path = config
                .crypto
                .c2_key_file
                .as_deref()
                .context("pubkey mode requires crypto.c2_key_file")?;
            Arc::new(load_or_generate_c2_key(path)?)
        }
    };

    let monitor = Arc::new(TracingMonitor);
    let pubsub: Arc<dyn PubSubClient> = match config.broker.kind {
        BrokerKind::Mqtt => {
            let (host, port) = split_endpoint(&config.broker.endpoint);
            Arc::new(MqttPubSubClient::new(
                MqttConfig {
                    host,
                    port,
                    client_id: config.broker.client_id.clone(),
                    username: config.broker.username.clone(),
                    password: config.broker.password.clone(),
                },
                monitor,
            ))
        }
        BrokerKind::Kafka => Arc::new(KafkaPubSubClient::new(
            KafkaConfig {
                brokers: config
                    .broker
                    .endpoint
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
            monitor,
        )),
    };
    pubsub.connect().await.context("connecting to broker")?;

    let _service = E4Service::new(
        Arc::clone(&store),
        Arc::clone(&pubsub),
        e4_key,
        Arc::new(BroadcastDispatcher::default()),
        config.crypto.db_encryption_key()?,
        ServiceConfig {
            new_topic_batch_size: config.batch.new_topic,
            get_linked_clients_batch_size: config.batch.linked_clients,
            new_c2_key_batch_size: config.batch.new_c2_key,
            new_client_key_send_pubkey: config.crypto.new_client_key_send_pubkey,
        },
    )?;

    resume_topic_monitoring(store.as_ref(), pubsub.as_ref()).await?;
    tracing::info!("castellan ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    pubsub.disconnect().await?;
    Ok(())
}

/// Re-subscribe to every stored topic so monitoring survives restarts.
async fn resume_topic_monitoring(
    store: &dyn KeyStore,
    pubsub: &dyn PubSubClient,
) -> anyhow::Result<()> {
    const PAGE: i64 = 100;
    let mut offset = 0;
    loop {
        let topics = store.get_topics_range(offset, PAGE).await?;
        if topics.is_empty() {
            break;
        }
        let names: Vec<String> = topics.iter().map(|t| t.topic.clone()).collect();
        pubsub.subscribe_to_topics(&names).await?;
        if (topics.len() as i64) < PAGE {
            break;
        }
        offset += PAGE;
    }
    Ok(())
}

/// Load the C2 seed from disk, generating and persisting one on first run.
fn load_or_generate_c2_key(path: &Path) -> anyhow::Result<PubKeyE4Key> {
    if path.exists() {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading C2 key file {}", path.display()))?;
        let seed: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("C2 key file must hold exactly 32 bytes"))?;
        Ok(PubKeyE4Key::from_seed(seed))
    } else {
        let key = PubKeyE4Key::generate();
        std::fs::write(path, key.seed())
            .with_context(|| format!("writing C2 key file {}", path.display()))?;
        tracing::warn!(path = %path.display(), "generated a new C2 keypair");
        Ok(key)
    }
}

/// Split an MQTT `host:port` endpoint, defaulting to 1883.
fn split_endpoint(endpoint: &str) -> (String, u16) {
    match endpoint.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (endpoint.to_string(), 1883),
        },
        None => (endpoint.to_string(), 1883),
    }
}
