//! The E4 service: orchestrates the store, crypto, command factory,
//! pub/sub adapter and event dispatcher.
//!
//! Every operation that both mutates key state and notifies a client obeys
//! notify-then-persist: the protected command is published before the
//! database is touched. Clients are authoritative about their own key
//! material, so once the broker has the command the server must converge
//! to it even if the subsequent write fails; the reverse order would leave
//! stranded devices.

use std::sync::Arc;

use castellan_commands::Command;
use castellan_crypto::{e4, E4Key};
use castellan_events::{Dispatcher, Event};
use castellan_pubsub::{PubSubClient, QoS};
use castellan_store::{Client, KeyStore, TxOptions};

use crate::error::Error;

/// Fan-out batch sizes and feature toggles.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub new_topic_batch_size: i64,
    pub get_linked_clients_batch_size: i64,
    pub new_c2_key_batch_size: i64,
    /// In pubkey mode, push a rotated client's new public key to its linked
    /// clients.
    pub new_client_key_send_pubkey: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            new_topic_batch_size: 100,
            get_linked_clients_batch_size: 100,
            new_c2_key_batch_size: 100,
            new_client_key_send_pubkey: false,
        }
    }
}

/// A client projection safe to return to callers: no key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdNamePair {
    pub id: Vec<u8>,
    pub name: String,
}

impl From<Client> for IdNamePair {
    fn from(client: Client) -> Self {
        Self {
            id: client.id,
            name: client.name,
        }
    }
}

/// Derive a client id from its name, checking a caller-supplied id against
/// the derived one.
pub fn validate_name_or_id_pair(name: &str, id: Option<&[u8]>) -> Result<Vec<u8>, Error> {
    e4::validate_name(name)?;
    let derived = e4::hash_id_alias(name);
    if let Some(supplied) = id {
        if supplied != derived {
            return Err(Error::InvalidArgument(format!(
                "id does not match the hash of name {name:?}"
            )));
        }
    }
    Ok(derived.to_vec())
}

/// The E4 key-management service.
pub struct E4Service {
    store: Arc<dyn KeyStore>,
    pubsub: Arc<dyn PubSubClient>,
    e4_key: Arc<dyn E4Key>,
    dispatcher: Arc<dyn Dispatcher>,
    db_enc_key: Vec<u8>,
    cfg: ServiceConfig,
}

impl E4Service {
    pub fn new(
        store: Arc<dyn KeyStore>,
        pubsub: Arc<dyn PubSubClient>,
        e4_key: Arc<dyn E4Key>,
        dispatcher: Arc<dyn Dispatcher>,
        db_enc_key: Vec<u8>,
        cfg: ServiceConfig,
    ) -> Result<Self, Error> {
        e4::validate_sym_key(&db_enc_key)?;
        Ok(Self {
            store,
            pubsub,
            e4_key,
            dispatcher,
            db_enc_key,
            cfg,
        })
    }

    /// Register a client with its initial key.
    #[tracing::instrument(name = "e4.NewClient", skip_all, fields(client = %name))]
    pub async fn new_client(
        &self,
        name: &str,
        id: Option<&[u8]>,
        key: &[u8],
    ) -> Result<(), Error> {
        let id = validate_name_or_id_pair(name, id)?;
        self.e4_key.validate_key(key)?;

        let encrypted = e4::encrypt(&self.db_enc_key, key)?;
        self.store.insert_client(name, &id, &encrypted).await?;

        tracing::info!(id = %hex::encode(&id), "client registered");
        Ok(())
    }

    /// Remove a client and all its graph edges.
    #[tracing::instrument(name = "e4.RemoveClient", skip_all)]
    pub async fn remove_client(&self, id: &[u8]) -> Result<(), Error> {
        e4::validate_id(id)?;
        self.store.delete_client_by_id(id).await?;
        tracing::info!(id = %hex::encode(id), "client removed");
        Ok(())
    }

    /// Send a client the key for `topic`, then record the subscription.
    #[tracing::instrument(name = "e4.NewTopicClient", skip_all, fields(topic = %topic))]
    pub async fn new_topic_client(&self, id: &[u8], topic: &str) -> Result<(), Error> {
        e4::validate_id(id)?;
        let client = self.store.get_client_by_id(id).await?;
        let topic_key = self.store.get_topic_key(topic).await?;

        let clear_topic_key = self.decrypt_key(&topic_key.key)?;
        let command = Command::set_topic_key(topic, &clear_topic_key)?;
        self.send_command(&command.serialize(), &client).await?;

        self.store.link_client_topic(&client.id, topic).await?;
        self.dispatcher
            .dispatch(Event::client_subscribed(client.name, topic));
        Ok(())
    }

    /// Tell a client to drop the key for `topic`, then remove the edge.
    #[tracing::instrument(name = "e4.RemoveTopicClient", skip_all, fields(topic = %topic))]
    pub async fn remove_topic_client(&self, id: &[u8], topic: &str) -> Result<(), Error> {
        e4::validate_id(id)?;
        let client = self.store.get_client_by_id(id).await?;
        let topic_key = self.store.get_topic_key(topic).await?;

        let command = Command::remove_topic(&topic_key.topic)?;
        self.send_command(&command.serialize(), &client).await?;

        self.store.unlink_client_topic(&client.id, topic).await?;
        self.dispatcher
            .dispatch(Event::client_unsubscribed(client.name, topic));
        Ok(())
    }

    /// Tell a client to drop every topic key. No database change.
    #[tracing::instrument(name = "e4.ResetClient", skip_all)]
    pub async fn reset_client(&self, id: &[u8]) -> Result<(), Error> {
        e4::validate_id(id)?;
        let client = self.store.get_client_by_id(id).await?;
        let command = Command::reset_topics();
        self.send_command(&command.serialize(), &client).await
    }

    /// Create (or rotate) a topic key and distribute it to the topic's
    /// cohort in batches.
    #[tracing::instrument(name = "e4.NewTopic", skip_all, fields(topic = %topic))]
    pub async fn new_topic(&self, topic: &str) -> Result<(), Error> {
        self.pubsub.validate_topic(topic)?;

        let clear_key = e4::random_sym_key();
        let encrypted = e4::encrypt(&self.db_enc_key, &clear_key)?;

        // The insert and the cohort count commit together, freezing the
        // set of clients the fan-out below must cover.
        let tx = self.store.begin_tx(TxOptions::default()).await?;
        let staged: Result<(Command, i64), Error> = async {
            tx.insert_topic_key(topic, &encrypted).await?;
            let command = Command::set_topic_key(topic, &clear_key)?;
            let count = tx.count_clients_for_topic(topic).await?;
            Ok((command, count))
        }
        .await;
        let (command, count) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        };
        tx.commit().await?;

        let command_bytes = command.serialize();
        let batch = self.cfg.new_topic_batch_size;
        let mut offset = 0;
        while offset < count {
            let clients = self
                .store
                .get_clients_for_topic(topic, offset, batch)
                .await?;
            if clients.is_empty() {
                break;
            }
            for client in &clients {
                if let Err(err) = self.send_command(&command_bytes, client).await {
                    tracing::warn!(
                        client = %client.name,
                        error = %err,
                        "failed to send topic key to client"
                    );
                }
            }
            offset += batch;
        }

        self.pubsub.subscribe_to_topic(topic).await?;
        tracing::info!(subscribers = count, "topic created");
        Ok(())
    }

    /// Stop monitoring a topic and delete its key. Clients learn of the
    /// revocation through the next key rotation they receive.
    #[tracing::instrument(name = "e4.RemoveTopic", skip_all, fields(topic = %topic))]
    pub async fn remove_topic(&self, topic: &str) -> Result<(), Error> {
        self.pubsub.unsubscribe_from_topic(topic).await?;
        self.store.delete_topic_key(topic).await?;
        tracing::info!("topic removed");
        Ok(())
    }

    /// Rotate a client's device key.
    ///
    /// The new stored key is persisted only after the SetIDKey publish: the
    /// device already holds the new key at that point, so the server must
    /// converge to it even when the write fails.
    #[tracing::instrument(name = "e4.NewClientKey", skip_all)]
    pub async fn new_client_key(&self, id: &[u8]) -> Result<(), Error> {
        e4::validate_id(id)?;
        let client = self.store.get_client_by_id(id).await?;
        let generated = self.e4_key.random_key()?;

        let command = Command::set_id_key(&generated.wire)?;
        self.send_command(&command.serialize(), &client).await?;

        let encrypted = e4::encrypt(&self.db_enc_key, &generated.stored)?;
        self.store
            .insert_client(&client.name, &client.id, &encrypted)
            .await?;

        if self.e4_key.is_pubkey_mode() && self.cfg.new_client_key_send_pubkey {
            let command = Command::set_pub_key(&generated.stored, &client.name)?;
            let command_bytes = command.serialize();

            let count = self.store.count_linked_clients(&client.id).await?;
            let batch = self.cfg.get_linked_clients_batch_size;
            let mut offset = 0;
            while offset < count {
                let linked = self
                    .store
                    .get_linked_clients_for_client_by_id(&client.id, offset, batch)
                    .await?;
                if linked.is_empty() {
                    break;
                }
                for target in &linked {
                    if let Err(err) = self.send_command(&command_bytes, target).await {
                        tracing::warn!(
                            client = %target.name,
                            error = %err,
                            "failed to send rotated public key to linked client"
                        );
                    }
                }
                offset += batch;
            }
        }

        tracing::info!(client = %client.name, "client key rotated");
        Ok(())
    }

    /// Rotate the C2 keypair: stage a new keypair, push it to every client,
    /// and make it authoritative only when the fan-out was clean.
    #[tracing::instrument(name = "e4.NewC2Key", skip_all)]
    pub async fn new_c2_key(&self) -> Result<(), Error> {
        if !self.e4_key.is_pubkey_mode() {
            return Err(Error::InvalidCryptoMode);
        }

        let tx = self.e4_key.new_c2_key_rotation_tx()?;
        let new_public_key = tx.new_public_key();
        let command = match Command::set_c2_key(&new_public_key) {
            Ok(command) => command,
            Err(err) => {
                let _ = tx.rollback();
                return Err(err.into());
            }
        };
        let command_bytes = command.serialize();

        let batch = self.cfg.new_c2_key_batch_size;
        let mut offset = 0;
        let mut first_err: Option<Error> = None;
        loop {
            let clients = match self.store.get_clients_range(offset, batch).await {
                Ok(clients) => clients,
                Err(err) => {
                    let _ = tx.rollback();
                    return Err(err.into());
                }
            };
            // Per-client failures do not abort the fan-out: the remaining
            // clients still receive the pending key, and the outcome is
            // decided after the loop.
            for client in &clients {
                if let Err(err) = self.send_command(&command_bytes, client).await {
                    tracing::warn!(
                        client = %client.name,
                        error = %err,
                        "failed to send new C2 key to client"
                    );
                    first_err.get_or_insert(err);
                }
            }
            if (clients.len() as i64) < batch {
                break;
            }
            offset += batch;
        }

        match first_err {
            Some(err) => {
                tx.rollback()?;
                Err(err)
            }
            None => {
                tx.commit()?;
                tracing::info!("C2 key rotated");
                Ok(())
            }
        }
    }

    /// Send `source`'s public key to `target`.
    #[tracing::instrument(name = "e4.SendClientPubKey", skip_all)]
    pub async fn send_client_pub_key(
        &self,
        source_id: &[u8],
        target_id: &[u8],
    ) -> Result<(), Error> {
        if !self.e4_key.is_pubkey_mode() {
            return Err(Error::InvalidCryptoMode);
        }
        let source = self.store.get_client_by_id(source_id).await?;
        let target = self.store.get_client_by_id(target_id).await?;

        let source_public_key = self.decrypt_key(&source.key)?;
        let command = Command::set_pub_key(&source_public_key, &source.name)?;
        self.send_command(&command.serialize(), &target).await
    }

    /// Tell `target` to drop `source`'s public key.
    #[tracing::instrument(name = "e4.RemoveClientPubKey", skip_all)]
    pub async fn remove_client_pub_key(
        &self,
        source_id: &[u8],
        target_id: &[u8],
    ) -> Result<(), Error> {
        if !self.e4_key.is_pubkey_mode() {
            return Err(Error::InvalidCryptoMode);
        }
        let source = self.store.get_client_by_id(source_id).await?;
        let target = self.store.get_client_by_id(target_id).await?;

        let command = Command::remove_pub_key(&source.name)?;
        self.send_command(&command.serialize(), &target).await
    }

    /// Tell `target` to drop every stored public key.
    #[tracing::instrument(name = "e4.ResetClientPubKeys", skip_all)]
    pub async fn reset_client_pub_keys(&self, target_id: &[u8]) -> Result<(), Error> {
        if !self.e4_key.is_pubkey_mode() {
            return Err(Error::InvalidCryptoMode);
        }
        let target = self.store.get_client_by_id(target_id).await?;
        let command = Command::reset_pub_keys();
        self.send_command(&command.serialize(), &target).await
    }

    /// Record a link between two clients. No broker traffic.
    #[tracing::instrument(name = "e4.LinkClient", skip_all)]
    pub async fn link_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), Error> {
        e4::validate_id(id1)?;
        e4::validate_id(id2)?;
        let client1 = self.store.get_client_by_id(id1).await?;
        let client2 = self.store.get_client_by_id(id2).await?;
        self.store.link_client(&client1.id, &client2.id).await?;
        Ok(())
    }

    /// Remove a link between two clients. No broker traffic.
    #[tracing::instrument(name = "e4.UnlinkClient", skip_all)]
    pub async fn unlink_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), Error> {
        e4::validate_id(id1)?;
        e4::validate_id(id2)?;
        let client1 = self.store.get_client_by_id(id1).await?;
        let client2 = self.store.get_client_by_id(id2).await?;
        self.store.unlink_client(&client1.id, &client2.id).await?;
        Ok(())
    }

    /// Protect an application payload with a topic's key.
    #[tracing::instrument(name = "e4.ProtectMessage", skip_all, fields(topic = %topic))]
    pub async fn protect_message(&self, topic: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
        let topic_key = self.store.get_topic_key(topic).await?;
        let clear_key = self.decrypt_key(&topic_key.key)?;
        Ok(e4::protect_sym_key(data, &clear_key)?)
    }

    /// Recover an application payload protected with a topic's key.
    #[tracing::instrument(name = "e4.UnprotectMessage", skip_all, fields(topic = %topic))]
    pub async fn unprotect_message(&self, topic: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
        let topic_key = self.store.get_topic_key(topic).await?;
        let clear_key = self.decrypt_key(&topic_key.key)?;
        Ok(e4::unprotect_sym_key(data, &clear_key)?)
    }

    #[tracing::instrument(name = "e4.CountClients", skip_all)]
    pub async fn count_clients(&self) -> Result<i64, Error> {
        Ok(self.store.count_clients().await?)
    }

    #[tracing::instrument(name = "e4.CountTopics", skip_all)]
    pub async fn count_topics(&self) -> Result<i64, Error> {
        Ok(self.store.count_topic_keys().await?)
    }

    #[tracing::instrument(name = "e4.CountTopicsForClient", skip_all)]
    pub async fn count_topics_for_client(&self, id: &[u8]) -> Result<i64, Error> {
        Ok(self.store.count_topics_for_client_by_id(id).await?)
    }

    #[tracing::instrument(name = "e4.CountClientsForTopic", skip_all, fields(topic = %topic))]
    pub async fn count_clients_for_topic(&self, topic: &str) -> Result<i64, Error> {
        Ok(self.store.count_clients_for_topic(topic).await?)
    }

    #[tracing::instrument(name = "e4.CountLinkedClients", skip_all)]
    pub async fn count_linked_clients(&self, id: &[u8]) -> Result<i64, Error> {
        Ok(self.store.count_linked_clients(id).await?)
    }

    #[tracing::instrument(name = "e4.GetClientsRange", skip_all)]
    pub async fn get_clients_range(
        &self,
        offset: i64,
        count: i64,
    ) -> Result<Vec<IdNamePair>, Error> {
        let clients = self.store.get_clients_range(offset, count).await?;
        Ok(clients.into_iter().map(IdNamePair::from).collect())
    }

    #[tracing::instrument(name = "e4.GetTopicsRange", skip_all)]
    pub async fn get_topics_range(&self, offset: i64, count: i64) -> Result<Vec<String>, Error> {
        let topics = self.store.get_topics_range(offset, count).await?;
        Ok(topics.into_iter().map(|t| t.topic).collect())
    }

    #[tracing::instrument(name = "e4.GetTopicsRangeByClient", skip_all)]
    pub async fn get_topics_range_by_client(
        &self,
        id: &[u8],
        offset: i64,
        count: i64,
    ) -> Result<Vec<String>, Error> {
        let topics = self
            .store
            .get_topics_for_client_by_id(id, offset, count)
            .await?;
        Ok(topics.into_iter().map(|t| t.topic).collect())
    }

    #[tracing::instrument(name = "e4.GetClientsRangeByTopic", skip_all, fields(topic = %topic))]
    pub async fn get_clients_range_by_topic(
        &self,
        topic: &str,
        offset: i64,
        count: i64,
    ) -> Result<Vec<IdNamePair>, Error> {
        let clients = self
            .store
            .get_clients_for_topic(topic, offset, count)
            .await?;
        Ok(clients.into_iter().map(IdNamePair::from).collect())
    }

    #[tracing::instrument(name = "e4.GetLinkedClients", skip_all)]
    pub async fn get_linked_clients(
        &self,
        id: &[u8],
        offset: i64,
        count: i64,
    ) -> Result<Vec<IdNamePair>, Error> {
        let clients = self
            .store
            .get_linked_clients_for_client_by_id(id, offset, count)
            .await?;
        Ok(clients.into_iter().map(IdNamePair::from).collect())
    }

    fn decrypt_key(&self, encrypted: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(e4::decrypt(&self.db_enc_key, encrypted)?)
    }

    /// Protect a serialised command with the client's cleartext key and
    /// publish it to the client's command topic.
    async fn send_command(&self, command: &[u8], client: &Client) -> Result<(), Error> {
        let clear_key = self.decrypt_key(&client.key)?;
        let payload = self.e4_key.protect_command(command, &clear_key)?;
        self.pubsub
            .publish(&payload, client, QoS::ExactlyOnce)
            .await?;
        Ok(())
    }
}
