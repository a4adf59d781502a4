//! Transactional persistence of clients, topic keys and the two edge sets
//! (client↔topic subscriptions and client↔client links).
//!
//! The [`KeyStore`] trait is the only surface the service sees; the
//! backends are PostgreSQL and SQLite (both via sqlx) plus an in-memory
//! store for tests. All key columns hold encrypted blobs; the store never
//! sees cleartext key material.

mod memory;
mod models;
mod postgres;
mod sqlite;

pub use memory::MemoryStore;
pub use models::{Client, TopicKey};
pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("invalid range bounds: offset {offset}, limit {limit}")]
    InvalidBounds { offset: i64, limit: i64 },

    #[error("cannot link a client to itself")]
    SelfLink,

    #[error("nested transactions are not supported")]
    NestedTx,

    #[error("store unavailable")]
    Unavailable,

    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// Transaction isolation, applied where the backend supports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for [`KeyStore::begin_tx`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub read_only: bool,
    pub isolation: Isolation,
}

/// The store contract.
///
/// All operations either succeed completely or leave the store unchanged.
/// Range reads are ordered by name / topic ascending and return empty
/// vectors when nothing matches; `offset ≥ 0` and `limit ≥ 1` or the call
/// fails with [`StoreError::InvalidBounds`].
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Idempotent schema bring-up.
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Upsert a client by id.
    async fn insert_client(&self, name: &str, id: &[u8], key: &[u8]) -> Result<(), StoreError>;

    async fn get_client_by_id(&self, id: &[u8]) -> Result<Client, StoreError>;

    /// Delete a client; cascades to both edge sets.
    async fn delete_client_by_id(&self, id: &[u8]) -> Result<(), StoreError>;

    async fn count_clients(&self) -> Result<i64, StoreError>;

    /// Upsert a topic key by topic.
    async fn insert_topic_key(&self, topic: &str, key: &[u8]) -> Result<(), StoreError>;

    async fn get_topic_key(&self, topic: &str) -> Result<TopicKey, StoreError>;

    /// Delete a topic key; cascades to subscription edges.
    async fn delete_topic_key(&self, topic: &str) -> Result<(), StoreError>;

    async fn count_topic_keys(&self) -> Result<i64, StoreError>;

    /// Subscribe a client to a topic. Fails with [`StoreError::NotFound`]
    /// when either endpoint is missing; an existing edge is success.
    async fn link_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError>;

    /// Remove a subscription edge. An absent edge between existing
    /// endpoints is success; a missing endpoint is [`StoreError::NotFound`].
    async fn unlink_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError>;

    async fn count_clients_for_topic(&self, topic: &str) -> Result<i64, StoreError>;

    async fn count_topics_for_client_by_id(&self, id: &[u8]) -> Result<i64, StoreError>;

    async fn get_clients_for_topic(
        &self,
        topic: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError>;

    async fn get_topics_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError>;

    async fn get_clients_range(&self, offset: i64, limit: i64) -> Result<Vec<Client>, StoreError>;

    async fn get_topics_range(&self, offset: i64, limit: i64)
        -> Result<Vec<TopicKey>, StoreError>;

    /// Link two distinct clients. Symmetric; an existing link is success.
    async fn link_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError>;

    async fn unlink_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError>;

    async fn count_linked_clients(&self, id: &[u8]) -> Result<i64, StoreError>;

    async fn get_linked_clients_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError>;

    /// Open a transaction exposing the same operations; changes are
    /// invisible outside it until commit.
    async fn begin_tx(&self, opts: TxOptions) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// An open store transaction.
#[async_trait]
pub trait StoreTx: KeyStore {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

pub(crate) fn check_bounds(offset: i64, limit: i64) -> Result<(), StoreError> {
    if offset < 0 || limit < 1 {
        return Err(StoreError::InvalidBounds { offset, limit });
    }
    Ok(())
}

/// Normalise an unordered client pair: lesser id first.
pub(crate) fn normalize_pair<'a>(id1: &'a [u8], id2: &'a [u8]) -> (&'a [u8], &'a [u8]) {
    if id1 <= id2 {
        (id1, id2)
    } else {
        (id2, id1)
    }
}

/// Map foreign-key violations onto [`StoreError::NotFound`]: the referenced
/// client or topic row does not exist.
pub(crate) fn map_fk_violation(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => StoreError::NotFound,
        _ => StoreError::Backend(err),
    }
}
