//! PostgreSQL backend.

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tokio::sync::Mutex;

use crate::{
    check_bounds, map_fk_violation, normalize_pair, Client, Isolation, KeyStore, StoreError,
    StoreTx, TopicKey, TxOptions,
};

/// Key store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the given database URL.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyStore for PgStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::migrate(&mut conn).await
    }

    async fn insert_client(&self, name: &str, id: &[u8], key: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::insert_client(&mut conn, name, id, key).await
    }

    async fn get_client_by_id(&self, id: &[u8]) -> Result<Client, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::get_client_by_id(&mut conn, id).await
    }

    async fn delete_client_by_id(&self, id: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::delete_client_by_id(&mut conn, id).await
    }

    async fn count_clients(&self) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::count_clients(&mut conn).await
    }

    async fn insert_topic_key(&self, topic: &str, key: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::insert_topic_key(&mut conn, topic, key).await
    }

    async fn get_topic_key(&self, topic: &str) -> Result<TopicKey, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::get_topic_key(&mut conn, topic).await
    }

    async fn delete_topic_key(&self, topic: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::delete_topic_key(&mut conn, topic).await
    }

    async fn count_topic_keys(&self) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::count_topic_keys(&mut conn).await
    }

    async fn link_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::link_client_topic(&mut conn, client_id, topic).await
    }

    async fn unlink_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::unlink_client_topic(&mut conn, client_id, topic).await
    }

    async fn count_clients_for_topic(&self, topic: &str) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::count_clients_for_topic(&mut conn, topic).await
    }

    async fn count_topics_for_client_by_id(&self, id: &[u8]) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::count_topics_for_client_by_id(&mut conn, id).await
    }

    async fn get_clients_for_topic(
        &self,
        topic: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::get_clients_for_topic(&mut conn, topic, offset, limit).await
    }

    async fn get_topics_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::get_topics_for_client_by_id(&mut conn, id, offset, limit).await
    }

    async fn get_clients_range(&self, offset: i64, limit: i64) -> Result<Vec<Client>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::get_clients_range(&mut conn, offset, limit).await
    }

    async fn get_topics_range(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::get_topics_range(&mut conn, offset, limit).await
    }

    async fn link_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::link_client(&mut conn, id1, id2).await
    }

    async fn unlink_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::unlink_client(&mut conn, id1, id2).await
    }

    async fn count_linked_clients(&self, id: &[u8]) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::count_linked_clients(&mut conn, id).await
    }

    async fn get_linked_clients_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::get_linked_clients(&mut conn, id, offset, limit).await
    }

    async fn begin_tx(&self, opts: TxOptions) -> Result<Box<dyn StoreTx>, StoreError> {
        let mut tx = self.pool.begin().await?;
        match opts.isolation {
            Isolation::ReadCommitted => {}
            Isolation::RepeatableRead => {
                sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                    .execute(&mut *tx)
                    .await?;
            }
            Isolation::Serializable => {
                sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                    .execute(&mut *tx)
                    .await?;
            }
        }
        if opts.read_only {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await?;
        }
        Ok(Box::new(PgStoreTx { tx: Mutex::new(tx) }))
    }
}

/// An open PostgreSQL transaction.
pub struct PgStoreTx {
    tx: Mutex<Transaction<'static, Postgres>>,
}

#[async_trait]
impl KeyStore for PgStoreTx {
    async fn migrate(&self) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        queries::migrate(&mut *tx).await
    }

    async fn insert_client(&self, name: &str, id: &[u8], key: &[u8]) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        queries::insert_client(&mut *tx, name, id, key).await
    }

    async fn get_client_by_id(&self, id: &[u8]) -> Result<Client, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::get_client_by_id(&mut *tx, id).await
    }

    async fn delete_client_by_id(&self, id: &[u8]) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        queries::delete_client_by_id(&mut *tx, id).await
    }

    async fn count_clients(&self) -> Result<i64, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::count_clients(&mut *tx).await
    }

    async fn insert_topic_key(&self, topic: &str, key: &[u8]) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        queries::insert_topic_key(&mut *tx, topic, key).await
    }

    async fn get_topic_key(&self, topic: &str) -> Result<TopicKey, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::get_topic_key(&mut *tx, topic).await
    }

    async fn delete_topic_key(&self, topic: &str) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        queries::delete_topic_key(&mut *tx, topic).await
    }

    async fn count_topic_keys(&self) -> Result<i64, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::count_topic_keys(&mut *tx).await
    }

    async fn link_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        queries::link_client_topic(&mut *tx, client_id, topic).await
    }

    async fn unlink_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        queries::unlink_client_topic(&mut *tx, client_id, topic).await
    }

    async fn count_clients_for_topic(&self, topic: &str) -> Result<i64, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::count_clients_for_topic(&mut *tx, topic).await
    }

    async fn count_topics_for_client_by_id(&self, id: &[u8]) -> Result<i64, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::count_topics_for_client_by_id(&mut *tx, id).await
    }

    async fn get_clients_for_topic(
        &self,
        topic: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::get_clients_for_topic(&mut *tx, topic, offset, limit).await
    }

    async fn get_topics_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::get_topics_for_client_by_id(&mut *tx, id, offset, limit).await
    }

    async fn get_clients_range(&self, offset: i64, limit: i64) -> Result<Vec<Client>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::get_clients_range(&mut *tx, offset, limit).await
    }

    async fn get_topics_range(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::get_topics_range(&mut *tx, offset, limit).await
    }

    async fn link_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        queries::link_client(&mut *tx, id1, id2).await
    }

    async fn unlink_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        queries::unlink_client(&mut *tx, id1, id2).await
    }

    async fn count_linked_clients(&self, id: &[u8]) -> Result<i64, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::count_linked_clients(&mut *tx, id).await
    }

    async fn get_linked_clients_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::get_linked_clients(&mut *tx, id, offset, limit).await
    }

    async fn begin_tx(&self, _opts: TxOptions) -> Result<Box<dyn StoreTx>, StoreError> {
        Err(StoreError::NestedTx)
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.into_inner().commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.into_inner().rollback().await?;
        Ok(())
    }
}

mod queries {
    use super::*;

    const MIGRATE: &[&str] = &[
        r#"
        CREATE TABLE IF NOT EXISTS clients (
            id   BYTEA PRIMARY KEY,
            name TEXT  NOT NULL UNIQUE,
            key  BYTEA NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS topic_keys (
            topic TEXT  PRIMARY KEY,
            key   BYTEA NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS client_topics (
            client_id BYTEA NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
            topic     TEXT  NOT NULL REFERENCES topic_keys(topic) ON DELETE CASCADE,
            PRIMARY KEY (client_id, topic)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS client_links (
            left_id  BYTEA NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
            right_id BYTEA NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
            PRIMARY KEY (left_id, right_id)
        )
        "#,
    ];

    pub async fn migrate(conn: &mut PgConnection) -> Result<(), StoreError> {
        for statement in MIGRATE {
            sqlx::query(statement).execute(&mut *conn).await?;
        }
        Ok(())
    }

    pub async fn insert_client(
        conn: &mut PgConnection,
        name: &str,
        id: &[u8],
        key: &[u8],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO clients (id, name, key) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, key = EXCLUDED.key
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(key)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get_client_by_id(
        conn: &mut PgConnection,
        id: &[u8],
    ) -> Result<Client, StoreError> {
        sqlx::query_as::<_, Client>("SELECT id, name, key FROM clients WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn delete_client_by_id(
        conn: &mut PgConnection,
        id: &[u8],
    ) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM clients WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn count_clients(conn: &mut PgConnection) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM clients")
            .fetch_one(&mut *conn)
            .await?)
    }

    pub async fn insert_topic_key(
        conn: &mut PgConnection,
        topic: &str,
        key: &[u8],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO topic_keys (topic, key) VALUES ($1, $2)
            ON CONFLICT (topic) DO UPDATE SET key = EXCLUDED.key
            "#,
        )
        .bind(topic)
        .bind(key)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get_topic_key(
        conn: &mut PgConnection,
        topic: &str,
    ) -> Result<TopicKey, StoreError> {
        sqlx::query_as::<_, TopicKey>("SELECT topic, key FROM topic_keys WHERE topic = $1")
            .bind(topic)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn delete_topic_key(
        conn: &mut PgConnection,
        topic: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM topic_keys WHERE topic = $1")
            .bind(topic)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn count_topic_keys(conn: &mut PgConnection) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM topic_keys")
            .fetch_one(&mut *conn)
            .await?)
    }

    pub async fn link_client_topic(
        conn: &mut PgConnection,
        client_id: &[u8],
        topic: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO client_topics (client_id, topic) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(client_id)
        .bind(topic)
        .execute(&mut *conn)
        .await
        .map_err(map_fk_violation)?;
        Ok(())
    }

    pub async fn unlink_client_topic(
        conn: &mut PgConnection,
        client_id: &[u8],
        topic: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM client_topics WHERE client_id = $1 AND topic = $2")
            .bind(client_id)
            .bind(topic)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            ensure_client_exists(conn, client_id).await?;
            ensure_topic_exists(conn, topic).await?;
        }
        Ok(())
    }

    pub async fn count_clients_for_topic(
        conn: &mut PgConnection,
        topic: &str,
    ) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM client_topics WHERE topic = $1")
                .bind(topic)
                .fetch_one(&mut *conn)
                .await?,
        )
    }

    pub async fn count_topics_for_client_by_id(
        conn: &mut PgConnection,
        id: &[u8],
    ) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM client_topics WHERE client_id = $1")
                .bind(id)
                .fetch_one(&mut *conn)
                .await?,
        )
    }

    pub async fn get_clients_for_topic(
        conn: &mut PgConnection,
        topic: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(sqlx::query_as::<_, Client>(
            r#"
            SELECT c.id, c.name, c.key FROM clients c
            JOIN client_topics ct ON ct.client_id = c.id
            WHERE ct.topic = $1
            ORDER BY c.name ASC LIMIT $2 OFFSET $3
            "#,
        )
        .bind(topic)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?)
    }

    pub async fn get_topics_for_client_by_id(
        conn: &mut PgConnection,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(sqlx::query_as::<_, TopicKey>(
            r#"
            SELECT t.topic, t.key FROM topic_keys t
            JOIN client_topics ct ON ct.topic = t.topic
            WHERE ct.client_id = $1
            ORDER BY t.topic ASC LIMIT $2 OFFSET $3
            "#,
        )
        .bind(id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?)
    }

    pub async fn get_clients_range(
        conn: &mut PgConnection,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(sqlx::query_as::<_, Client>(
            "SELECT id, name, key FROM clients ORDER BY name ASC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?)
    }

    pub async fn get_topics_range(
        conn: &mut PgConnection,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(sqlx::query_as::<_, TopicKey>(
            "SELECT topic, key FROM topic_keys ORDER BY topic ASC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?)
    }

    pub async fn link_client(
        conn: &mut PgConnection,
        id1: &[u8],
        id2: &[u8],
    ) -> Result<(), StoreError> {
        if id1 == id2 {
            return Err(StoreError::SelfLink);
        }
        let (left, right) = normalize_pair(id1, id2);
        sqlx::query(
            "INSERT INTO client_links (left_id, right_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(left)
        .bind(right)
        .execute(&mut *conn)
        .await
        .map_err(map_fk_violation)?;
        Ok(())
    }

    pub async fn unlink_client(
        conn: &mut PgConnection,
        id1: &[u8],
        id2: &[u8],
    ) -> Result<(), StoreError> {
        if id1 == id2 {
            return Err(StoreError::SelfLink);
        }
        let (left, right) = normalize_pair(id1, id2);
        let result = sqlx::query("DELETE FROM client_links WHERE left_id = $1 AND right_id = $2")
            .bind(left)
            .bind(right)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            ensure_client_exists(conn, id1).await?;
            ensure_client_exists(conn, id2).await?;
        }
        Ok(())
    }

    pub async fn count_linked_clients(
        conn: &mut PgConnection,
        id: &[u8],
    ) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM client_links WHERE left_id = $1 OR right_id = $1",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await?)
    }

    pub async fn get_linked_clients(
        conn: &mut PgConnection,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(sqlx::query_as::<_, Client>(
            r#"
            SELECT c.id, c.name, c.key FROM clients c
            JOIN client_links l
              ON (l.left_id = $1 AND c.id = l.right_id)
              OR (l.right_id = $1 AND c.id = l.left_id)
            ORDER BY c.name ASC LIMIT $2 OFFSET $3
            "#,
        )
        .bind(id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn ensure_client_exists(
        conn: &mut PgConnection,
        id: &[u8],
    ) -> Result<(), StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM clients WHERE id = $1)")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
        if !exists {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn ensure_topic_exists(
        conn: &mut PgConnection,
        topic: &str,
    ) -> Result<(), StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM topic_keys WHERE topic = $1)")
                .bind(topic)
                .fetch_one(&mut *conn)
                .await?;
        if !exists {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
