//! SQLite backend integration tests, run against an in-memory database.

use castellan_store::{KeyStore, SqliteStore, StoreError, TxOptions};

async fn store() -> SqliteStore {
    let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    store.migrate().await.unwrap();
    store
}

fn id(n: u8) -> Vec<u8> {
    vec![n; 16]
}

fn key(n: u8) -> Vec<u8> {
    vec![n; 60]
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let store = store().await;
    store.migrate().await.unwrap();
    store.migrate().await.unwrap();
}

#[tokio::test]
async fn insert_client_upserts_by_id() {
    let store = store().await;

    store.insert_client("alice", &id(1), &key(1)).await.unwrap();
    store.insert_client("alice", &id(1), &key(2)).await.unwrap();

    let client = store.get_client_by_id(&id(1)).await.unwrap();
    assert_eq!(client.name, "alice");
    assert_eq!(client.key, key(2));
    assert_eq!(store.count_clients().await.unwrap(), 1);
}

#[tokio::test]
async fn get_missing_client_is_not_found() {
    let store = store().await;
    assert!(matches!(
        store.get_client_by_id(&id(9)).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn delete_client_cascades_to_edges() {
    let store = store().await;

    store.insert_client("alice", &id(1), &key(1)).await.unwrap();
    store.insert_client("bob", &id(2), &key(2)).await.unwrap();
    store.insert_topic_key("news", &key(3)).await.unwrap();
    store.link_client_topic(&id(1), "news").await.unwrap();
    store.link_client(&id(1), &id(2)).await.unwrap();

    store.delete_client_by_id(&id(1)).await.unwrap();

    assert_eq!(store.count_topics_for_client_by_id(&id(1)).await.unwrap(), 0);
    assert_eq!(store.count_linked_clients(&id(1)).await.unwrap(), 0);
    assert_eq!(store.count_linked_clients(&id(2)).await.unwrap(), 0);
    assert_eq!(store.count_clients_for_topic("news").await.unwrap(), 0);

    assert!(matches!(
        store.delete_client_by_id(&id(1)).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn delete_topic_cascades_to_subscriptions() {
    let store = store().await;

    store.insert_client("alice", &id(1), &key(1)).await.unwrap();
    store.insert_topic_key("news", &key(3)).await.unwrap();
    store.link_client_topic(&id(1), "news").await.unwrap();

    store.delete_topic_key("news").await.unwrap();
    assert_eq!(store.count_topics_for_client_by_id(&id(1)).await.unwrap(), 0);

    // Second delete reports the missing row.
    assert!(matches!(
        store.delete_topic_key("news").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn link_client_topic_checks_endpoints_and_is_idempotent() {
    let store = store().await;

    store.insert_client("alice", &id(1), &key(1)).await.unwrap();
    store.insert_topic_key("news", &key(3)).await.unwrap();

    assert!(matches!(
        store.link_client_topic(&id(9), "news").await,
        Err(StoreError::NotFound)
    ));
    assert!(matches!(
        store.link_client_topic(&id(1), "missing").await,
        Err(StoreError::NotFound)
    ));

    store.link_client_topic(&id(1), "news").await.unwrap();
    store.link_client_topic(&id(1), "news").await.unwrap();
    assert_eq!(store.count_clients_for_topic("news").await.unwrap(), 1);

    store.unlink_client_topic(&id(1), "news").await.unwrap();
    store.unlink_client_topic(&id(1), "news").await.unwrap();
    assert!(matches!(
        store.unlink_client_topic(&id(1), "missing").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn client_links_are_symmetric() {
    let store = store().await;

    store.insert_client("alice", &id(1), &key(1)).await.unwrap();
    store.insert_client("bob", &id(2), &key(2)).await.unwrap();

    // Either argument order resolves to the same stored pair.
    store.link_client(&id(2), &id(1)).await.unwrap();
    store.link_client(&id(1), &id(2)).await.unwrap();
    assert_eq!(store.count_linked_clients(&id(1)).await.unwrap(), 1);
    assert_eq!(store.count_linked_clients(&id(2)).await.unwrap(), 1);

    let linked = store
        .get_linked_clients_for_client_by_id(&id(1), 0, 10)
        .await
        .unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].name, "bob");

    store.unlink_client(&id(1), &id(2)).await.unwrap();
    assert_eq!(store.count_linked_clients(&id(1)).await.unwrap(), 0);

    assert!(matches!(
        store.link_client(&id(1), &id(1)).await,
        Err(StoreError::SelfLink)
    ));
    assert!(matches!(
        store.link_client(&id(1), &id(9)).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn ranges_are_ordered_and_paged() {
    let store = store().await;

    for (n, name) in [(1u8, "carol"), (2, "alice"), (3, "bob")] {
        store.insert_client(name, &id(n), &key(n)).await.unwrap();
    }
    store.insert_topic_key("t/b", &key(4)).await.unwrap();
    store.insert_topic_key("t/a", &key(5)).await.unwrap();

    let clients = store.get_clients_range(0, 10).await.unwrap();
    let names: Vec<&str> = clients.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["alice", "bob", "carol"]);

    let page = store.get_clients_range(1, 1).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].name, "bob");

    let topics = store.get_topics_range(0, 10).await.unwrap();
    let names: Vec<&str> = topics.iter().map(|t| t.topic.as_str()).collect();
    assert_eq!(names, vec!["t/a", "t/b"]);
}

#[tokio::test]
async fn topic_membership_queries_agree_with_counts() {
    let store = store().await;

    for (n, name) in [(1u8, "alice"), (2, "bob"), (3, "carol")] {
        store.insert_client(name, &id(n), &key(n)).await.unwrap();
    }
    store.insert_topic_key("news", &key(4)).await.unwrap();
    store.link_client_topic(&id(1), "news").await.unwrap();
    store.link_client_topic(&id(3), "news").await.unwrap();

    assert_eq!(store.count_clients_for_topic("news").await.unwrap(), 2);
    let members = store.get_clients_for_topic("news", 0, 10).await.unwrap();
    let names: Vec<&str> = members.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["alice", "carol"]);

    let topics = store
        .get_topics_for_client_by_id(&id(1), 0, 10)
        .await
        .unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].topic, "news");
}

#[tokio::test]
async fn empty_ranges_return_empty_vectors() {
    let store = store().await;
    assert!(store.get_clients_range(0, 10).await.unwrap().is_empty());
    assert!(store.get_topics_range(0, 10).await.unwrap().is_empty());
    assert!(store
        .get_clients_for_topic("none", 0, 10)
        .await
        .unwrap()
        .is_empty());
    assert!(store
        .get_linked_clients_for_client_by_id(&id(1), 0, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn invalid_bounds_are_rejected() {
    let store = store().await;
    assert!(matches!(
        store.get_clients_range(-1, 10).await,
        Err(StoreError::InvalidBounds { .. })
    ));
    assert!(matches!(
        store.get_topics_range(0, 0).await,
        Err(StoreError::InvalidBounds { .. })
    ));
}

#[tokio::test]
async fn tx_commit_persists_changes() {
    let store = store().await;

    let tx = store.begin_tx(TxOptions::default()).await.unwrap();
    tx.insert_topic_key("news", &key(1)).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(store.get_topic_key("news").await.unwrap().topic, "news");
}

#[tokio::test]
async fn tx_rollback_discards_changes() {
    let store = store().await;

    let tx = store.begin_tx(TxOptions::default()).await.unwrap();
    tx.insert_topic_key("news", &key(1)).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(matches!(
        store.get_topic_key("news").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn nested_tx_is_rejected() {
    let store = store().await;
    let tx = store.begin_tx(TxOptions::default()).await.unwrap();
    assert!(matches!(
        tx.begin_tx(TxOptions::default()).await.map(|_| ()),
        Err(StoreError::NestedTx)
    ));
    tx.rollback().await.unwrap();
}
