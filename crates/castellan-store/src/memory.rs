//! In-memory store for tests.
//!
//! Implements the full [`KeyStore`] contract with the same semantics as the
//! SQL backends, plus page-read counters and write-failure injection for
//! verifying the service's batching and ordering behaviour.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    check_bounds, Client, KeyStore, StoreError, StoreTx, TopicKey, TxOptions,
};

#[derive(Debug, Default, Clone)]
struct State {
    clients: BTreeMap<Vec<u8>, Client>,
    topics: BTreeMap<String, TopicKey>,
    subscriptions: BTreeSet<(Vec<u8>, String)>,
    links: BTreeSet<(Vec<u8>, Vec<u8>)>,
}

#[derive(Default)]
struct Counters {
    topic_page_reads: AtomicUsize,
    range_page_reads: AtomicUsize,
    linked_page_reads: AtomicUsize,
}

/// In-memory [`KeyStore`].
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    counters: Arc<Counters>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_clients_for_topic` calls so far.
    pub fn topic_page_reads(&self) -> usize {
        self.counters.topic_page_reads.load(Ordering::SeqCst)
    }

    /// Number of `get_clients_range` calls so far.
    pub fn range_page_reads(&self) -> usize {
        self.counters.range_page_reads.load(Ordering::SeqCst)
    }

    /// Number of `get_linked_clients_for_client_by_id` calls so far.
    pub fn linked_page_reads(&self) -> usize {
        self.counters.linked_page_reads.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_client(&self, name: &str, id: &[u8], key: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::insert_client(&mut self.state.lock(), name, id, key)
    }

    async fn get_client_by_id(&self, id: &[u8]) -> Result<Client, StoreError> {
        ops::get_client_by_id(&self.state.lock(), id)
    }

    async fn delete_client_by_id(&self, id: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::delete_client_by_id(&mut self.state.lock(), id)
    }

    async fn count_clients(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().clients.len() as i64)
    }

    async fn insert_topic_key(&self, topic: &str, key: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::insert_topic_key(&mut self.state.lock(), topic, key)
    }

    async fn get_topic_key(&self, topic: &str) -> Result<TopicKey, StoreError> {
        ops::get_topic_key(&self.state.lock(), topic)
    }

    async fn delete_topic_key(&self, topic: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::delete_topic_key(&mut self.state.lock(), topic)
    }

    async fn count_topic_keys(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().topics.len() as i64)
    }

    async fn link_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::link_client_topic(&mut self.state.lock(), client_id, topic)
    }

    async fn unlink_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::unlink_client_topic(&mut self.state.lock(), client_id, topic)
    }

    async fn count_clients_for_topic(&self, topic: &str) -> Result<i64, StoreError> {
        Ok(ops::clients_for_topic(&self.state.lock(), topic).len() as i64)
    }

    async fn count_topics_for_client_by_id(&self, id: &[u8]) -> Result<i64, StoreError> {
        Ok(ops::topics_for_client(&self.state.lock(), id).len() as i64)
    }

    async fn get_clients_for_topic(
        &self,
        topic: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        self.counters.topic_page_reads.fetch_add(1, Ordering::SeqCst);
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::clients_for_topic(&self.state.lock(), topic), offset, limit))
    }

    async fn get_topics_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::topics_for_client(&self.state.lock(), id), offset, limit))
    }

    async fn get_clients_range(&self, offset: i64, limit: i64) -> Result<Vec<Client>, StoreError> {
        self.counters.range_page_reads.fetch_add(1, Ordering::SeqCst);
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::all_clients(&self.state.lock()), offset, limit))
    }

    async fn get_topics_range(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::all_topics(&self.state.lock()), offset, limit))
    }

    async fn link_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::link_client(&mut self.state.lock(), id1, id2)
    }

    async fn unlink_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::unlink_client(&mut self.state.lock(), id1, id2)
    }

    async fn count_linked_clients(&self, id: &[u8]) -> Result<i64, StoreError> {
        Ok(ops::linked_clients(&self.state.lock(), id).len() as i64)
    }

    async fn get_linked_clients_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        self.counters.linked_page_reads.fetch_add(1, Ordering::SeqCst);
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::linked_clients(&self.state.lock(), id), offset, limit))
    }

    async fn begin_tx(&self, _opts: TxOptions) -> Result<Box<dyn StoreTx>, StoreError> {
        let staged = self.state.lock().clone();
        Ok(Box::new(MemoryTx {
            base: Arc::clone(&self.state),
            staged: Mutex::new(staged),
            fail_writes: Arc::clone(&self.fail_writes),
        }))
    }
}

/// A staged copy of the store; committed by swapping it back in.
pub struct MemoryTx {
    base: Arc<Mutex<State>>,
    staged: Mutex<State>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryTx {
    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for MemoryTx {
    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_client(&self, name: &str, id: &[u8], key: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::insert_client(&mut self.staged.lock(), name, id, key)
    }

    async fn get_client_by_id(&self, id: &[u8]) -> Result<Client, StoreError> {
        ops::get_client_by_id(&self.staged.lock(), id)
    }

    async fn delete_client_by_id(&self, id: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::delete_client_by_id(&mut self.staged.lock(), id)
    }

    async fn count_clients(&self) -> Result<i64, StoreError> {
        Ok(self.staged.lock().clients.len() as i64)
    }

    async fn insert_topic_key(&self, topic: &str, key: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::insert_topic_key(&mut self.staged.lock(), topic, key)
    }

    async fn get_topic_key(&self, topic: &str) -> Result<TopicKey, StoreError> {
        ops::get_topic_key(&self.staged.lock(), topic)
    }

    async fn delete_topic_key(&self, topic: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::delete_topic_key(&mut self.staged.lock(), topic)
    }

    async fn count_topic_keys(&self) -> Result<i64, StoreError> {
        Ok(self.staged.lock().topics.len() as i64)
    }

    async fn link_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::link_client_topic(&mut self.staged.lock(), client_id, topic)
    }

    async fn unlink_client_topic(&self, client_id: &[u8], topic: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::unlink_client_topic(&mut self.staged.lock(), client_id, topic)
    }

    async fn count_clients_for_topic(&self, topic: &str) -> Result<i64, StoreError> {
        Ok(ops::clients_for_topic(&self.staged.lock(), topic).len() as i64)
    }

    async fn count_topics_for_client_by_id(&self, id: &[u8]) -> Result<i64, StoreError> {
        Ok(ops::topics_for_client(&self.staged.lock(), id).len() as i64)
    }

    async fn get_clients_for_topic(
        &self,
        topic: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::clients_for_topic(&self.staged.lock(), topic), offset, limit))
    }

    async fn get_topics_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::topics_for_client(&self.staged.lock(), id), offset, limit))
    }

    async fn get_clients_range(&self, offset: i64, limit: i64) -> Result<Vec<Client>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::all_clients(&self.staged.lock()), offset, limit))
    }

    async fn get_topics_range(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TopicKey>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::all_topics(&self.staged.lock()), offset, limit))
    }

    async fn link_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::link_client(&mut self.staged.lock(), id1, id2)
    }

    async fn unlink_client(&self, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        ops::unlink_client(&mut self.staged.lock(), id1, id2)
    }

    async fn count_linked_clients(&self, id: &[u8]) -> Result<i64, StoreError> {
        Ok(ops::linked_clients(&self.staged.lock(), id).len() as i64)
    }

    async fn get_linked_clients_for_client_by_id(
        &self,
        id: &[u8],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Client>, StoreError> {
        check_bounds(offset, limit)?;
        Ok(ops::page(ops::linked_clients(&self.staged.lock(), id), offset, limit))
    }

    async fn begin_tx(&self, _opts: TxOptions) -> Result<Box<dyn StoreTx>, StoreError> {
        Err(StoreError::NestedTx)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        *this.base.lock() = this.staged.into_inner();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

mod ops {
    use super::*;
    use crate::normalize_pair;

    pub fn insert_client(
        state: &mut State,
        name: &str,
        id: &[u8],
        key: &[u8],
    ) -> Result<(), StoreError> {
        state.clients.insert(
            id.to_vec(),
            Client {
                id: id.to_vec(),
                name: name.to_string(),
                key: key.to_vec(),
            },
        );
        Ok(())
    }

    pub fn get_client_by_id(state: &State, id: &[u8]) -> Result<Client, StoreError> {
        state.clients.get(id).cloned().ok_or(StoreError::NotFound)
    }

    pub fn delete_client_by_id(state: &mut State, id: &[u8]) -> Result<(), StoreError> {
        if state.clients.remove(id).is_none() {
            return Err(StoreError::NotFound);
        }
        state.subscriptions.retain(|(cid, _)| cid != id);
        state.links.retain(|(left, right)| left != id && right != id);
        Ok(())
    }

    pub fn insert_topic_key(state: &mut State, topic: &str, key: &[u8]) -> Result<(), StoreError> {
        state.topics.insert(
            topic.to_string(),
            TopicKey {
                topic: topic.to_string(),
                key: key.to_vec(),
            },
        );
        Ok(())
    }

    pub fn get_topic_key(state: &State, topic: &str) -> Result<TopicKey, StoreError> {
        state.topics.get(topic).cloned().ok_or(StoreError::NotFound)
    }

    pub fn delete_topic_key(state: &mut State, topic: &str) -> Result<(), StoreError> {
        if state.topics.remove(topic).is_none() {
            return Err(StoreError::NotFound);
        }
        state.subscriptions.retain(|(_, t)| t != topic);
        Ok(())
    }

    pub fn link_client_topic(
        state: &mut State,
        client_id: &[u8],
        topic: &str,
    ) -> Result<(), StoreError> {
        if !state.clients.contains_key(client_id) || !state.topics.contains_key(topic) {
            return Err(StoreError::NotFound);
        }
        state
            .subscriptions
            .insert((client_id.to_vec(), topic.to_string()));
        Ok(())
    }

    pub fn unlink_client_topic(
        state: &mut State,
        client_id: &[u8],
        topic: &str,
    ) -> Result<(), StoreError> {
        let removed = state
            .subscriptions
            .remove(&(client_id.to_vec(), topic.to_string()));
        if !removed
            && (!state.clients.contains_key(client_id) || !state.topics.contains_key(topic))
        {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn link_client(state: &mut State, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        if id1 == id2 {
            return Err(StoreError::SelfLink);
        }
        if !state.clients.contains_key(id1) || !state.clients.contains_key(id2) {
            return Err(StoreError::NotFound);
        }
        let (left, right) = normalize_pair(id1, id2);
        state.links.insert((left.to_vec(), right.to_vec()));
        Ok(())
    }

    pub fn unlink_client(state: &mut State, id1: &[u8], id2: &[u8]) -> Result<(), StoreError> {
        if id1 == id2 {
            return Err(StoreError::SelfLink);
        }
        let (left, right) = normalize_pair(id1, id2);
        let removed = state.links.remove(&(left.to_vec(), right.to_vec()));
        if !removed && (!state.clients.contains_key(id1) || !state.clients.contains_key(id2)) {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn clients_for_topic(state: &State, topic: &str) -> Vec<Client> {
        let mut clients: Vec<Client> = state
            .subscriptions
            .iter()
            .filter(|(_, t)| t == topic)
            .filter_map(|(id, _)| state.clients.get(id).cloned())
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        clients
    }

    pub fn topics_for_client(state: &State, id: &[u8]) -> Vec<TopicKey> {
        let mut topics: Vec<TopicKey> = state
            .subscriptions
            .iter()
            .filter(|(cid, _)| cid == id)
            .filter_map(|(_, t)| state.topics.get(t).cloned())
            .collect();
        topics.sort_by(|a, b| a.topic.cmp(&b.topic));
        topics
    }

    pub fn all_clients(state: &State) -> Vec<Client> {
        let mut clients: Vec<Client> = state.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        clients
    }

    pub fn all_topics(state: &State) -> Vec<TopicKey> {
        let mut topics: Vec<TopicKey> = state.topics.values().cloned().collect();
        topics.sort_by(|a, b| a.topic.cmp(&b.topic));
        topics
    }

    pub fn linked_clients(state: &State, id: &[u8]) -> Vec<Client> {
        let mut clients: Vec<Client> = state
            .links
            .iter()
            .filter_map(|(left, right)| {
                if left == id {
                    state.clients.get(right).cloned()
                } else if right == id {
                    state.clients.get(left).cloned()
                } else {
                    None
                }
            })
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        clients
    }

    pub fn page<T>(rows: Vec<T>, offset: i64, limit: i64) -> Vec<T> {
        rows.into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect()
    }
}
