//! Topic membership index.
//!
//! Keeps both directions of the mapping (topic → connections and
//! connection → topics) consistent under one lock, so fan-out lookups and
//! disconnect cleanup are O(1) and never observe half-applied updates.
//! Readers get owned snapshots and iterate without holding the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

#[derive(Default)]
struct Inner {
    by_topic: HashMap<String, HashSet<Uuid>>,
    by_connection: HashMap<Uuid, HashSet<String>>,
}

/// In-process membership map mirroring the broker driver's state.
#[derive(Default)]
pub struct TopicIndex {
    inner: RwLock<Inner>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add the (connection, topic) edges. Idempotent per pair.
    pub fn subscribe(&self, connection_id: Uuid, topics: &[String]) {
        if topics.is_empty() {
            return;
        }
        let mut inner = self.write();
        for topic in topics {
            inner
                .by_topic
                .entry(topic.clone())
                .or_default()
                .insert(connection_id);
            inner
                .by_connection
                .entry(connection_id)
                .or_default()
                .insert(topic.clone());
        }
    }

    /// Remove the listed edges. Missing edges are silently ignored; topic
    /// entries left without members are deleted.
    pub fn unsubscribe(&self, connection_id: Uuid, topics: &[String]) {
        let mut inner = self.write();
        for topic in topics {
            if let Some(members) = inner.by_topic.get_mut(topic) {
                members.remove(&connection_id);
                if members.is_empty() {
                    inner.by_topic.remove(topic);
                }
            }
            if let Some(held) = inner.by_connection.get_mut(&connection_id) {
                held.remove(topic);
                if held.is_empty() {
                    inner.by_connection.remove(&connection_id);
                }
            }
        }
    }

    /// Snapshot of the connections subscribed to `topic`.
    pub fn members_of(&self, topic: &str) -> HashSet<Uuid> {
        self.read()
            .by_topic
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of the topics `connection_id` is subscribed to.
    pub fn topics_of(&self, connection_id: Uuid) -> Vec<String> {
        self.read()
            .by_connection
            .get(&connection_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove the connection from every topic it belongs to.
    pub fn remove_connection(&self, connection_id: Uuid) {
        let mut inner = self.write();
        if let Some(held) = inner.by_connection.remove(&connection_id) {
            for topic in held {
                if let Some(members) = inner.by_topic.get_mut(&topic) {
                    members.remove(&connection_id);
                    if members.is_empty() {
                        inner.by_topic.remove(&topic);
                    }
                }
            }
        }
    }

    /// Number of topics with at least one member.
    pub fn topic_count(&self) -> usize {
        self.read().by_topic.len()
    }

    /// Number of connections holding at least one subscription.
    pub fn connection_count(&self) -> usize {
        self.read().by_connection.len()
    }
}
