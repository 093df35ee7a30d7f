//! In-process broker driver backed by a bounded queue.
//!
//! Membership lives in a sharded concurrent map; published messages flow
//! through a bounded channel that [`Reader::next`] drains. Publishing blocks
//! once the queue is full.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::{BusError, Message, Publisher, Reader, Result, Subscriber};

/// Default capacity of the published-message queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// In-process pub/sub driver.
pub struct MemoryBroker {
    membership: DashMap<String, HashSet<Uuid>>,
    tx: async_channel::Sender<Message>,
    rx: async_channel::Receiver<Message>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            membership: DashMap::new(),
            tx,
            rx,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn subscribe(&self, connection_id: Uuid, topics: &[String]) -> Result<()> {
        for topic in topics {
            self.membership
                .entry(topic.clone())
                .or_default()
                .insert(connection_id);
        }
        Ok(())
    }

    async fn unsubscribe(&self, connection_id: Uuid, topics: &[String]) -> Result<()> {
        for topic in topics {
            if let Some(mut members) = self.membership.get_mut(topic) {
                members.remove(&connection_id);
                if members.is_empty() {
                    drop(members);
                    self.membership
                        .remove_if(topic, |_, members| members.is_empty());
                }
            }
        }
        Ok(())
    }

    fn connections(&self, topic: &str, out: &mut HashSet<Uuid>) {
        if let Some(members) = self.membership.get(topic) {
            out.extend(members.iter());
        }
    }

    fn stop(&self) {
        self.tx.close();
    }
}

#[async_trait]
impl Reader for MemoryBroker {
    async fn next(&self, cancel: &CancellationToken) -> Result<Message> {
        tokio::select! {
            _ = cancel.cancelled() => Err(BusError::Timeout),
            msg = self.rx.recv() => msg.map_err(|_| BusError::Closed),
        }
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| BusError::Closed)
    }

    fn publish_async(&self, msg: Message) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if tx.send(msg).await.is_err() {
                warn!("dropping message published after broker stop");
            }
        });
    }
}
