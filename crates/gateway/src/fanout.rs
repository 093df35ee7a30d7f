//! Broker-to-client fan-out pool.
//!
//! A single producer (the gateway's serve loop) enqueues broker messages
//! onto a bounded queue; a fixed set of workers drains it and writes each
//! message to every subscribed connection. The bounded queue is the
//! backpressure contract: a full queue blocks the producer and throttles
//! the broker read loop.

use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::ConnectionRegistry;
use crate::error::{GatewayError, Result};
use crate::topics::TopicIndex;
use pubsub::Message;

pub struct FanOutPool {
    queue: async_channel::Sender<Message>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl FanOutPool {
    /// Spawn `workers` dispatch tasks over a queue of `capacity` messages.
    pub fn new(
        workers: usize,
        capacity: usize,
        registry: Arc<ConnectionRegistry>,
        index: Arc<TopicIndex>,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);

        let handles = (0..workers)
            .map(|worker| {
                let rx: async_channel::Receiver<Message> = rx.clone();
                let registry = registry.clone();
                let index = index.clone();
                tokio::spawn(async move {
                    while let Ok(msg) = rx.recv().await {
                        dispatch(&registry, &index, msg).await;
                    }
                    debug!(worker, "fan-out worker drained");
                })
            })
            .collect();

        Self {
            queue: tx,
            workers: std::sync::Mutex::new(handles),
        }
    }

    /// Enqueue one broker message. Waits while the queue is full.
    pub async fn queue(&self, msg: Message) -> Result<()> {
        self.queue
            .send(msg)
            .await
            .map_err(|_| GatewayError::ChannelSend)
    }

    /// Close the queue, let the workers drain it, and wait for them.
    /// Idempotent; later calls find nothing left to join.
    pub async fn stop(&self) {
        self.queue.close();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Deliver one message to every connection subscribed to its topic.
/// Per-recipient failures are logged and do not abort the rest; the dead
/// connection's own read loop observes the failure independently.
async fn dispatch(registry: &ConnectionRegistry, index: &TopicIndex, msg: Message) {
    let members = index.members_of(msg.topic());
    if members.is_empty() {
        trace!(topic = msg.topic(), "no subscribers, message dropped");
        return;
    }

    // broker payloads go out as text frames
    let text: Utf8Bytes = match std::str::from_utf8(msg.payload()) {
        Ok(text) => text.to_string().into(),
        Err(_) => String::from_utf8_lossy(msg.payload()).into_owned().into(),
    };

    for id in members {
        let Some(connection) = registry.get(id) else {
            // raced with a disconnect
            continue;
        };
        match connection.write_text(text.clone()).await {
            Ok(()) => counter!("gateway_fanout_deliveries_total").increment(1),
            Err(e) => {
                counter!("gateway_fanout_send_errors_total").increment(1);
                debug!(connection = %id, topic = msg.topic(), error = %e, "fan-out write failed");
            }
        }
    }
}
