//! Connection wrapper and live-connection registry.
//!
//! Fan-out workers and the command executor both write frames, so every
//! write goes through the connection's write mutex. Reads are only ever
//! issued by the owning executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Serialized wrapper around one client's WebSocket.
pub struct Connection {
    id: ConnectionId,
    writer: Mutex<SplitSink<WebSocket, Message>>,
    reader: Mutex<SplitStream<WebSocket>>,
    closed: AtomicBool,
    connected_at: i64,
}

impl Connection {
    pub fn new(socket: WebSocket) -> Self {
        let (writer, reader) = socket.split();
        Self {
            id: Uuid::new_v4(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            closed: AtomicBool::new(false),
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Milliseconds since epoch at which the connection was accepted.
    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    /// Write one text frame. Safe for any number of concurrent callers;
    /// writes are mutually exclusive.
    pub async fn write_text(&self, text: impl Into<Utf8Bytes>) -> Result<()> {
        self.write(Message::Text(text.into())).await
    }

    /// Write one frame under the write mutex.
    pub async fn write(&self, frame: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(frame).await.map_err(GatewayError::from)
    }

    /// Read the next data frame. Ping/pong control frames are skipped; a
    /// close frame or end of stream yields [`GatewayError::Closed`].
    ///
    /// Only the owning executor may call this.
    pub async fn read_next(&self) -> Result<Message> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(GatewayError::Closed),
                Some(Ok(frame)) => return Ok(frame),
                Some(Err(e)) => {
                    if self.closed.load(Ordering::Acquire) {
                        return Err(GatewayError::Closed);
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Close the transport. Idempotent; subsequent reads and writes fail
    /// with [`GatewayError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

/// Live-connection registry. Fan-out looks connections up by id, so it
/// never holds a reference across a disconnect.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<Connection>) -> ConnectionId {
        let id = connection.id();
        self.connections.insert(id, connection);
        debug!(connection = %id, "connection registered");
        id
    }

    pub fn unregister(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            debug!(connection = %id, "connection unregistered");
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| c.clone())
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}
