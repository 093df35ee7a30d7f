//! Per-connection command loop.
//!
//! One executor owns each connection: it reads client commands in order,
//! runs topic admission, keeps the broker registration and the topic index
//! in step, and answers every command on the same connection. The loop
//! exits on peer close, transport error, or gateway shutdown; `clean_up`
//! then releases everything the connection held.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use axum::extract::ws::Message;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{GatewayError, Result};
use crate::protocol::{ClientCommand, Reply};
use crate::topics::TopicIndex;
use crate::validator::{AccessValidator, RequestMeta};
use pubsub::SubReader;

pub struct CommandExecutor {
    connection: Arc<Connection>,
    meta: Arc<RequestMeta>,
    validator: Arc<AccessValidator>,
    broker: Arc<dyn SubReader>,
    index: Arc<TopicIndex>,
    cancel: CancellationToken,
    // topics this connection currently holds; drained by clean_up
    held: Mutex<HashSet<String>>,
}

impl CommandExecutor {
    pub fn new(
        connection: Arc<Connection>,
        meta: Arc<RequestMeta>,
        validator: Arc<AccessValidator>,
        broker: Arc<dyn SubReader>,
        index: Arc<TopicIndex>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection,
            meta,
            validator,
            broker,
            index,
            cancel,
            held: Mutex::new(HashSet::new()),
        }
    }

    fn id(&self) -> Uuid {
        self.connection.id()
    }

    /// Drive the command loop to completion. Returns `Ok` on peer close or
    /// shutdown, `Err` on transport or broker failure.
    pub async fn run(&self) -> Result<()> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                frame = self.connection.read_next() => frame,
            };

            match frame {
                Ok(frame) => self.handle_frame(frame).await?,
                Err(GatewayError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_frame(&self, frame: Message) -> Result<()> {
        let command = match &frame {
            Message::Text(text) => serde_json::from_str::<ClientCommand>(text.as_str()),
            Message::Binary(data) => serde_json::from_slice::<ClientCommand>(data.as_ref()),
            // ping/pong/close never reach here
            _ => return Ok(()),
        };

        match command {
            Ok(command) => self.handle_command(command).await,
            Err(e) => {
                debug!(connection = %self.id(), error = %e, "malformed command");
                self.reply(Reply::error(400, Vec::new())).await
            }
        }
    }

    async fn handle_command(&self, command: ClientCommand) -> Result<()> {
        counter!("gateway_commands_total").increment(1);
        match command {
            ClientCommand::Join { topics } => self.join(topics).await,
            ClientCommand::Leave { topics } => self.leave(topics).await,
            ClientCommand::Headers { headers } => {
                self.meta.set_headers(headers);
                self.reply(Reply::ok(self.current_topics())).await
            }
        }
    }

    async fn join(&self, topics: Vec<String>) -> Result<()> {
        match self.validator.validate_topics(&self.meta, &topics).await {
            Ok(_) => {}
            Err(GatewayError::AuthDenied { status }) => {
                counter!("gateway_join_denied_total").increment(1);
                debug!(connection = %self.id(), ?topics, status, "join denied");
                return self.reply(Reply::error(status, topics)).await;
            }
            Err(e) => {
                warn!(connection = %self.id(), error = %e, "topic validation failed");
                return self.reply(Reply::error(400, topics)).await;
            }
        }

        // the broker driver is authoritative; the index mirrors it
        self.broker.subscribe(self.id(), &topics).await?;
        self.index.subscribe(self.id(), &topics);
        {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            held.extend(topics.iter().cloned());
        }

        counter!("gateway_joins_total").increment(topics.len() as u64);
        self.reply(Reply::ok(self.current_topics())).await
    }

    async fn leave(&self, topics: Vec<String>) -> Result<()> {
        self.broker.unsubscribe(self.id(), &topics).await?;
        self.index.unsubscribe(self.id(), &topics);
        {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            for topic in &topics {
                held.remove(topic);
            }
        }

        self.reply(Reply::ok(self.current_topics())).await
    }

    /// Release everything the connection holds. Idempotent and best-effort:
    /// broker failures are logged per topic and iteration continues.
    pub async fn clean_up(&self) {
        let held: Vec<String> = {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            held.drain().collect()
        };

        for topic in &held {
            if let Err(e) = self
                .broker
                .unsubscribe(self.id(), std::slice::from_ref(topic))
                .await
            {
                warn!(connection = %self.id(), topic, error = %e, "cleanup unsubscribe failed");
            }
        }

        self.index.remove_connection(self.id());
        self.connection.close().await;
    }

    fn current_topics(&self) -> Vec<String> {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    async fn reply(&self, reply: Reply) -> Result<()> {
        let json = serde_json::to_string(&reply)?;
        self.connection.write_text(json).await
    }
}
