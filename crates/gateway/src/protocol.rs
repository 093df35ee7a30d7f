//! WebSocket wire protocol.
//!
//! Clients send JSON commands tagged by `command`; the gateway answers with
//! `{status, topics}` frames. Pushed broker messages are raw payloads with
//! no envelope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Command sent by a client. Unknown commands fail deserialization and are
/// rejected without mutating any state.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Join one or more topics. Gated by the topic-mode access validator.
    Join { topics: Vec<String> },
    /// Leave one or more topics. Requires no authorization.
    Leave { topics: Vec<String> },
    /// Replace the header snapshot used by later authorization calls.
    Headers { headers: HashMap<String, String> },
}

/// Reply frame for a processed command.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub status: u16,
    pub topics: Vec<String>,
}

impl Reply {
    /// Successful command: confirms with the current subscription set.
    pub fn ok(mut topics: Vec<String>) -> Self {
        topics.sort();
        Self {
            status: 200,
            topics,
        }
    }

    /// Failed command: echoes the denial status and the requested topics.
    pub fn error(status: u16, topics: Vec<String>) -> Self {
        Self { status, topics }
    }
}
