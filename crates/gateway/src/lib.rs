//! WebSocket gateway bridging clients to a server-side message bus.
//!
//! Clients open a long-lived WebSocket on the configured path, join named
//! topics, and receive every message published on them. Connection and
//! topic admission are delegated to an external application worker pool.
//!
//! ## Architecture
//!
//! ```text
//! broker Reader
//!         ↓
//! FanOutPool (bounded queue, N workers)
//!         ↓ TopicIndex snapshot
//! ConnectionRegistry → Connection (write mutex)
//!
//! HTTP upgrade → origin policy → AccessValidator (server mode)
//!         ↓
//! CommandExecutor (join/leave/headers) → broker Subscriber + TopicIndex
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod protocol;
pub mod topics;
pub mod validator;
pub mod workers;
pub mod ws_server;

pub use config::{GatewayConfig, PoolConfig, SupervisorConfig};
pub use connection::{Connection, ConnectionId, ConnectionRegistry};
pub use error::{GatewayError, Result};
pub use executor::CommandExecutor;
pub use fanout::FanOutPool;
pub use protocol::{ClientCommand, Reply};
pub use topics::TopicIndex;
pub use validator::{AccessDecision, AccessValidator, RequestMeta};
pub use workers::{Payload, PayloadPool, StaticWorkerFactory, WorkerFactory, WorkerPool};
pub use ws_server::Gateway;
