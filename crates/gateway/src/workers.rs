//! Application worker pool surface and payload recycling.
//!
//! The pool that answers authorization queries is an external collaborator;
//! the gateway only shapes payloads for it. Scratch payloads are recycled
//! through a free-list so the authorization hot path does not allocate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::PoolConfig;

/// Environment variable selecting the worker operating mode.
pub const RR_MODE: &str = "RR_MODE";

/// Environment variable carrying the configured gateway path.
pub const RR_BROADCAST_PATH: &str = "RR_BROADCAST_PATH";

/// Initial capacity for recycled payload buffers.
const SLOT_CAPACITY: usize = 100;

/// One worker exchange: a serialized request context plus a raw body.
#[derive(Debug, Default)]
pub struct Payload {
    pub context: Vec<u8>,
    pub body: Vec<u8>,
}

impl Payload {
    fn with_capacity() -> Self {
        Self {
            context: Vec::with_capacity(SLOT_CAPACITY),
            body: Vec::with_capacity(SLOT_CAPACITY),
        }
    }
}

/// Free-list of scratch payloads, safe for concurrent get/put.
#[derive(Default)]
pub struct PayloadPool {
    slots: Mutex<Vec<Payload>>,
}

impl PayloadPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Payload {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(Payload::with_capacity)
    }

    /// Return a slot. Both buffers are reset to zero length; capacity is
    /// kept for reuse.
    pub fn put(&self, mut payload: Payload) {
        payload.context.clear();
        payload.body.clear();
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
    }
}

/// The external pool of application processes answering authorization
/// queries. Assumed safe for concurrent use.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Execute one exchange on a worker.
    async fn exec(&self, payload: Payload) -> anyhow::Result<Payload>;

    /// Replace all workers in place, letting in-flight jobs finish.
    async fn reset(&self) -> anyhow::Result<()>;

    /// Number of live workers, for introspection.
    fn workers(&self) -> usize;
}

/// Builds worker pools for the gateway.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn new_pool(
        &self,
        cfg: &PoolConfig,
        env: HashMap<String, String>,
    ) -> anyhow::Result<Arc<dyn WorkerPool>>;
}

/// Development pool that admits every query with status 200. Stands in
/// when no application server is wired up.
pub struct StaticWorkerPool {
    workers: usize,
}

#[async_trait]
impl WorkerPool for StaticWorkerPool {
    async fn exec(&self, mut payload: Payload) -> anyhow::Result<Payload> {
        payload.context.clear();
        payload.context.extend_from_slice(br#"{"headers":{},"status":200}"#);
        payload.body.clear();
        Ok(payload)
    }

    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn workers(&self) -> usize {
        self.workers
    }
}

/// Factory for [`StaticWorkerPool`].
#[derive(Default)]
pub struct StaticWorkerFactory;

#[async_trait]
impl WorkerFactory for StaticWorkerFactory {
    async fn new_pool(
        &self,
        cfg: &PoolConfig,
        _env: HashMap<String, String>,
    ) -> anyhow::Result<Arc<dyn WorkerPool>> {
        Ok(Arc::new(StaticWorkerPool {
            workers: cfg.num_workers(),
        }))
    }
}
