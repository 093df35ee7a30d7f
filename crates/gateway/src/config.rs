//! Gateway configuration.
//!
//! The `websockets` section of a TOML file (default: `gateway.toml`), with
//! environment overrides using the `GATEWAY__` prefix and double
//! underscores for nesting, e.g. `GATEWAY__WEBSOCKETS__POOL__NUM_WORKERS=4`.

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::{GatewayError, Result};

/// Default HTTP path for the WebSocket endpoint.
pub const DEFAULT_PATH: &str = "/ws";

/// Default broker driver key.
pub const DEFAULT_BROKER: &str = "memory";

/// Default fan-out queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Environment override prefix.
const ENV_PREFIX: &str = "GATEWAY";

/// Root of the configuration file. The gateway is a no-op when the
/// `websockets` section is absent.
#[derive(Debug, Clone, Default, Deserialize)]
struct Root {
    websockets: Option<GatewayConfig>,
}

/// The `websockets` configuration section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP path the WebSocket endpoint is served on.
    pub path: String,
    /// Broker driver key, resolved against the driver registry.
    pub broker: String,
    /// Origin allow-list: literal origins or `*`.
    pub allowed_origins: Vec<String>,
    /// Number of fan-out workers. 0 means available parallelism.
    pub fanout_workers: usize,
    /// Capacity of the bounded fan-out queue.
    pub fanout_queue_capacity: usize,
    /// Application worker pool settings.
    pub pool: PoolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            broker: DEFAULT_BROKER.to_string(),
            allowed_origins: vec!["*".to_string()],
            fanout_workers: 0,
            fanout_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pool: PoolConfig::default(),
        }
    }
}

/// Application worker pool settings, handed to the worker factory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of application workers. 0 means available parallelism.
    pub num_workers: usize,
    /// Jobs a worker may execute before being recycled. 0 disables.
    pub max_jobs: usize,
    /// Seconds to wait for a free worker.
    pub allocate_timeout: u64,
    /// Seconds to wait for workers to finish on destroy.
    pub destroy_timeout: u64,
    /// Debug mode: allocate a worker per request.
    pub debug: bool,
    /// Worker supervision limits.
    pub supervisor: SupervisorConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            max_jobs: 0,
            allocate_timeout: 60,
            destroy_timeout: 60,
            debug: false,
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Worker supervision limits. Zero disables the corresponding check.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds between supervision sweeps.
    pub watch_tick: u64,
    /// Worker time-to-live in seconds.
    pub ttl: u64,
    /// Maximum worker idle time in seconds.
    pub idle_ttl: u64,
    /// Maximum worker memory in megabytes.
    pub max_worker_memory: u64,
    /// Maximum single-job execution time in seconds.
    pub exec_ttl: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watch_tick: 1,
            ttl: 0,
            idle_ttl: 0,
            max_worker_memory: 0,
            exec_ttl: 0,
        }
    }
}

impl GatewayConfig {
    /// Load the `websockets` section from `path` (optional file) plus
    /// environment overrides. Returns [`GatewayError::Disabled`] when the
    /// section is absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path).format(FileFormat::Toml).required(false),
            );
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let root: Root = builder
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let cfg = root.websockets.ok_or(GatewayError::Disabled)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        if self.broker.is_empty() {
            return Err(GatewayError::Config("broker key is empty".to_string()));
        }
        if self.fanout_queue_capacity == 0 {
            return Err(GatewayError::Config(
                "fanout_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved fan-out worker count.
    pub fn fanout_workers(&self) -> usize {
        resolve_workers(self.fanout_workers)
    }
}

impl PoolConfig {
    /// Resolved application worker count.
    pub fn num_workers(&self) -> usize {
        resolve_workers(self.num_workers)
    }

    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_secs(self.allocate_timeout)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.destroy_timeout)
    }
}

fn resolve_workers(configured: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
