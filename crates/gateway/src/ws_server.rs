//! Gateway facade and HTTP surface.
//!
//! The router serves the configured WebSocket path plus a small `/status`
//! introspection endpoint; everything else falls through to whatever the
//! host application mounts around it. Admission order on the gateway path:
//! origin policy, server-mode access validation (while response headers can
//! still be written), then the upgrade.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header::ORIGIN, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::{GatewayError, Result};
use crate::executor::CommandExecutor;
use crate::fanout::FanOutPool;
use crate::topics::TopicIndex;
use crate::validator::{AccessValidator, RequestMeta};
use crate::workers::{WorkerFactory, RR_BROADCAST_PATH, RR_MODE};
use pubsub::{BrokerRegistry, BusError, SubReader};

/// The gateway: admission, executor lifecycle, fan-out, shutdown.
pub struct Gateway {
    cfg: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    index: Arc<TopicIndex>,
    broker: Arc<dyn SubReader>,
    validator: Arc<AccessValidator>,
    fanout: FanOutPool,
    cancel: CancellationToken,
}

impl Gateway {
    /// Resolve the broker driver, build the application worker pool, and
    /// spawn the fan-out workers.
    pub async fn new(
        cfg: GatewayConfig,
        brokers: &BrokerRegistry,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<Arc<Self>> {
        let broker = brokers.get_driver(&cfg.broker)?;

        let env = HashMap::from([
            (RR_MODE.to_string(), "http".to_string()),
            (RR_BROADCAST_PATH.to_string(), cfg.path.clone()),
        ]);
        let pool = factory
            .new_pool(&cfg.pool, env)
            .await
            .map_err(|e| GatewayError::AuthBackend(e.to_string()))?;

        let registry = Arc::new(ConnectionRegistry::new());
        let index = Arc::new(TopicIndex::new());
        let fanout = FanOutPool::new(
            cfg.fanout_workers(),
            cfg.fanout_queue_capacity,
            registry.clone(),
            index.clone(),
        );

        Ok(Arc::new(Self {
            cfg,
            registry,
            index,
            broker,
            validator: Arc::new(AccessValidator::new(pool)),
            fanout,
            cancel: CancellationToken::new(),
        }))
    }

    /// Build the HTTP router for this gateway. Merge it into the host
    /// application's router; non-matching paths pass through untouched.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.cfg.path, get(ws_handler))
            .route("/status", get(status_handler))
            .with_state(self.clone())
    }

    /// Start draining the broker. Fatal broker errors arrive on the
    /// returned channel; cancellation ends the loop cleanly.
    pub fn serve(self: &Arc<Self>) -> mpsc::Receiver<GatewayError> {
        let (err_tx, err_rx) = mpsc::channel(1);
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                match gateway.broker.next(&gateway.cancel).await {
                    Ok(msg) => {
                        // blocks while the fan-out queue is full
                        if gateway.fanout.queue(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(BusError::Timeout) => {
                        debug!("broker read loop cancelled");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "broker read failed");
                        let _ = err_tx.send(e.into()).await;
                        break;
                    }
                }
            }
        });
        err_rx
    }

    /// Rebuild the application worker pool in place. In-flight
    /// authorization requests drain first; live connections are untouched.
    pub async fn reset(&self) -> Result<()> {
        tracing::info!("reset signal received");
        self.validator.reset().await?;
        tracing::info!("worker pool was successfully reset");
        Ok(())
    }

    /// Cooperative shutdown: stop the broker read loop, drain the fan-out
    /// queue, and let executors observe the cancellation.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.fanout.stop().await;
        self.broker.stop();
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn topic_index(&self) -> &Arc<TopicIndex> {
        &self.index
    }
}

/// `true` when the Origin header passes the allow-list. Requests without
/// an Origin header (non-browser clients) are admitted.
fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    allowed
        .iter()
        .any(|entry| entry == "*" || entry.eq_ignore_ascii_case(origin))
}

async fn status_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "connections": gateway.registry.count(),
        "topics": gateway.index.topic_count(),
        "subscribed_connections": gateway.index.connection_count(),
        "workers": gateway.validator.workers().await,
    }))
}

#[allow(clippy::too_many_arguments)]
async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    method: Method,
    version: Version,
    uri: Uri,
    headers: HeaderMap,
    // deferred so the origin policy and admission run before the upgrade
    // handshake is validated
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, &gateway.cfg.allowed_origins) {
        counter!("gateway_origin_rejected_total").increment(1);
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let meta = Arc::new(RequestMeta::new(
        remote_addr,
        &method,
        version,
        &uri,
        &headers,
        false,
    ));

    // still able to write response headers here
    let decision = match gateway.validator.validate_server(&meta).await {
        Ok(decision) => decision,
        Err(e) => {
            warn!(error = %e, "server access validation failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if !decision.admitted() {
        counter!("gateway_admission_denied_total").increment(1);
        return denial_response(&decision);
    }

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, gateway, meta)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Propagate the worker's denial status, headers, and body.
fn denial_response(decision: &crate::validator::AccessDecision) -> Response {
    let status =
        StatusCode::from_u16(decision.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, decision.body.clone()).into_response();
    for (name, values) in &decision.headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                response.headers_mut().append(name.clone(), value);
            }
        }
    }
    response
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, meta: Arc<RequestMeta>) {
    let connection = Arc::new(Connection::new(socket));
    let id = gateway.registry.register(connection.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(gateway.registry.count() as f64);
    debug!(connection = %id, "websocket client connected");

    let executor = CommandExecutor::new(
        connection,
        meta,
        gateway.validator.clone(),
        gateway.broker.clone(),
        gateway.index.clone(),
        gateway.cancel.child_token(),
    );

    if let Err(e) = executor.run().await {
        warn!(connection = %id, error = %e, "command loop error, disconnecting");
    }

    // drop from the registry first so fan-out stops seeing the connection,
    // then release broker registrations and close the transport
    gateway.registry.unregister(id);
    executor.clean_up().await;

    gauge!("gateway_active_connections").set(gateway.registry.count() as f64);
    debug!(connection = %id, "disconnected");
}
