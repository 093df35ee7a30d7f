//! Access validation through the application worker pool.
//!
//! The worker sees a serialized HTTP-request-like object plus a marker for
//! what is being authorized: server admission (`ws:joinServer`) or a topic
//! join (`ws:joinTopics`). Markers are added to a per-call copy of the
//! attribute bag, never to the connection's persistent state.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use axum::http::{HeaderMap, Method, Uri, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::workers::{PayloadPool, WorkerPool};

const JOIN_SERVER: &str = "ws:joinServer";
const JOIN_TOPICS: &str = "ws:joinTopics";

/// Request state captured at upgrade time and carried for the lifetime of
/// the connection. The header snapshot may be replaced by the `headers`
/// client command.
pub struct RequestMeta {
    remote_addr: String,
    protocol: String,
    method: String,
    uri: String,
    raw_query: String,
    headers: Mutex<BTreeMap<String, Vec<String>>>,
    attributes: BTreeMap<String, Value>,
}

impl RequestMeta {
    pub fn new(
        remote_addr: SocketAddr,
        method: &Method,
        version: Version,
        uri: &Uri,
        headers: &HeaderMap,
        tls: bool,
    ) -> Self {
        let scheme = if tls { "https" } else { "http" };
        let host = headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path());

        let mut header_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                header_map
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }

        Self {
            remote_addr: remote_addr.ip().to_string(),
            protocol: protocol_string(version),
            method: method.as_str().to_string(),
            uri: sanitize(&format!("{scheme}://{host}{path_and_query}")),
            raw_query: sanitize(uri.query().unwrap_or("")),
            headers: Mutex::new(header_map),
            attributes: BTreeMap::new(),
        }
    }

    /// Replace the header snapshot used by subsequent authorization calls.
    pub fn set_headers(&self, headers: impl IntoIterator<Item = (String, String)>) {
        let snapshot = headers
            .into_iter()
            .map(|(name, value)| (name, vec![value]))
            .collect();
        *self.headers.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    fn serialize_with(&self, marker: (&str, Value)) -> Result<Vec<u8>> {
        // per-call copy of the attribute bag; the marker never outlives it
        let mut attributes = self.attributes.clone();
        attributes.insert(marker.0.to_string(), marker.1);

        let headers = self
            .headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let request = SerializedRequest {
            remote_addr: &self.remote_addr,
            protocol: &self.protocol,
            method: &self.method,
            uri: &self.uri,
            headers: &headers,
            cookies: BTreeMap::new(),
            raw_query: &self.raw_query,
            parsed: false,
            attributes: &attributes,
        };
        Ok(serde_json::to_vec(&request)?)
    }
}

/// The PSR-7-like shape the application worker consumes. Maps are ordered
/// so the same request always serializes to the same bytes.
#[derive(Serialize)]
struct SerializedRequest<'a> {
    #[serde(rename = "remoteAddr")]
    remote_addr: &'a str,
    protocol: &'a str,
    method: &'a str,
    uri: &'a str,
    headers: &'a BTreeMap<String, Vec<String>>,
    cookies: BTreeMap<String, String>,
    #[serde(rename = "rawQuery")]
    raw_query: &'a str,
    parsed: bool,
    attributes: &'a BTreeMap<String, Value>,
}

/// Serialized request for server admission, marker `ws:joinServer = true`.
pub fn server_context(meta: &RequestMeta) -> Result<Vec<u8>> {
    meta.serialize_with((JOIN_SERVER, Value::Bool(true)))
}

/// Serialized request for a topic join, marker `ws:joinTopics` carrying the
/// comma-joined topic list.
pub fn topics_context(meta: &RequestMeta, topics: &[String]) -> Result<Vec<u8>> {
    meta.serialize_with((JOIN_TOPICS, Value::String(topics.join(","))))
}

/// Decision returned by the worker.
#[derive(Debug, Default, Deserialize)]
pub struct AccessDecision {
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    pub status: u16,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl AccessDecision {
    pub fn admitted(&self) -> bool {
        self.status == 200
    }
}

/// Runs authorization queries against the worker pool.
///
/// The pool slot is guarded by a reader/writer lock: queries hold the read
/// side only across the exchange, so [`AccessValidator::reset`] can drain
/// in-flight work before the refreshed pool takes over.
pub struct AccessValidator {
    pool: RwLock<Arc<dyn WorkerPool>>,
    payloads: PayloadPool,
}

impl AccessValidator {
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            pool: RwLock::new(pool),
            payloads: PayloadPool::new(),
        }
    }

    /// Server admission. The decision is returned for any status; the
    /// caller propagates denial headers/status/body to the HTTP response.
    pub async fn validate_server(&self, meta: &RequestMeta) -> Result<AccessDecision> {
        debug!("server access validation");
        let ctx = server_context(meta)?;
        self.exec(ctx).await
    }

    /// Topic join admission. Non-200 statuses surface as
    /// [`GatewayError::AuthDenied`].
    pub async fn validate_topics(
        &self,
        meta: &RequestMeta,
        topics: &[String],
    ) -> Result<AccessDecision> {
        debug!(?topics, "topic access validation");
        let ctx = topics_context(meta, topics)?;
        let decision = self.exec(ctx).await?;
        if !decision.admitted() {
            return Err(GatewayError::AuthDenied {
                status: decision.status,
            });
        }
        Ok(decision)
    }

    /// Replace the workers in place, after in-flight queries drain.
    pub async fn reset(&self) -> Result<()> {
        let pool = self.pool.write().await;
        pool.reset()
            .await
            .map_err(|e| GatewayError::AuthBackend(e.to_string()))
    }

    /// Live worker count, for introspection.
    pub async fn workers(&self) -> usize {
        self.pool.read().await.workers()
    }

    async fn exec(&self, ctx: Vec<u8>) -> Result<AccessDecision> {
        let mut payload = self.payloads.get();
        payload.context.extend_from_slice(&ctx);

        let response = {
            let pool = self.pool.read().await;
            pool.exec(payload)
                .await
                .map_err(|e| GatewayError::AuthBackend(e.to_string()))?
        };

        let mut decision: AccessDecision = serde_json::from_slice(&response.context)
            .map_err(|e| GatewayError::AuthBackend(format!("undecodable response: {e}")))?;
        decision.body = response.body.clone();

        self.payloads.put(response);
        Ok(decision)
    }
}

fn sanitize(input: &str) -> String {
    input.replace(['\n', '\r'], "")
}

fn protocol_string(version: Version) -> String {
    match version {
        Version::HTTP_09 => "HTTP/0.9".to_string(),
        Version::HTTP_10 => "HTTP/1.0".to_string(),
        Version::HTTP_11 => "HTTP/1.1".to_string(),
        Version::HTTP_2 => "HTTP/2.0".to_string(),
        Version::HTTP_3 => "HTTP/3.0".to_string(),
        other => format!("{other:?}"),
    }
}
