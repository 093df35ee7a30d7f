//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway configuration section is absent; the service is a no-op.
    #[error("gateway section absent from configuration")]
    Disabled,

    /// Malformed configuration. Fatal at init.
    #[error("configuration error: {0}")]
    Config(String),

    /// The application worker pool was unreachable or returned an
    /// undecodable response.
    #[error("authorization backend error: {0}")]
    AuthBackend(String),

    /// The application worker denied access with a non-200 status.
    #[error("access denied, status {status}")]
    AuthDenied { status: u16 },

    /// WebSocket read/write failure. Permanent for the connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// Broker driver failure other than cancellation.
    #[error("broker error: {0}")]
    Broker(#[from] pubsub::BusError),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal channel send failure.
    #[error("channel send error")]
    ChannelSend,
}

impl From<axum::Error> for GatewayError {
    fn from(e: axum::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
