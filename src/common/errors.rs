use std::time::Duration;

use thiserror::Error;

use crate::gateway::{discovery::DiscoveryError, encryption::CryptoError};

/// Every failure the voice gateway can produce.
///
/// Only `Config`, `InvalidChannel`, `Credentials` and the initial ready wait
/// reach callers directly; everything else is handled inside the session and
/// surfaced as a diagnostic event.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid voice channel id {0}")]
    InvalidChannel(u64),

    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ip discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("media encryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("timed out after {1:?} waiting for {0}")]
    Timeout(&'static str, Duration),

    #[error("voice session closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl GatewayError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
