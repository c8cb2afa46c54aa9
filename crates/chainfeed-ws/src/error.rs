//! WebSocket server error types.

use thiserror::Error;

use crate::wire::{INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND};

/// Errors raised while serving a WebSocket connection.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The subscription kind or method is not served here.
    #[error("{0}")]
    Unsupported(String),

    #[error("subscription limit reached ({cap})")]
    LimitReached { cap: usize },

    /// No forwarder is configured for non-subscription calls.
    #[error("method {0} is not available over websocket")]
    MethodNotFound(String),

    /// Writing a frame to the peer failed.
    #[error("write failed: {0}")]
    Write(String),

    #[error("connection closed")]
    Closed,

    /// Forwarding a call to the HTTP JSON-RPC endpoint failed.
    #[error("forward failed: {0}")]
    Forward(String),

    /// The event aggregator could not provide a stream.
    #[error("event stream unavailable: {0}")]
    Upstream(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WsError {
    /// JSON-RPC error code reported to the client.
    pub fn code(&self) -> i64 {
        match self {
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_)
            | Self::Unsupported(_)
            | Self::LimitReached { .. }
            | Self::Serialization(_) => INVALID_REQUEST,
            Self::Write(_) | Self::Closed | Self::Forward(_) | Self::Upstream(_) | Self::Io(_) => {
                INTERNAL_ERROR
            }
        }
    }

    /// Returns `true` if the connection can no longer be written to.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Write(_) | Self::Closed)
    }
}

impl From<chainfeed_events::AggregatorError> for WsError {
    fn from(e: chainfeed_events::AggregatorError) -> Self {
        Self::Upstream(e.to_string())
    }
}

impl From<chainfeed_core::CoreError> for WsError {
    fn from(e: chainfeed_core::CoreError) -> Self {
        Self::InvalidParams(e.to_string())
    }
}
