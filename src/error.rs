use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be passed to handler callbacks for error-type-based decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Connection failed (timeout, refused, etc.)
    ConnectionFailed,
    /// Gateway sent something we could not make sense of
    Protocol,
    /// Cluster is shutting down
    ShuttingDown,
    /// Circuit breaker tripped
    CircuitBreakerOpen,
    /// REST request could not be admitted by the rate limiter
    RateLimited,
    /// HTTP transport error
    Http,
    /// Identify lock store error
    Store,
    /// Other error
    Other,
}

/// Errors that can occur in ws-gateway-shard
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection failed after all retry attempts
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ConnectionFailed { attempts: u32, last_error: String },

    /// Malformed or unexpected gateway frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cluster is shutting down
    #[error("Cluster is shutting down")]
    ShuttingDown,

    /// Channel send error (the receiving task is gone)
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Circuit breaker open - too many consecutive failures
    #[error("Circuit breaker open after {failures} consecutive failures")]
    CircuitBreakerOpen { failures: u32 },

    /// REST request still rate limited after all retries
    #[error("Rate limited on {endpoint} (retry after {retry_after:?})")]
    RateLimited {
        endpoint: String,
        retry_after: Option<Duration>,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Identify lock store error
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Error::Protocol(_) | Error::Json(_) => ErrorKind::Protocol,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::CircuitBreakerOpen { .. } => ErrorKind::CircuitBreakerOpen,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Http(_) => ErrorKind::Http,
            Error::Store(_) => ErrorKind::Store,
            Error::ChannelSend(_) | Error::Config(_) => ErrorKind::Other,
        }
    }
}
