use std::time::Duration;

use thiserror::Error;

use crate::retry::Retryable;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Failed to open channel {key}: {reason}")]
    ChannelOpen { key: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to serialize or deserialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid realtime url: {0}")]
    Url(#[from] url::ParseError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Session token expired")]
    TokenExpired,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Invalid row filter '{0}'")]
    InvalidFilter(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl RealtimeError {
    /// Errors that a session refresh may cure.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Auth(_) | Self::TokenExpired => true,
            Self::Http { status, .. } => *status == 401,
            _ => false,
        }
    }
}

impl Retryable for RealtimeError {
    fn is_retryable(&self) -> bool {
        if self.is_auth() {
            return false;
        }
        match self {
            // 408 and 429 are transient; every other client error is final
            Self::Http { status, .. } if (400..500).contains(status) => {
                *status == 408 || *status == 429
            }
            Self::InvalidFilter(_) | Self::Config(_) | Self::Url(_) | Self::Tls(_) => false,
            _ => true,
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to store query data for {key}: {reason}")]
    Store { key: String, reason: String },
}
