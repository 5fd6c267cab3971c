//! Bridge-specific error types.

use thiserror::Error;

/// Errors produced by the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A leg could not be opened (malformed address, refused, timeout).
    #[error("connect failed: {0}")]
    Connect(String),

    /// A leg dropped mid-session (closed, protocol violation).
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Payload is not parseable JSON. Never fatal: the relay forwards the
    /// payload as-is and only loses the structured log line.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// The gateway rejected a post because its session-scoped endpoint is
    /// no longer valid. Handled inside the send ladder, not a leg restart.
    #[error("gateway session expired (last endpoint tried: {endpoint})")]
    SessionExpired { endpoint: String },

    /// Reconnect cap reached; the bridge stops until told to restart.
    #[error("gave up after {attempts} reconnect attempts")]
    AttemptsExhausted { attempts: u32 },

    /// A send was requested while the bridge is not connected.
    #[error("bridge is not connected")]
    NotConnected,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Check if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Transport(_) | Self::Http(_) | Self::SessionExpired { .. }
        )
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
