//! Bridge configuration and validation.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::error::{BridgeError, BridgeResult};

/// Minimum accepted bearer-token length.
pub const MIN_TOKEN_LEN: usize = 10;

fn default_gateway_url() -> String {
    "http://localhost:8123/mcp_server/sse".into()
}

const fn default_poll_interval_secs() -> u64 {
    30
}

const fn default_initial_backoff_ms() -> u64 {
    1_000
}

const fn default_max_backoff_ms() -> u64 {
    60_000
}

const fn default_max_reconnect_attempts() -> u32 {
    100
}

const fn default_monitor_interval_secs() -> u64 {
    30
}

const fn default_ping_timeout_secs() -> u64 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_close_timeout_secs() -> u64 {
    15
}

const fn default_max_ping_failures() -> u32 {
    3
}

/// Configuration for one bridge instance.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Xiaozhi WebSocket endpoint (`ws://` or `wss://`).
    pub xiaozhi_endpoint: String,

    /// Bearer token for the local MCP gateway.
    pub access_token: String,

    /// SSE URL of the local MCP gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// How often collaborators poll the status surface, seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Log relayed payload previews at debug level.
    #[serde(default)]
    pub debug_logging: bool,

    /// Base reconnect backoff, milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Reconnect backoff cap, milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Remote-leg reconnect attempts before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Liveness check interval, seconds.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Ping/pong timeout, seconds.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Connect timeout for either leg, seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// WebSocket close-handshake timeout, seconds.
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,

    /// Consecutive ping failures before the connection is declared stale.
    #[serde(default = "default_max_ping_failures")]
    pub max_ping_failures: u32,
}

impl BridgeConfig {
    /// Build a config from the two required values, defaulting the rest.
    #[must_use]
    pub fn with_credentials(xiaozhi_endpoint: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            xiaozhi_endpoint: xiaozhi_endpoint.into(),
            access_token: access_token.into(),
            gateway_url: default_gateway_url(),
            poll_interval_secs: default_poll_interval_secs(),
            debug_logging: false,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            monitor_interval_secs: default_monitor_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
            max_ping_failures: default_max_ping_failures(),
        }
    }

    /// Parse a TOML document into a config.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` when the document does not parse.
    pub fn from_toml(raw: &str) -> BridgeResult<Self> {
        toml::from_str(raw).map_err(|e| BridgeError::Config(format!("invalid config file: {e}")))
    }

    /// Validate the configuration before first use.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` naming the first rejected field.
    pub fn validate(&self) -> BridgeResult<()> {
        let endpoint = Url::parse(&self.xiaozhi_endpoint)
            .map_err(|e| BridgeError::Config(format!("invalid xiaozhi endpoint: {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(BridgeError::Config(format!(
                "xiaozhi endpoint must use ws:// or wss://, got {}://",
                endpoint.scheme()
            )));
        }

        if self.access_token.len() < MIN_TOKEN_LEN {
            return Err(BridgeError::Config(format!(
                "access token must be at least {MIN_TOKEN_LEN} characters"
            )));
        }

        let gateway = Url::parse(&self.gateway_url)
            .map_err(|e| BridgeError::Config(format!("invalid gateway URL: {e}")))?;
        if !matches!(gateway.scheme(), "http" | "https") {
            return Err(BridgeError::Config(format!(
                "gateway URL must use http:// or https://, got {}://",
                gateway.scheme()
            )));
        }

        if self.poll_interval_secs == 0 {
            return Err(BridgeError::Config("poll interval must be > 0".into()));
        }
        if self.initial_backoff_ms == 0 {
            return Err(BridgeError::Config("initial backoff must be > 0".into()));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(BridgeError::Config(
                "max backoff must be >= initial backoff".into(),
            ));
        }
        if self.max_ping_failures == 0 {
            return Err(BridgeError::Config("max ping failures must be > 0".into()));
        }

        Ok(())
    }

    /// Backoff policy for the supervisor's reconnect loop.
    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}
