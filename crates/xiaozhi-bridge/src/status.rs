//! Connection state, counters, and the status snapshot polled by
//! presentation-layer collaborators.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a single transport leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

/// Aggregate state of the bridge, owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    /// Created, not yet started.
    Idle,
    /// Remote-leg connect attempt in flight (or waiting out backoff).
    Connecting,
    /// Both legs up, relay pumps running.
    Connected,
    /// A pump or the liveness check failed; about to retry.
    Degraded,
    /// Terminal until an explicit restart: manual disconnect or
    /// attempt-cap exhaustion.
    Stopped,
}

impl BridgeState {
    /// Whether the supervisor is still driving reconnection.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Stopped)
    }
}

/// Monotonic bridge counters. Incremented from several tasks, so each is an
/// atomic; reads are relaxed snapshots for the status surface.
#[derive(Debug, Default)]
pub struct BridgeCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    errors: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl BridgeCounters {
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }
}

/// Last time the remote peer was heard from (message or pong).
#[derive(Debug, Default)]
pub struct LastSeen(Mutex<Option<DateTime<Utc>>>);

impl LastSeen {
    pub fn touch(&self) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(Utc::now());
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0.lock().ok().and_then(|slot| *slot)
    }
}

/// Point-in-time status snapshot exposed to collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub connected: bool,
    pub connecting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub reconnect_count: u64,
    pub message_count: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub error_count: u64,
    /// Set when the bridge stopped on a hard failure (attempt exhaustion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BridgeStatus {
    /// Assemble a snapshot from the supervisor's shared pieces.
    #[must_use]
    pub fn assemble(
        state: BridgeState,
        counters: &BridgeCounters,
        last_seen: &LastSeen,
        last_error: Option<String>,
    ) -> Self {
        let sent = counters.messages_sent();
        let received = counters.messages_received();
        Self {
            state,
            connected: state == BridgeState::Connected,
            connecting: state == BridgeState::Connecting,
            last_seen: last_seen.get(),
            reconnect_count: counters.reconnect_attempts(),
            message_count: sent + received,
            messages_sent: sent,
            messages_received: received,
            error_count: counters.errors(),
            last_error,
        }
    }
}
