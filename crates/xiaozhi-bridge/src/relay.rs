//! Bidirectional relay pumps.
//!
//! Two pumps run for the lifetime of a connected bridge: remote→local
//! (Xiaozhi socket events posted to the gateway via the endpoint ladder)
//! and local→remote (gateway event-stream payloads forwarded verbatim to
//! the socket). Envelope parsing is for logging only; a payload that fails
//! to parse is still forwarded. A transport-level failure ends the pump and
//! the supervisor restarts the remote leg.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use crate::envelope::{RpcEnvelope, preview};
use crate::mcp::McpClient;
use crate::status::{BridgeCounters, LastSeen};
use crate::xiaozhi::{SocketCommand, SocketEvent};

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// The remote socket closed or failed.
    RemoteClosed { reason: String },
    /// The socket loop is gone; sends can no longer be accepted.
    RemoteUnavailable,
    /// The gateway inbound queue ended (bridge shutdown).
    LocalClosed,
}

/// Forward Xiaozhi socket traffic to the gateway.
pub async fn pump_remote_to_local(
    mut events: mpsc::Receiver<SocketEvent>,
    mcp: Arc<McpClient>,
    counters: Arc<BridgeCounters>,
    last_seen: Arc<LastSeen>,
    debug_logging: bool,
) -> PumpExit {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Message(payload) => {
                counters.record_received();
                last_seen.touch();

                if debug_logging {
                    debug!(payload = %preview(&payload), "Xiaozhi → MCP");
                }
                match RpcEnvelope::parse(&payload) {
                    Ok(envelope) => debug!(envelope = %envelope.describe(), "relaying to gateway"),
                    Err(e) => {
                        warn!(error = %e, payload = %preview(&payload),
                            "non-JSON payload from Xiaozhi, forwarding as-is");
                    }
                }

                // A failed delivery of one message is not a leg failure:
                // count it, log it, keep pumping.
                if let Err(e) = mcp.send(&payload).await {
                    counters.record_error();
                    error!(error = %e, "failed to deliver message to gateway");
                }
            }
            SocketEvent::Closed { reason } => {
                return PumpExit::RemoteClosed { reason };
            }
        }
    }
    PumpExit::RemoteClosed {
        reason: "socket event channel closed".into(),
    }
}

/// Forward gateway event-stream payloads to the Xiaozhi socket.
pub async fn pump_local_to_remote(
    inbound: Arc<Mutex<mpsc::Receiver<String>>>,
    commands: mpsc::Sender<SocketCommand>,
    counters: Arc<BridgeCounters>,
    debug_logging: bool,
) -> PumpExit {
    let mut inbound = inbound.lock().await;
    while let Some(payload) = inbound.recv().await {
        if debug_logging {
            debug!(payload = %preview(&payload), "MCP → Xiaozhi");
        }
        match RpcEnvelope::parse(&payload) {
            Ok(envelope) => debug!(envelope = %envelope.describe(), "relaying to Xiaozhi"),
            Err(e) => {
                warn!(error = %e, payload = %preview(&payload),
                    "non-JSON payload from gateway, forwarding as-is");
            }
        }

        if commands.send(SocketCommand::Send(payload)).await.is_err() {
            return PumpExit::RemoteUnavailable;
        }
        counters.record_sent();
    }
    PumpExit::LocalClosed
}
