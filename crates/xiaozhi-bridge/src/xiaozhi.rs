//! Xiaozhi WebSocket client (the remote leg).
//!
//! Owns one socket at a time. The socket loop serves a command channel for
//! outbound traffic and liveness pings, and publishes inbound text frames on
//! an event channel. Protocol-native Ping/Pong backs the liveness check: the
//! loop holds at most one pending pong waiter and completes it when the Pong
//! frame arrives.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound events from the socket loop.
#[derive(Debug)]
pub enum SocketEvent {
    /// A text frame from the remote peer.
    Message(String),
    /// The socket is gone; the reason is for logging only.
    Closed { reason: String },
}

/// Commands accepted by the socket loop.
#[derive(Debug)]
pub enum SocketCommand {
    /// Send a text frame.
    Send(String),
    /// Send a protocol Ping; `ack` completes when the Pong arrives.
    Ping { ack: oneshot::Sender<()> },
    /// Run the close handshake and stop.
    Close,
}

/// Handle for a single socket connection.
#[derive(Debug)]
pub struct SocketHandle {
    pub events: mpsc::Receiver<SocketEvent>,
    pub commands: mpsc::Sender<SocketCommand>,
    pub join_handle: tokio::task::JoinHandle<BridgeResult<()>>,
}

/// Connects to the Xiaozhi endpoint.
#[derive(Debug, Clone)]
pub struct XiaozhiClient {
    endpoint: String,
    connect_timeout: Duration,
    close_timeout: Duration,
}

impl XiaozhiClient {
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            endpoint: config.xiaozhi_endpoint.clone(),
            connect_timeout: config.connect_timeout(),
            close_timeout: config.close_timeout(),
        }
    }

    /// Open the socket once and return the loop's handle.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Connect` on refusal, timeout, or a malformed
    /// endpoint address.
    pub async fn connect_once(&self) -> BridgeResult<SocketHandle> {
        info!(endpoint = %redact(&self.endpoint), "connecting to Xiaozhi endpoint");

        let connect = connect_async(&self.endpoint);
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                BridgeError::Connect(format!(
                    "timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        info!("connected to Xiaozhi endpoint");

        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(256);
        let close_timeout = self.close_timeout;

        let join_handle = tokio::spawn(async move {
            run_socket_loop(ws_stream, event_tx, command_rx, close_timeout).await
        });

        Ok(SocketHandle {
            events: event_rx,
            commands: command_tx,
            join_handle,
        })
    }
}

/// Trim credentials that Xiaozhi endpoints embed in the URL query.
fn redact(endpoint: &str) -> &str {
    endpoint.split_once('?').map_or(endpoint, |(base, _)| base)
}

async fn run_socket_loop(
    ws_stream: WsStream,
    events: mpsc::Sender<SocketEvent>,
    mut commands: mpsc::Receiver<SocketCommand>,
    close_timeout: Duration,
) -> BridgeResult<()> {
    let (mut write, mut read) = ws_stream.split();
    let mut pending_pong: Option<oneshot::Sender<()>> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Send(text)) => {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        let reason = format!("send failed: {e}");
                        error!(error = %e, "failed to send to Xiaozhi");
                        let _ = events.send(SocketEvent::Closed { reason: reason.clone() }).await;
                        return Err(BridgeError::Transport(reason));
                    }
                }
                Some(SocketCommand::Ping { ack }) => {
                    if let Err(e) = write.send(WsMessage::Ping(Vec::new().into())).await {
                        let reason = format!("ping failed: {e}");
                        let _ = events.send(SocketEvent::Closed { reason: reason.clone() }).await;
                        return Err(BridgeError::Transport(reason));
                    }
                    pending_pong = Some(ack);
                }
                Some(SocketCommand::Close) | None => break,
            },

            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if events.send(SocketEvent::Message(text.to_string())).await.is_err() {
                        debug!("event receiver dropped, closing socket");
                        break;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    if let Some(ack) = pending_pong.take() {
                        let _ = ack.send(());
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame.as_ref().map_or_else(
                        || "closed without a close frame".to_string(),
                        |f| format!("closed with code {}: {}", f.code, f.reason.as_str()),
                    );
                    if let Some(f) = &frame {
                        // 4xxx codes are application-level rejections from the
                        // remote service, worth surfacing louder than a drop.
                        if u16::from(f.code) >= 4000 {
                            error!(code = %f.code, reason = %f.reason.as_str(), "Xiaozhi rejected the session");
                        } else {
                            warn!(code = %f.code, "Xiaozhi connection closed");
                        }
                    }
                    let _ = events.send(SocketEvent::Closed { reason }).await;
                    return Ok(());
                }
                Some(Ok(_)) => {
                    // Binary and Ping frames are ignored; the library answers
                    // pings itself.
                }
                Some(Err(e)) => {
                    let reason = format!("websocket error: {e}");
                    error!(error = %e, "Xiaozhi websocket error");
                    let _ = events.send(SocketEvent::Closed { reason: reason.clone() }).await;
                    return Err(BridgeError::Transport(reason));
                }
                None => {
                    let _ = events
                        .send(SocketEvent::Closed { reason: "connection ended".into() })
                        .await;
                    return Ok(());
                }
            },
        }
    }

    close_handshake(write, read, close_timeout).await
}

async fn close_handshake(
    mut write: futures_util::stream::SplitSink<WsStream, WsMessage>,
    mut read: futures_util::stream::SplitStream<WsStream>,
    close_timeout: Duration,
) -> BridgeResult<()> {
    let _ = write.send(WsMessage::Close(None)).await;
    let drain = async {
        while let Some(msg) = read.next().await {
            if matches!(msg, Ok(WsMessage::Close(_)) | Err(_)) {
                break;
            }
        }
    };
    if tokio::time::timeout(close_timeout, drain).await.is_err() {
        warn!("close handshake timed out");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_strips_query_credentials() {
        assert_eq!(
            redact("wss://api.xiaozhi.me/mcp/?token=secret"),
            "wss://api.xiaozhi.me/mcp/"
        );
        assert_eq!(redact("wss://api.xiaozhi.me/mcp"), "wss://api.xiaozhi.me/mcp");
    }

    #[tokio::test]
    async fn connect_to_refused_port_is_connect_error() {
        let client = XiaozhiClient {
            endpoint: "ws://127.0.0.1:9/".into(),
            connect_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_secs(1),
        };
        let err = client.connect_once().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connect(_)));
    }

    #[tokio::test]
    async fn connect_to_invalid_address_is_connect_error() {
        let client = XiaozhiClient {
            endpoint: "not a url".into(),
            connect_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_secs(1),
        };
        let err = client.connect_once().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connect(_)));
    }
}
