//! End-to-end bridge tests against a loopback WebSocket peer and a
//! hand-rolled SSE gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_async};

use xiaozhi_bridge::{BridgeConfig, BridgeCoordinator, BridgeState};

type ServerWs = WebSocketStream<TcpStream>;

/// Minimal MCP gateway: serves the SSE stream and records posts.
struct FakeGateway {
    uri: String,
    posts: mpsc::UnboundedReceiver<(String, String)>,
    push: broadcast::Sender<String>,
    sse_connections: Arc<AtomicUsize>,
}

async fn spawn_gateway() -> FakeGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (posts_tx, posts_rx) = mpsc::unbounded_channel();
    let (push_tx, _) = broadcast::channel(64);
    let sse_connections = Arc::new(AtomicUsize::new(0));

    let accept_push = push_tx.clone();
    let accept_connections = Arc::clone(&sse_connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_gateway_conn(
                stream,
                posts_tx.clone(),
                accept_push.clone(),
                Arc::clone(&accept_connections),
            ));
        }
    });

    FakeGateway {
        uri: format!("http://{addr}"),
        posts: posts_rx,
        push: push_tx,
        sse_connections,
    }
}

async fn serve_gateway_conn(
    stream: TcpStream,
    posts_tx: mpsc::UnboundedSender<(String, String)>,
    push_tx: broadcast::Sender<String>,
    sse_connections: Arc<AtomicUsize>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
            return;
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim().to_ascii_lowercase();
            if header.is_empty() {
                break;
            }
            if let Some(value) = header.strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }

        if method == "GET" {
            // Subscribe before publishing the connection count so a push
            // racing the handshake is never lost.
            let push_rx = push_tx.subscribe();
            sse_connections.fetch_add(1, Ordering::SeqCst);
            serve_sse(&mut write_half, push_rx).await;
            return;
        }

        let mut body = vec![0_u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let _ = posts_tx.send((path, String::from_utf8_lossy(&body).into_owned()));
        if write_half
            .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n")
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn serve_sse(write_half: &mut OwnedWriteHalf, mut push_rx: broadcast::Receiver<String>) {
    if write_half
        .write_all(
            b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n",
        )
        .await
        .is_err()
    {
        return;
    }
    while let Ok(data) = push_rx.recv().await {
        let frame = format!("data: {data}\n\n");
        if write_half.write_all(frame.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Loopback Xiaozhi endpoint: every accepted socket is handed to the test.
async fn spawn_ws_server() -> (String, mpsc::UnboundedReceiver<ServerWs>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            if let Ok(ws) = accept_async(stream).await {
                // Tests drive the server side directly.
                let _ = conn_tx.send(ws);
            }
        }
    });

    (format!("ws://{addr}"), conn_rx)
}

fn bridge_config(ws_url: &str, gateway_uri: &str) -> BridgeConfig {
    let mut config = BridgeConfig::from_toml(&format!(
        r#"
        xiaozhi_endpoint = "{ws_url}"
        access_token = "0123456789abcdef"
        gateway_url = "{gateway_uri}/mcp_server/sse"
        "#,
    ))
    .unwrap();
    config.initial_backoff_ms = 50;
    config.max_backoff_ms = 200;
    config.connect_timeout_secs = 2;
    config.close_timeout_secs = 2;
    config
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn round_trip_and_independent_leg_failure() {
    let mut gateway = spawn_gateway().await;
    let (ws_url, mut ws_conns) = spawn_ws_server().await;

    let bridge = BridgeCoordinator::new(bridge_config(&ws_url, &gateway.uri)).unwrap();
    bridge.start().await.unwrap();

    let mut server_ws = timeout(Duration::from_secs(5), ws_conns.recv())
        .await
        .expect("remote leg connected")
        .unwrap();
    assert!(bridge.wait_for_connection(Duration::from_secs(5)).await);

    // Both the preflight probe and the session loop open the stream; wait
    // for the session's subscription before announcing endpoints.
    let sse_connections = Arc::clone(&gateway.sse_connections);
    assert!(
        wait_until(Duration::from_secs(5), || {
            sse_connections.load(Ordering::SeqCst) >= 2
        })
        .await,
        "local leg connected"
    );

    // The gateway announces a per-id reply endpoint.
    gateway.push.send("/mcp_server/messages/7".into()).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Remote → local: the request lands on exactly the announced endpoint.
    server_ws
        .send(WsMessage::Text(r#"{"id":"7","method":"ping"}"#.into()))
        .await
        .unwrap();
    let (path, body) = timeout(Duration::from_secs(5), gateway.posts.recv())
        .await
        .expect("post delivered")
        .unwrap();
    assert_eq!(path, "/mcp_server/messages/7");
    assert_eq!(body, r#"{"id":"7","method":"ping"}"#);

    // Local → remote: the reply comes back over the socket verbatim.
    gateway
        .push
        .send(r#"{"id":"7","result":{"pong":true}}"#.into())
        .unwrap();
    let reply = loop {
        let msg = timeout(Duration::from_secs(5), server_ws.next())
            .await
            .expect("reply forwarded")
            .unwrap()
            .unwrap();
        if let WsMessage::Text(text) = msg {
            break text.to_string();
        }
    };
    assert_eq!(reply, r#"{"id":"7","result":{"pong":true}}"#);

    let status = bridge.status();
    assert!(status.connected);
    assert!(status.message_count >= 2);
    assert!(status.last_seen.is_some());

    // Drop the remote peer: the bridge must re-establish that leg while the
    // gateway session stays untouched.
    let sse_connections_before = gateway.sse_connections.load(Ordering::SeqCst);
    drop(server_ws);
    let mut server_ws = timeout(Duration::from_secs(10), ws_conns.recv())
        .await
        .expect("remote leg reconnected")
        .unwrap();
    assert!(bridge.wait_for_connection(Duration::from_secs(5)).await);
    assert_eq!(
        gateway.sse_connections.load(Ordering::SeqCst),
        sse_connections_before,
        "local leg must not restart when the remote leg drops"
    );

    // Relay still works after the restart.
    gateway.push.send("/mcp_server/messages/8".into()).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    server_ws
        .send(WsMessage::Text(r#"{"id":"8","method":"ping"}"#.into()))
        .await
        .unwrap();
    let (path, _) = timeout(Duration::from_secs(5), gateway.posts.recv())
        .await
        .expect("post delivered after reconnect")
        .unwrap();
    assert_eq!(path, "/mcp_server/messages/8");

    bridge.shutdown().await;
    assert_eq!(bridge.status().state, BridgeState::Stopped);
}

#[tokio::test]
async fn send_message_reaches_the_remote_peer() {
    let gateway = spawn_gateway().await;
    let (ws_url, mut ws_conns) = spawn_ws_server().await;

    let bridge = BridgeCoordinator::new(bridge_config(&ws_url, &gateway.uri)).unwrap();
    bridge.start().await.unwrap();

    let mut server_ws = timeout(Duration::from_secs(5), ws_conns.recv())
        .await
        .expect("remote leg connected")
        .unwrap();
    assert!(bridge.wait_for_connection(Duration::from_secs(5)).await);

    bridge
        .send_message(r#"{"jsonrpc":"2.0","method":"notifications/state"}"#)
        .await
        .unwrap();

    let received = loop {
        let msg = timeout(Duration::from_secs(5), server_ws.next())
            .await
            .expect("message forwarded")
            .unwrap()
            .unwrap();
        if let WsMessage::Text(text) = msg {
            break text.to_string();
        }
    };
    assert!(received.contains("notifications/state"));
    assert_eq!(bridge.status().messages_sent, 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn silent_peer_triggers_liveness_reconnect() {
    let gateway = spawn_gateway().await;
    let (ws_url, mut ws_conns) = spawn_ws_server().await;

    let mut config = bridge_config(&ws_url, &gateway.uri);
    config.monitor_interval_secs = 1;
    config.ping_timeout_secs = 1;
    config.max_ping_failures = 2;

    let bridge = BridgeCoordinator::new(config).unwrap();
    bridge.start().await.unwrap();

    // Hold the first socket without ever reading: pings are never answered.
    let _silent_ws = timeout(Duration::from_secs(5), ws_conns.recv())
        .await
        .expect("remote leg connected")
        .unwrap();
    assert!(bridge.wait_for_connection(Duration::from_secs(5)).await);

    // Two failed pings later the supervisor must replace the socket.
    let _fresh_ws = timeout(Duration::from_secs(15), ws_conns.recv())
        .await
        .expect("stale connection replaced")
        .unwrap();

    bridge.shutdown().await;
}
