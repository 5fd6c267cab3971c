//! MCP gateway client (the local leg).
//!
//! Owns the SSE event stream and the outbound posts. The session loop is
//! supervised independently of the remote leg: losing the Xiaozhi socket
//! must not tear down the gateway session, and a gateway drop only backs
//! off and retries this leg.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::BridgeConfig;
use crate::endpoint::EndpointResolver;
use crate::envelope::RpcEnvelope;
use crate::error::{BridgeError, BridgeResult};
use crate::sse;
use crate::status::ConnectionState;

/// Preflight probe attempts before giving up (never fatal).
const PROBE_ATTEMPTS: u32 = 3;

/// Timeout for a single outbound post.
const POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the preflight probe request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle for the gateway session loop.
pub struct McpSession {
    /// Inbound message payloads from the event stream.
    pub inbound: mpsc::Receiver<String>,
    /// The leg's own connection state.
    pub state: watch::Receiver<ConnectionState>,
    pub join_handle: tokio::task::JoinHandle<()>,
}

/// Client for the local MCP gateway.
pub struct McpClient {
    http: reqwest::Client,
    gateway_url: String,
    access_token: String,
    resolver: Arc<Mutex<EndpointResolver>>,
}

impl McpClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` for an unusable gateway URL and the
    /// transparent HTTP error if the client cannot be constructed.
    pub fn new(config: &BridgeConfig) -> BridgeResult<Self> {
        let resolver = EndpointResolver::new(&config.gateway_url)?;
        // No total timeout: the event stream must stay open indefinitely.
        // Posts set their own per-request timeout.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            http,
            gateway_url: config.gateway_url.clone(),
            access_token: config.access_token.clone(),
            resolver: Arc::new(Mutex::new(resolver)),
        })
    }

    /// The shared endpoint resolver for this session.
    #[must_use]
    pub fn resolver(&self) -> Arc<Mutex<EndpointResolver>> {
        Arc::clone(&self.resolver)
    }

    /// Preflight reachability check with bounded retries. Logs the outcome;
    /// never fatal, since the session loop keeps retrying regardless.
    pub async fn probe(&self, mut shutdown: watch::Receiver<bool>) -> bool {
        let mut delay = Duration::from_secs(2);
        for attempt in 1..=PROBE_ATTEMPTS {
            if *shutdown.borrow() {
                return false;
            }
            match self.probe_once().await {
                Ok(()) => {
                    info!("MCP gateway is reachable");
                    return true;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "MCP gateway probe failed");
                    if attempt < PROBE_ATTEMPTS {
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => return false,
                        }
                        delay *= 2;
                    }
                }
            }
        }
        warn!(
            attempts = PROBE_ATTEMPTS,
            "MCP gateway unreachable; continuing, the session loop will keep retrying"
        );
        false
    }

    async fn probe_once(&self) -> BridgeResult<()> {
        let response = self
            .http
            .get(&self.gateway_url)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header(ACCEPT, "text/event-stream")
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                if content_type.contains("text/event-stream") || content_type.contains("text/plain")
                {
                    Ok(())
                } else {
                    Err(BridgeError::Connect(format!(
                        "gateway answered with unexpected content type {content_type}"
                    )))
                }
            }
            StatusCode::UNAUTHORIZED => Err(BridgeError::Connect(
                "gateway authentication failed, check the access token".into(),
            )),
            StatusCode::NOT_FOUND => Err(BridgeError::Connect(
                "gateway SSE endpoint not found, is the MCP server enabled?".into(),
            )),
            status => Err(BridgeError::Connect(format!(
                "gateway probe returned {status}"
            ))),
        }
    }

    async fn open_stream(&self) -> BridgeResult<reqwest::Response> {
        let response = self
            .http
            .get(&self.gateway_url)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            if status == StatusCode::UNAUTHORIZED {
                warn!("gateway rejected the access token");
            }
            return Err(BridgeError::Connect(format!(
                "gateway event stream returned {status}"
            )));
        }
        Ok(response)
    }

    /// Start the supervised session loop: connect, read the event stream,
    /// and on a drop back off and retry until shutdown.
    #[must_use]
    pub fn start_session(
        self: &Arc<Self>,
        policy: BackoffPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> McpSession {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let client = Arc::clone(self);

        let join_handle = tokio::spawn(async move {
            client
                .run_session(policy, inbound_tx, state_tx, shutdown)
                .await;
        });

        McpSession {
            inbound: inbound_rx,
            state: state_rx,
            join_handle,
        }
    }

    async fn run_session(
        &self,
        policy: BackoffPolicy,
        inbound_tx: mpsc::Sender<String>,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = policy.delay(attempt);
            if !delay.is_zero() {
                info!(attempt, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "waiting before gateway reconnect");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        // A closed channel means the coordinator is gone.
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let _ = state_tx.send(ConnectionState::Connecting);
            let opened = tokio::select! {
                result = self.open_stream() => result,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            match opened {
                Ok(response) => {
                    info!("gateway event stream open");
                    let _ = state_tx.send(ConnectionState::Connected);
                    attempt = 0;

                    let result = sse::run_stream(
                        response,
                        self.resolver(),
                        inbound_tx.clone(),
                        shutdown.clone(),
                    )
                    .await;
                    let _ = state_tx.send(ConnectionState::Disconnected);

                    match result {
                        // Shutdown, or the bridge dropped the inbound queue.
                        Ok(()) => break,
                        Err(e) => {
                            warn!(error = %e, "gateway event stream dropped");
                            attempt = 1;
                        }
                    }
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!(attempt, error = %e, "gateway connect failed");
                    let _ = state_tx.send(ConnectionState::Disconnected);
                }
            }
        }

        let _ = state_tx.send(ConnectionState::Disconnected);
        debug!("gateway session loop stopped");
    }

    /// Post a payload to the gateway, walking the endpoint ladder.
    ///
    /// Advances to the next candidate only on a not-found answer (stale
    /// session-scoped endpoint, which also invalidates the map) and stops at
    /// the first success.
    ///
    /// # Errors
    ///
    /// `BridgeError::SessionExpired` when every candidate answered
    /// not-found; the failing transport or gateway error otherwise.
    pub async fn send(&self, payload: &str) -> BridgeResult<()> {
        let correlation_id = RpcEnvelope::parse(payload)
            .ok()
            .and_then(|env| env.correlation_id());

        let candidates: Vec<(String, String)> = {
            let resolver = self.resolver.lock().await;
            resolver
                .candidates(correlation_id.as_deref())
                .into_iter()
                .map(|path| {
                    let url = resolver.url_for(&path);
                    (path, url)
                })
                .collect()
        };

        let mut last_endpoint = String::new();
        for (rung, (path, url)) in candidates.iter().enumerate() {
            last_endpoint.clone_from(path);
            match self.post(url, payload).await {
                Ok(()) => {
                    if rung > 0 {
                        debug!(endpoint = %path, rung, "delivered via fallback endpoint");
                    }
                    if let Some(id) = &correlation_id {
                        self.resolver.lock().await.mark_delivered(id);
                    }
                    return Ok(());
                }
                Err(PostError::NotFound) => {
                    warn!(endpoint = %path, "gateway endpoint not found, session endpoints invalidated");
                    self.resolver.lock().await.invalidate();
                }
                Err(PostError::Failed(e)) => return Err(e),
            }
        }

        Err(BridgeError::SessionExpired {
            endpoint: last_endpoint,
        })
    }

    async fn post(&self, url: &str, payload: &str) -> Result<(), PostError> {
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header(CONTENT_TYPE, "application/json")
            .timeout(POST_TIMEOUT)
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| PostError::Failed(e.into()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(PostError::NotFound);
        }

        let body = response.text().await.unwrap_or_default();
        Err(PostError::Failed(BridgeError::Transport(format!(
            "gateway returned {status}: {}",
            crate::envelope::preview(&body)
        ))))
    }
}

enum PostError {
    /// The session-scoped endpoint is gone; try the next rung.
    NotFound,
    /// Anything else; the ladder stops here.
    Failed(BridgeError),
}
