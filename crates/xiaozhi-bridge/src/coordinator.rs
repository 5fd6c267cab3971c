//! Connection supervisor.
//!
//! One coordinator per bridge owns the remote leg's single reconnect loop,
//! launches the relay pumps, runs the liveness check while connected, and
//! exposes the status and control surfaces. The local gateway leg supervises
//! itself (see `mcp`); the coordinator only starts and stops it.
//!
//! State machine: Idle → Connecting → Connected → Degraded → Connecting …
//! → Stopped. Stopped is terminal until an explicit `reconnect()` or a fresh
//! `start()`.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::envelope::preview;
use crate::error::{BridgeError, BridgeResult};
use crate::mcp::McpClient;
use crate::relay::{self, PumpExit};
use crate::status::{BridgeCounters, BridgeState, BridgeStatus, LastSeen};
use crate::xiaozhi::{SocketCommand, SocketHandle, XiaozhiClient};

/// Consecutive ping-failure tracker. Escalates once per threshold crossing,
/// then starts over.
#[derive(Debug)]
pub struct LivenessTracker {
    failures: u32,
    threshold: u32,
}

impl LivenessTracker {
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            failures: 0,
            threshold,
        }
    }

    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Record a failed check; returns true when the threshold is reached,
    /// resetting the count so the escalation fires exactly once.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        if self.failures >= self.threshold {
            self.failures = 0;
            true
        } else {
            false
        }
    }
}

struct Shared {
    config: BridgeConfig,
    mcp: Arc<McpClient>,
    counters: Arc<BridgeCounters>,
    last_seen: Arc<LastSeen>,
    state_tx: watch::Sender<BridgeState>,
    last_error: StdMutex<Option<String>>,
    /// Command channel of the currently connected socket, for `send_message`.
    outbound: StdMutex<Option<mpsc::Sender<SocketCommand>>>,
}

impl Shared {
    fn state(&self) -> BridgeState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "bridge state changed");
        }
    }

    fn set_last_error(&self, message: String) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(message);
        }
    }

    fn clear_last_error(&self) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = None;
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }

    fn outbound(&self) -> Option<mpsc::Sender<SocketCommand>> {
        self.outbound.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Supervises both legs of one bridge instance.
pub struct BridgeCoordinator {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<BridgeState>,
    shutdown_tx: StdMutex<Option<watch::Sender<bool>>>,
    reconnect_tx: StdMutex<Option<mpsc::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BridgeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeCoordinator").finish_non_exhaustive()
    }
}

impl BridgeCoordinator {
    /// Validate the configuration and build a coordinator in `Idle`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` for a rejected configuration.
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        let mcp = Arc::new(McpClient::new(&config)?);
        let (state_tx, state_rx) = watch::channel(BridgeState::Idle);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                mcp,
                counters: Arc::new(BridgeCounters::default()),
                last_seen: Arc::new(LastSeen::default()),
                state_tx,
                last_error: StdMutex::new(None),
                outbound: StdMutex::new(None),
            }),
            state_rx,
            shutdown_tx: StdMutex::new(None),
            reconnect_tx: StdMutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start both legs. No-op when already running.
    ///
    /// # Errors
    ///
    /// Currently infallible beyond lock poisoning; kept fallible so callers
    /// treat startup as an operation that can be refused.
    pub async fn start(&self) -> BridgeResult<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            debug!("bridge already running");
            return Ok(());
        }

        info!("starting bridge");
        self.shared.clear_last_error();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(4);
        if let Ok(mut slot) = self.shutdown_tx.lock() {
            *slot = Some(shutdown_tx);
        }
        if let Ok(mut slot) = self.reconnect_tx.lock() {
            *slot = Some(reconnect_tx);
        }

        // Preflight log line only; the session loop retries regardless.
        let probe_mcp = Arc::clone(&self.shared.mcp);
        let probe_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            probe_mcp.probe(probe_shutdown).await;
        }));

        let session = self
            .shared
            .mcp
            .start_session(self.shared.config.backoff(), shutdown_rx.clone());
        let inbound = Arc::new(Mutex::new(session.inbound));
        tasks.push(session.join_handle);

        tasks.push(tokio::spawn(run_supervisor(
            Arc::clone(&self.shared),
            inbound,
            reconnect_rx,
            shutdown_rx,
        )));

        Ok(())
    }

    /// Manual disconnect: cancel every task, close both legs, and stay
    /// Stopped until `start()` or `reconnect()` is called again.
    pub async fn shutdown(&self) {
        info!("shutting down bridge");

        let shutdown_tx = self.shutdown_tx.lock().ok().and_then(|mut s| s.take());
        if let Some(tx) = &shutdown_tx {
            let _ = tx.send(true);
        }
        if let Some(outbound) = self.shared.outbound() {
            let _ = outbound.send(SocketCommand::Close).await;
        }

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        if let Ok(mut slot) = self.reconnect_tx.lock() {
            *slot = None;
        }

        self.shared.set_state(BridgeState::Stopped);
    }

    /// Ask the supervisor to re-establish the remote leg. From a stopped
    /// bridge this is a fresh `start()` (attempt counter back to zero);
    /// while Connecting it is a no-op, so a burst of calls cannot spawn
    /// concurrent connect attempts.
    ///
    /// # Errors
    ///
    /// Propagates `start()` errors when restarting a stopped bridge.
    pub async fn reconnect(&self) -> BridgeResult<()> {
        {
            let tasks = self.tasks.lock().await;
            if tasks.is_empty() {
                drop(tasks);
                return self.start().await;
            }
        }
        if let Some(tx) = self.reconnect_tx.lock().ok().and_then(|s| s.clone()) {
            // Full channel means a nudge is already pending; drop this one.
            let _ = tx.try_send(());
        }
        Ok(())
    }

    /// Send a payload to the remote peer.
    ///
    /// # Errors
    ///
    /// `BridgeError::NotConnected` unless the bridge is Connected.
    pub async fn send_message(&self, payload: &str) -> BridgeResult<()> {
        if self.shared.state() != BridgeState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let outbound = self.shared.outbound().ok_or(BridgeError::NotConnected)?;
        outbound
            .send(SocketCommand::Send(payload.to_string()))
            .await
            .map_err(|_| BridgeError::NotConnected)?;
        self.shared.counters.record_sent();

        if self.shared.config.debug_logging {
            debug!(payload = %preview(payload), "sent message to Xiaozhi");
        }
        Ok(())
    }

    /// Snapshot for the status surface.
    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        BridgeStatus::assemble(
            self.shared.state(),
            &self.shared.counters,
            &self.shared.last_seen,
            self.shared.last_error(),
        )
    }

    /// Wait until the bridge is Connected. Returns false on timeout or once
    /// the supervisor stops trying.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut state_rx = self.state_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match *state_rx.borrow_and_update() {
                BridgeState::Connected => return true,
                BridgeState::Stopped => return false,
                _ => {}
            }
            match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                Ok(Ok(())) => {}
                // Timeout, or the coordinator went away.
                Ok(Err(_)) | Err(_) => return false,
            }
        }
    }
}

/// Outcome of one connected phase.
enum ConnectedExit {
    ManualReconnect,
    RemoteDropped { reason: String },
    Stale,
    Shutdown,
}

async fn run_supervisor(
    shared: Arc<Shared>,
    inbound: Arc<Mutex<mpsc::Receiver<String>>>,
    mut reconnect_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let policy = shared.config.backoff();
    let client = XiaozhiClient::new(&shared.config);
    let max_attempts = shared.config.max_reconnect_attempts;
    let mut attempt: u32 = 0;

    'supervise: loop {
        if *shutdown_rx.borrow() {
            break;
        }
        shared.set_state(BridgeState::Connecting);

        let delay = policy.delay(attempt);
        if !delay.is_zero() {
            info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "waiting before Xiaozhi reconnect"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = shutdown_rx.changed() => {
                    // A closed channel means the coordinator is gone.
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                // An explicit reconnect() skips the remaining wait.
                nudge = reconnect_rx.recv() => {
                    if nudge.is_none() {
                        break;
                    }
                    attempt = 0;
                }
            }
        }
        // Collapse any burst of reconnect requests into this one attempt.
        while reconnect_rx.try_recv().is_ok() {}

        match client.connect_once().await {
            Ok(handle) => {
                attempt = 0;
                // A reconnect() issued while this connect was in flight is
                // satisfied by the fresh connection.
                while reconnect_rx.try_recv().is_ok() {}
                shared.clear_last_error();
                // The command channel must be in place before the state says
                // Connected, or an immediate send_message() would misfire.
                if let Ok(mut slot) = shared.outbound.lock() {
                    *slot = Some(handle.commands.clone());
                }
                shared.set_state(BridgeState::Connected);
                shared.last_seen.touch();

                let exit = run_connected(
                    &shared,
                    &inbound,
                    handle,
                    &mut reconnect_rx,
                    &mut shutdown_rx,
                )
                .await;

                if *shutdown_rx.borrow() {
                    break;
                }
                match exit {
                    // The caller asked for this; redial without delay.
                    ConnectedExit::ManualReconnect => info!("manual reconnect requested"),
                    ConnectedExit::RemoteDropped { reason } => {
                        shared.counters.record_error();
                        warn!(reason = %reason, "remote leg dropped");
                        // One backoff step before redialing a flapping link.
                        attempt = 1;
                    }
                    ConnectedExit::Stale => {
                        warn!("connection stale, restarting remote leg");
                        attempt = 1;
                    }
                    ConnectedExit::Shutdown => break 'supervise,
                }
                shared.set_state(BridgeState::Degraded);
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                shared.counters.record_reconnect_attempt();
                shared.counters.record_error();
                warn!(attempt, max_attempts, error = %e, "Xiaozhi connect failed");

                if attempt > max_attempts {
                    let fatal = BridgeError::AttemptsExhausted {
                        attempts: max_attempts,
                    };
                    error!(error = %fatal, "stopping reconnection until told otherwise");
                    shared.set_last_error(fatal.to_string());
                    shared.set_state(BridgeState::Stopped);

                    tokio::select! {
                        _ = shutdown_rx.changed() => break 'supervise,
                        nudge = reconnect_rx.recv() => {
                            if nudge.is_none() {
                                break 'supervise;
                            }
                            info!("explicit reconnect requested, resetting attempt counter");
                            attempt = 0;
                            shared.clear_last_error();
                        }
                    }
                }
            }
        }
    }

    shared.set_state(BridgeState::Stopped);
    debug!("supervisor stopped");
}

/// Run the relay pumps and the liveness check until something ends the
/// connected phase, then tear the socket down.
async fn run_connected(
    shared: &Arc<Shared>,
    inbound: &Arc<Mutex<mpsc::Receiver<String>>>,
    handle: SocketHandle,
    reconnect_rx: &mut mpsc::Receiver<()>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ConnectedExit {
    let SocketHandle {
        events,
        commands,
        join_handle,
    } = handle;

    let mut remote_pump = tokio::spawn(relay::pump_remote_to_local(
        events,
        Arc::clone(&shared.mcp),
        Arc::clone(&shared.counters),
        Arc::clone(&shared.last_seen),
        shared.config.debug_logging,
    ));
    let mut local_pump = tokio::spawn(relay::pump_local_to_remote(
        Arc::clone(inbound),
        commands.clone(),
        Arc::clone(&shared.counters),
        shared.config.debug_logging,
    ));

    let mut liveness = LivenessTracker::new(shared.config.max_ping_failures);
    let mut ticker = tokio::time::interval(shared.config.monitor_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the immediate first tick

    let exit = loop {
        tokio::select! {
            exit = &mut remote_pump => break pump_exit_to_connected_exit(exit),
            exit = &mut local_pump => break pump_exit_to_connected_exit(exit),

            _ = ticker.tick() => {
                if ping(&commands, shared.config.ping_timeout()).await {
                    liveness.record_success();
                    shared.last_seen.touch();
                } else {
                    shared.counters.record_error();
                    let escalate = liveness.record_failure();
                    warn!(
                        threshold = shared.config.max_ping_failures,
                        escalate,
                        "liveness check failed"
                    );
                    if escalate {
                        break ConnectedExit::Stale;
                    }
                }
            }

            _ = shutdown_rx.changed() => break ConnectedExit::Shutdown,

            nudge = reconnect_rx.recv() => {
                break if nudge.is_none() {
                    ConnectedExit::Shutdown
                } else {
                    ConnectedExit::ManualReconnect
                };
            }
        }
    };

    // Teardown: stop the pumps, run the close handshake, await the socket
    // loop so the transport handle is released before the next phase.
    remote_pump.abort();
    local_pump.abort();
    if let Ok(mut slot) = shared.outbound.lock() {
        *slot = None;
    }
    let _ = commands.send(SocketCommand::Close).await;
    if tokio::time::timeout(shared.config.close_timeout(), join_handle)
        .await
        .is_err()
    {
        warn!("socket loop did not stop within the close timeout");
    }

    exit
}

fn pump_exit_to_connected_exit(
    exit: Result<PumpExit, tokio::task::JoinError>,
) -> ConnectedExit {
    match exit {
        Ok(PumpExit::RemoteClosed { reason }) => ConnectedExit::RemoteDropped { reason },
        Ok(PumpExit::RemoteUnavailable) => ConnectedExit::RemoteDropped {
            reason: "socket loop ended".into(),
        },
        Ok(PumpExit::LocalClosed) => ConnectedExit::Shutdown,
        Err(e) => ConnectedExit::RemoteDropped {
            reason: format!("relay pump failed: {e}"),
        },
    }
}

/// One liveness probe: protocol Ping, bounded wait for the Pong.
async fn ping(commands: &mpsc::Sender<SocketCommand>, timeout: Duration) -> bool {
    let (ack_tx, ack_rx) = oneshot::channel();
    if commands
        .send(SocketCommand::Ping { ack: ack_tx })
        .await
        .is_err()
    {
        return false;
    }
    matches!(tokio::time::timeout(timeout, ack_rx).await, Ok(Ok(())))
}
