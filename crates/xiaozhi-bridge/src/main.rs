//! Xiaozhi MCP bridge daemon.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use xiaozhi_bridge::{BridgeConfig, BridgeCoordinator};

#[derive(Debug, Parser)]
#[command(name = "xiaozhi-bridge", version, about)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Xiaozhi WebSocket endpoint (ws:// or wss://).
    #[arg(long, env = "XIAOZHI_ENDPOINT")]
    endpoint: Option<String>,

    /// Bearer token for the local MCP gateway.
    #[arg(long, env = "XIAOZHI_ACCESS_TOKEN")]
    token: Option<String>,

    /// SSE URL of the local MCP gateway.
    #[arg(long, env = "XIAOZHI_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Log relayed payload previews.
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                BridgeConfig::from_toml(&raw)?
            }
            None => {
                let endpoint = self
                    .endpoint
                    .clone()
                    .context("--endpoint (or a --config file) is required")?;
                let token = self
                    .token
                    .clone()
                    .context("--token (or a --config file) is required")?;
                BridgeConfig::with_credentials(endpoint, token)
            }
        };

        // CLI flags override file values.
        if let Some(endpoint) = self.endpoint {
            config.xiaozhi_endpoint = endpoint;
        }
        if let Some(token) = self.token {
            config.access_token = token;
        }
        if let Some(gateway) = self.gateway_url {
            config.gateway_url = gateway;
        }
        if self.debug {
            config.debug_logging = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "info,xiaozhi_bridge=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let config = args.into_config()?;
    let poll_interval = config.poll_interval();

    let bridge = BridgeCoordinator::new(config)?;
    bridge.start().await?;

    // Periodic status line, at the same cadence collaborators poll at.
    let mut status_ticker = tokio::time::interval(poll_interval);
    status_ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("listening for shutdown signal")?;
                info!("interrupt received");
                break;
            }
            _ = status_ticker.tick() => {
                let status = bridge.status();
                info!(
                    state = ?status.state,
                    messages = status.message_count,
                    errors = status.error_count,
                    reconnects = status.reconnect_count,
                    "bridge status"
                );
            }
        }
    }

    bridge.shutdown().await;
    info!("bridge stopped");
    Ok(())
}
