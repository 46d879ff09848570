//! kv-failover CLI
//!
//! Finds the current node through the monitors, then runs one command on it or
//! follows failovers until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Run a command against the current primary
//! kv-failover --monitor 10.0.0.1:26379 --monitor 10.0.0.2:26379 --group cache GET key
//!
//! # Read from a replica, settings from a file
//! kv-failover --config failover.toml --role replica GET key
//!
//! # Follow failovers, re-checking the node role every second
//! kv-failover --config failover.toml --verify-interval-ms 1000 --watch
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use kv_failover::{
    Command, Config, FailoverClient, MonitorAddress, RespConnector, Role, SupervisorEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kv-failover")]
#[command(about = "Monitor-driven failover client for replicated key-value clusters")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "KV_FAILOVER_CONFIG")]
    config: Option<PathBuf>,

    /// Monitor address as host:port, in priority order (repeatable)
    #[arg(short, long = "monitor", value_name = "HOST:PORT")]
    monitors: Vec<MonitorAddress>,

    /// Group name the monitors track
    #[arg(short, long, env = "KV_FAILOVER_GROUP")]
    group: Option<String>,

    /// Role to connect to (primary or replica)
    #[arg(long)]
    role: Option<Role>,

    /// Role re-verification interval in milliseconds (0 = disabled)
    #[arg(long)]
    verify_interval_ms: Option<u64>,

    /// How long to wait for the first connection
    #[arg(long, default_value_t = 10)]
    wait_secs: u64,

    /// Keep running and log failovers until Ctrl-C
    #[arg(long)]
    watch: bool,

    /// Command to run once connected
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(Config, Option<Command>, u64, bool)> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("Loading config from {}", path.display()))?,
            None => {
                let group = self
                    .group
                    .clone()
                    .context("--group is required without --config")?;
                Config::new(Vec::new(), group)
            }
        };

        // Apply CLI overrides
        if !self.monitors.is_empty() {
            config.monitors = self.monitors;
        }
        if let Some(group) = self.group {
            config.group = group;
        }
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(ms) = self.verify_interval_ms {
            config.verify_interval_ms = ms;
        }

        let command = Command::from_args(&self.command);
        if command.is_none() && !self.watch {
            bail!("Nothing to do: give a command or --watch");
        }

        Ok((config, command, self.wait_secs, self.watch))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kv_failover=info".parse()?))
        .init();

    let (config, command, wait_secs, watch) = Args::parse().into_config()?;

    info!(
        group = %config.group,
        role = %config.role,
        monitors = config.monitors.len(),
        "Starting kv-failover"
    );

    let client = FailoverClient::start(config, Arc::new(RespConnector))?;
    let events = client.events();

    let node = match tokio::time::timeout(Duration::from_secs(wait_secs), client.wait_connected())
        .await
    {
        Ok(result) => result?,
        Err(_) => {
            client.stop().await;
            bail!("No node connected within {}s", wait_secs);
        }
    };
    info!(node = %node, "Connected");

    let outcome = match command {
        Some(command) => client
            .execute(command)
            .await
            .map(|reply| println!("{}", reply))
            .map_err(anyhow::Error::from),
        None => Ok(()),
    };

    if watch && outcome.is_ok() {
        follow(events).await;
    }

    client.stop().await;
    info!("Stopped");
    outcome
}

/// Log lifecycle events until Ctrl-C.
async fn follow(mut events: tokio::sync::broadcast::Receiver<SupervisorEvent>) {
    info!("Watching for failovers (Ctrl-C to stop)");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return;
            }
            event = events.recv() => match event {
                Ok(SupervisorEvent::Connected { address, reconnect }) => {
                    info!(node = %address, reconnect, "Node connected");
                }
                Ok(SupervisorEvent::Disconnected { address, reason }) => {
                    warn!(node = ?address, reason = %reason, "Node lost");
                }
                Ok(SupervisorEvent::ConnectionFailed { reason, retry_in }) => {
                    warn!(reason = %reason, retry_in = ?retry_in, "Discovery failed");
                }
                Ok(SupervisorEvent::Terminated) | Err(RecvError::Closed) => {
                    error!("Supervisor terminated");
                    return;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged");
                }
            },
        }
    }
}
