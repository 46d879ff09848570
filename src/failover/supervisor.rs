//! Connection supervisor.
//!
//! A single task owns the connection state and applies every transition in
//! order. Discovery attempts and role checks run in their own tasks and report
//! back through join handles and channels; the supervisor reacts to whichever
//! signal arrives first.
//!
//! ```text
//!  Init ──> Connecting ──ok──> Connected ──lost / role check failed──┐
//!               ^   │                                                 │
//!               │   └──exhausted──> Backoff ──timer──┐                │
//!               └────────────────────────────────────┴────────────────┘
//!  any phase ──stop──> Terminated
//! ```
//!
//! Readers never touch the state directly. After each transition the
//! supervisor publishes a [`Snapshot`] on a watch channel.

use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use super::backoff::BackoffPolicy;
use super::discovery::{Discovered, DiscoveryClient};
use super::events::EventSink;
use super::verifier::RoleVerifier;
use crate::config::{Config, NodeAddress};
use crate::datastore::Connection;
use crate::error::{FailoverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Connecting,
    Connected,
    Backoff,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Backoff => "backoff",
            Phase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: Phase,
    pub node_address: Option<NodeAddress>,
    /// Delay used by the last retry; cleared on every successful connect
    pub backoff_current: Option<Duration>,
}

/// What the supervisor publishes after each transition.
#[derive(Clone)]
pub(crate) struct Snapshot {
    pub(crate) status: ConnectionStatus,
    /// Present iff `status.phase` is `Connected`
    pub(crate) handle: Option<Arc<dyn Connection>>,
}

impl Snapshot {
    pub(crate) fn initial() -> Self {
        Self {
            status: ConnectionStatus {
                phase: Phase::Init,
                node_address: None,
                backoff_current: None,
            },
            handle: None,
        }
    }
}

pub(crate) enum Control {
    Stop(oneshot::Sender<()>),
}

struct ConnectionState {
    phase: Phase,
    handle: Option<Arc<dyn Connection>>,
    node_address: Option<NodeAddress>,
    backoff_current: Option<Duration>,
}

enum Signal {
    /// `None` when every client handle is gone
    Stop(Option<oneshot::Sender<()>>),
    Discovered(Result<Discovered>),
    BackoffElapsed,
    Lost(String),
}

pub(crate) struct ConnectionSupervisor {
    config: Arc<Config>,
    discovery: Arc<DiscoveryClient>,
    policy: BackoffPolicy,
    events: EventSink,
    control: mpsc::Receiver<Control>,
    snapshot: watch::Sender<Snapshot>,
    state: ConnectionState,
    ever_connected: bool,
    attempt: Option<JoinHandle<Result<Discovered>>>,
    verifier: Option<RoleVerifier>,
    retry_at: Option<Instant>,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        config: Arc<Config>,
        discovery: DiscoveryClient,
        events: EventSink,
        control: mpsc::Receiver<Control>,
        snapshot: watch::Sender<Snapshot>,
    ) -> Self {
        Self {
            policy: BackoffPolicy::from_config(&config),
            config,
            discovery: Arc::new(discovery),
            events,
            control,
            snapshot,
            state: ConnectionState {
                phase: Phase::Init,
                handle: None,
                node_address: None,
                backoff_current: None,
            },
            ever_connected: false,
            attempt: None,
            verifier: None,
            retry_at: None,
        }
    }

    /// Drive the state machine until stopped.
    pub(crate) async fn run(mut self) {
        info!(
            group = %self.config.group,
            role = %self.config.role,
            monitors = self.config.monitors.len(),
            "Supervisor starting"
        );
        self.begin_connecting();

        loop {
            match self.next_signal().await {
                Signal::Stop(ack) => {
                    self.terminate().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                Signal::Discovered(Ok(found)) => self.adopt(found).await,
                Signal::Discovered(Err(e)) => self.enter_backoff(&e),
                Signal::BackoffElapsed => {
                    self.retry_at = None;
                    self.begin_connecting();
                }
                Signal::Lost(reason) => {
                    self.release(&reason).await;
                    self.begin_connecting();
                }
            }
        }
    }

    async fn next_signal(&mut self) -> Signal {
        let handle = self.state.handle.clone();

        tokio::select! {
            biased;

            msg = self.control.recv() => match msg {
                Some(Control::Stop(ack)) => Signal::Stop(Some(ack)),
                None => Signal::Stop(None),
            },
            outcome = join_attempt(&mut self.attempt) => Signal::Discovered(outcome),
            reason = connection_lost(handle.as_deref()) => Signal::Lost(reason),
            failure = verification_failed(&mut self.verifier) => Signal::Lost(failure.to_string()),
            _ = backoff_elapsed(self.retry_at) => Signal::BackoffElapsed,
        }
    }

    fn begin_connecting(&mut self) {
        self.state.phase = Phase::Connecting;
        self.publish();

        let discovery = Arc::clone(&self.discovery);
        self.attempt = Some(tokio::spawn(async move { discovery.discover().await }));
        debug!("Discovery attempt started");
    }

    async fn adopt(&mut self, found: Discovered) {
        if let Some(previous) = self.state.handle.take() {
            previous.close().await;
        }

        let reconnect = self.ever_connected;
        self.ever_connected = true;

        self.state = ConnectionState {
            phase: Phase::Connected,
            handle: Some(Arc::clone(&found.connection)),
            node_address: Some(found.address.clone()),
            backoff_current: None,
        };
        self.verifier = self
            .config
            .verify_interval()
            .map(|period| RoleVerifier::spawn(found.connection, self.config.role, period));

        self.publish();
        self.events.connected(&found.address, reconnect);
    }

    fn enter_backoff(&mut self, error: &FailoverError) {
        let delay = self.policy.next(self.state.backoff_current);
        self.state.phase = Phase::Backoff;
        self.state.backoff_current = Some(delay);
        self.retry_at = Some(Instant::now() + delay);

        self.publish();
        self.events.connection_failed(&error.to_string(), delay);
    }

    /// Leave `Connected`: stop checks, close the handle, forget the address.
    async fn release(&mut self, reason: &str) {
        self.verifier = None;
        let address = self.state.node_address.take();
        let handle = self.state.handle.take();
        self.state.phase = Phase::Connecting;
        self.publish();

        self.events.disconnected(address.as_ref(), reason);
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    async fn terminate(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            if attempt.is_finished() {
                if let Ok(Ok(found)) = attempt.await {
                    found.connection.close().await;
                }
            } else {
                attempt.abort();
            }
        }
        self.verifier = None;
        self.retry_at = None;

        let handle = self.state.handle.take();
        self.state = ConnectionState {
            phase: Phase::Terminated,
            handle: None,
            node_address: None,
            backoff_current: None,
        };
        if let Some(handle) = handle {
            handle.close().await;
        }

        self.publish();
        self.events.terminated();
    }

    fn publish(&self) {
        self.snapshot.send_replace(Snapshot {
            status: ConnectionStatus {
                phase: self.state.phase,
                node_address: self.state.node_address.clone(),
                backoff_current: self.state.backoff_current,
            },
            handle: self.state.handle.clone(),
        });
    }
}

/// Outcome of the running discovery attempt. A panicked or cancelled attempt
/// counts as a failed one.
async fn join_attempt(attempt: &mut Option<JoinHandle<Result<Discovered>>>) -> Result<Discovered> {
    let Some(task) = attempt.as_mut() else {
        return pending().await;
    };
    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => Err(FailoverError::Internal(format!("discovery task failed: {}", e))),
    };
    *attempt = None;
    outcome
}

async fn connection_lost(handle: Option<&dyn Connection>) -> String {
    match handle {
        Some(handle) => handle.closed().await,
        None => pending().await,
    }
}

async fn verification_failed(verifier: &mut Option<RoleVerifier>) -> FailoverError {
    match verifier {
        Some(verifier) => match verifier.failed().await {
            Some(failure) => failure,
            None => pending().await,
        },
        None => pending().await,
    }
}

async fn backoff_elapsed(retry_at: Option<Instant>) {
    match retry_at {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
