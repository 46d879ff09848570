//! Public handle to a running failover supervisor.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use super::discovery::{DiscoveryClient, RandomSource, ThreadRandom};
use super::events::{EventSink, SupervisorEvent};
use super::proxy::CommandProxy;
use super::supervisor::{
    ConnectionStatus, ConnectionSupervisor, Control, Phase, Snapshot,
};
use crate::command::{Command, Value};
use crate::config::{Config, NodeAddress};
use crate::datastore::Connector;
use crate::error::{FailoverError, Result};

/// Client for a replicated key-value cluster that follows failovers.
///
/// Cheap to clone; all clones share one supervisor. The supervisor stops on
/// [`stop`](Self::stop) or once every clone is dropped.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use kv_failover::{Command, Config, FailoverClient, MonitorAddress, RespConnector};
///
/// # async fn demo() -> kv_failover::Result<()> {
/// let config = Config::new(vec![MonitorAddress::new("10.0.0.1", 26379)], "cache");
/// let client = FailoverClient::start(config, Arc::new(RespConnector))?;
/// client.wait_connected().await?;
/// let reply = client.execute(Command::new("GET").arg("key")).await?;
/// println!("{}", reply);
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FailoverClient {
    proxy: CommandProxy,
    control: mpsc::Sender<Control>,
    snapshot: watch::Receiver<Snapshot>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl FailoverClient {
    /// Validate `config` and spawn the supervisor. Must be called from within
    /// a tokio runtime.
    pub fn start(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::start_with_random(config, connector, Arc::new(ThreadRandom))
    }

    /// Like [`start`](Self::start), with an explicit source for replica selection.
    pub fn start_with_random(
        config: Config,
        connector: Arc<dyn Connector>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let (control_tx, control_rx) = mpsc::channel(4);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::initial());
        let events = EventSink::new(config.log.clone());
        let events_tx = events.sender();

        let discovery = DiscoveryClient::new(Arc::clone(&config), connector, random);
        let supervisor =
            ConnectionSupervisor::new(config, discovery, events, control_rx, snapshot_tx);
        tokio::spawn(supervisor.run());

        Ok(Self {
            proxy: CommandProxy::new(snapshot_rx.clone()),
            control: control_tx,
            snapshot: snapshot_rx,
            events: events_tx,
        })
    }

    /// Run one command on the current node.
    ///
    /// # Errors
    /// `ConnectionClosed` right away when no node is connected. Error replies
    /// come back as `Server` or `UnknownCommand`.
    pub async fn execute(&self, command: Command) -> Result<Value> {
        self.proxy.execute(command).await
    }

    /// Run a batch on the current node; error replies stay in place as
    /// `Value::Error`.
    pub async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Value>> {
        self.proxy.pipeline(commands).await
    }

    /// Stop the supervisor and close the managed connection.
    ///
    /// Returns once the connection is closed. Calling it again is a no-op.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control.send(Control::Stop(ack_tx)).await.is_err() {
            debug!("Supervisor already stopped");
            return;
        }
        // Err means a concurrent stop won; the supervisor is gone either way
        let _ = ack_rx.await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.snapshot.borrow().status.clone()
    }

    /// Wait until a node is connected.
    ///
    /// # Errors
    /// `ConnectionClosed` once the supervisor has terminated.
    pub async fn wait_connected(&self) -> Result<NodeAddress> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| matches!(s.status.phase, Phase::Connected | Phase::Terminated))
            .await
            .map_err(|_| FailoverError::ConnectionClosed)?;

        match (&snapshot.status.phase, &snapshot.status.node_address) {
            (Phase::Connected, Some(address)) => Ok(address.clone()),
            _ => Err(FailoverError::ConnectionClosed),
        }
    }

    /// Subscribe to lifecycle events from this point on.
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}
