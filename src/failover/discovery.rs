//! Node discovery through monitors.
//!
//! Monitors are asked strictly in configured order; the first one whose
//! answer survives role verification wins and later monitors are never
//! contacted.
//!
//! # Per-monitor attempt
//!
//! 1. Connect to the monitor
//! 2. Resolve the address: the primary for the group, or a random replica
//! 3. Connect to the resolved node with the configured connection options
//! 4. Verify the node's role
//! 5. Close the monitor connection, hand back the node connection
//!
//! Any failure closes whatever was opened and moves on to the next monitor.

use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::role::verify_role;
use crate::command::{Command, Value};
use crate::config::{Config, MonitorAddress, NodeAddress, Role};
use crate::datastore::{Connection, Connector};
use crate::error::{FailoverError, Result};

/// Source of randomness for replica selection.
pub trait RandomSource: Send + Sync + 'static {
    /// Index in `0..len`. Only called with `len > 0`.
    fn pick(&self, len: usize) -> usize;
}

/// Uniform choice backed by the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn pick(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

/// A verified node and the open connection to it.
pub struct Discovered {
    pub address: NodeAddress,
    pub connection: Arc<dyn Connection>,
}

impl std::fmt::Debug for Discovered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovered")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

pub struct DiscoveryClient {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    random: Arc<dyn RandomSource>,
}

impl DiscoveryClient {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            config,
            connector,
            random,
        }
    }

    /// Walk the monitors once and return the first verified node.
    ///
    /// # Errors
    /// `DiscoveryExhausted` listing every monitor tried when none worked.
    pub async fn discover(&self) -> Result<Discovered> {
        let mut tried = Vec::with_capacity(self.config.monitors.len());

        for monitor in &self.config.monitors {
            tried.push(monitor.clone());
            match self.try_monitor(monitor).await {
                Ok(found) => {
                    info!(
                        monitor = %monitor,
                        node = %found.address,
                        role = %self.config.role,
                        "Discovered verified node"
                    );
                    return Ok(found);
                }
                Err(e) => {
                    warn!(monitor = %monitor, error = %e, "Monitor yielded no usable node");
                }
            }
        }

        Err(FailoverError::DiscoveryExhausted { tried })
    }

    async fn try_monitor(&self, monitor: &MonitorAddress) -> Result<Discovered> {
        debug!(monitor = %monitor, "Querying monitor");
        let monitor_conn = self
            .connector
            .connect(&monitor.host, monitor.port, &self.config.connection.for_monitor())
            .await?;

        let result = self.resolve_and_connect(monitor_conn.as_ref()).await;
        monitor_conn.close().await;
        result
    }

    async fn resolve_and_connect(&self, monitor_conn: &dyn Connection) -> Result<Discovered> {
        let address = self.resolve(monitor_conn).await?;
        debug!(node = %address, "Monitor resolved node, connecting");

        let node_conn = self
            .connector
            .connect(&address.host, address.port, &self.config.connection)
            .await?;

        if let Err(e) = verify_role(node_conn.as_ref(), self.config.role).await {
            node_conn.close().await;
            return Err(e);
        }

        Ok(Discovered {
            address,
            connection: node_conn,
        })
    }

    async fn resolve(&self, monitor_conn: &dyn Connection) -> Result<NodeAddress> {
        match self.config.role {
            Role::Primary => {
                let reply = monitor_conn
                    .execute(
                        Command::new("SENTINEL")
                            .arg("get-master-addr-by-name")
                            .arg(&self.config.group),
                    )
                    .await?;
                parse_primary_reply(&reply, &self.config.group)
            }
            Role::Replica => {
                let reply = monitor_conn
                    .execute(Command::new("SENTINEL").arg("slaves").arg(&self.config.group))
                    .await?;
                let replicas = parse_replica_list(&reply)?;
                if replicas.is_empty() {
                    return Err(FailoverError::ProtocolMismatch(format!(
                        "No replicas known for group '{}'",
                        self.config.group
                    )));
                }
                let index = self.random.pick(replicas.len()).min(replicas.len() - 1);
                Ok(replicas[index].clone())
            }
        }
    }
}

/// `[host, port]`, or nil when the monitor does not know the group.
fn parse_primary_reply(reply: &Value, group: &str) -> Result<NodeAddress> {
    if reply.is_nil() {
        return Err(FailoverError::ProtocolMismatch(format!(
            "Monitor does not know group '{}'",
            group
        )));
    }
    match reply.as_array() {
        Some([host, port]) => address_from(host, port),
        _ => Err(FailoverError::ProtocolMismatch(format!(
            "Malformed primary address reply: {:?}",
            reply
        ))),
    }
}

/// Each entry is a flat `[key, value, key, value, ...]` array; `ip` and `port`
/// are the fields we need. Entries missing them are skipped.
fn parse_replica_list(reply: &Value) -> Result<Vec<NodeAddress>> {
    let entries = reply.as_array().ok_or_else(|| {
        FailoverError::ProtocolMismatch(format!("Malformed replica list reply: {:?}", reply))
    })?;

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let fields = entry.as_array()?;
            let lookup = |name: &str| {
                fields
                    .chunks_exact(2)
                    .find(|pair| pair[0].as_str() == Some(name))
                    .map(|pair| &pair[1])
            };
            address_from(lookup("ip")?, lookup("port")?).ok()
        })
        .collect())
}

fn address_from(host: &Value, port: &Value) -> Result<NodeAddress> {
    let host = host
        .as_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| FailoverError::ProtocolMismatch(format!("Invalid host: {:?}", host)))?;
    let port = port
        .as_i64()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p > 0)
        .ok_or_else(|| FailoverError::ProtocolMismatch(format!("Invalid port: {:?}", port)))?;
    Ok(NodeAddress::new(host, port))
}
