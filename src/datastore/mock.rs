//! Scripted in-memory cluster for unit tests.
//!
//! Monitors and nodes are looked up by `host:port` at connect and at command
//! time, so a test can change the topology while the supervisor is running.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::{Connection, Connector};
use crate::command::{Command, Value};
use crate::config::{ConnectOptions, NodeAddress};
use crate::error::{FailoverError, Result};

type Addr = (String, u16);

/// What a monitor answers.
#[derive(Debug, Clone)]
pub(crate) enum MonitorScript {
    /// Address for the group, or nil when the group is unknown
    Primary(Option<NodeAddress>),
    Replicas(Vec<NodeAddress>),
    /// Reply that is neither an address nor nil
    Garbage,
    /// Never answers
    Hang,
    /// Panics on any command
    Panic,
}

/// How a node answers role inquiries.
#[derive(Debug, Clone)]
pub(crate) enum RoleScript {
    /// ROLE supported, reporting this wire role
    Role(&'static str),
    /// ROLE unknown; INFO replication reports this wire role
    InfoOnly(&'static str),
    /// ROLE fails with a non-fallback error
    Broken,
}

#[derive(Default)]
struct ClusterState {
    monitors: HashMap<Addr, MonitorScript>,
    nodes: HashMap<Addr, RoleScript>,
    connects: Vec<Addr>,
    live: Vec<Arc<MockConnection>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn monitor(&self, host: &str, port: u16, script: MonitorScript) -> &Self {
        self.state
            .lock()
            .unwrap()
            .monitors
            .insert((host.to_string(), port), script);
        self
    }

    pub(crate) fn node(&self, host: &str, port: u16, role: RoleScript) -> &Self {
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert((host.to_string(), port), role);
        self
    }

    pub(crate) fn remove_node(&self, host: &str, port: u16) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .remove(&(host.to_string(), port));
    }

    /// Close every live connection to `host:port` from the server side.
    pub(crate) fn kill(&self, host: &str, port: u16) {
        let victims: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .live
                .iter()
                .filter(|c| c.addr.0 == host && c.addr.1 == port)
                .cloned()
                .collect()
        };
        for conn in victims {
            conn.mark_closed("Connection killed".to_string());
        }
    }

    /// Every connect attempt, in order, successful or not.
    pub(crate) fn connects(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .connects
            .iter()
            .map(|(h, p)| format!("{}:{}", h, p))
            .collect()
    }

    pub(crate) fn open_connections(&self, host: &str, port: u16) -> usize {
        self.state
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|c| c.addr.0 == host && c.addr.1 == port && c.is_open())
            .count()
    }

    pub(crate) fn open_total(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|c| c.is_open())
            .count()
    }

    /// Open connections someone still holds. A dropped connection counts as
    /// gone, the way a dropped socket is.
    pub(crate) fn held_total(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|c| c.is_open() && Arc::strong_count(c) > 1)
            .count()
    }
}

#[async_trait]
impl Connector for MockCluster {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>> {
        let addr = (host.to_string(), port);
        let mut state = self.state.lock().unwrap();
        state.connects.push(addr.clone());

        let reachable = state.monitors.contains_key(&addr) || state.nodes.contains_key(&addr);
        if !reachable {
            return Err(FailoverError::Connection(format!(
                "Connect to {}:{} failed: connection refused",
                host, port
            )));
        }

        let (closed, _) = watch::channel(None);
        let conn = Arc::new(MockConnection {
            addr,
            cluster: Arc::clone(&self.state),
            closed,
        });
        state.live.push(Arc::clone(&conn));
        Ok(conn)
    }
}

pub(crate) struct MockConnection {
    addr: Addr,
    cluster: Arc<Mutex<ClusterState>>,
    closed: watch::Sender<Option<String>>,
}

impl MockConnection {
    fn mark_closed(&self, reason: String) {
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn monitor_script(&self) -> Option<MonitorScript> {
        self.cluster.lock().unwrap().monitors.get(&self.addr).cloned()
    }

    fn answer(&self, command: &Command) -> Result<Value> {
        let args: Vec<String> = command
            .args()
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        let name = command.name();
        let state = self.cluster.lock().unwrap();

        if let Some(script) = state.monitors.get(&self.addr) {
            return Ok(match (name.as_str(), args.get(1).map(String::as_str), script) {
                ("SENTINEL", Some("get-master-addr-by-name"), MonitorScript::Primary(addr)) => {
                    match addr {
                        Some(a) => Value::Array(vec![bulk(&a.host), bulk(&a.port.to_string())]),
                        None => Value::Nil,
                    }
                }
                ("SENTINEL", Some("slaves"), MonitorScript::Replicas(replicas)) => Value::Array(
                    replicas
                        .iter()
                        .map(|r| {
                            Value::Array(vec![
                                bulk("name"),
                                bulk(&r.to_string()),
                                bulk("ip"),
                                bulk(&r.host),
                                bulk("port"),
                                bulk(&r.port.to_string()),
                                bulk("flags"),
                                bulk("slave"),
                            ])
                        })
                        .collect(),
                ),
                ("SENTINEL", Some("slaves"), MonitorScript::Primary(_)) => Value::Array(vec![]),
                _ => Value::Status("garbage".into()),
            });
        }

        let role = state
            .nodes
            .get(&self.addr)
            .cloned()
            .ok_or_else(|| FailoverError::Disconnected {
                reason: "Node gone".into(),
            })?;
        drop(state);

        match name.as_str() {
            "ROLE" => match role {
                RoleScript::Role(r) => Ok(Value::Array(vec![
                    bulk(r),
                    Value::Int(0),
                    Value::Array(vec![]),
                ])),
                RoleScript::InfoOnly(_) => Err(FailoverError::UnknownCommand(
                    "ERR unknown command 'ROLE'".into(),
                )),
                RoleScript::Broken => Err(FailoverError::Server("LOADING dataset in memory".into())),
            },
            "INFO" => match role {
                RoleScript::Role(r) | RoleScript::InfoOnly(r) => Ok(bulk(&format!(
                    "# Replication\r\nrole:{}\r\nconnected_slaves:0\r\n",
                    r
                ))),
                RoleScript::Broken => Err(FailoverError::Server("LOADING dataset in memory".into())),
            },
            "PING" => Ok(Value::Status("PONG".into())),
            "WHOAMI" => Ok(bulk(&format!("{}:{}", self.addr.0, self.addr.1))),
            "PANIC" => panic!("mock connection asked to panic"),
            other => Err(FailoverError::Server(format!("ERR unsupported in mock: {}", other))),
        }
    }
}

fn bulk(s: &str) -> Value {
    Value::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&self, command: Command) -> Result<Value> {
        if let Some(reason) = self.closed.borrow().clone() {
            return Err(FailoverError::Disconnected { reason });
        }
        // Outside the cluster lock so a panic does not poison it
        match self.monitor_script() {
            Some(MonitorScript::Hang) => std::future::pending::<()>().await,
            Some(MonitorScript::Panic) => panic!("mock monitor asked to panic"),
            _ => {}
        }
        self.answer(&command)
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Value>> {
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            match self.execute(command).await {
                Ok(v) => replies.push(v),
                Err(FailoverError::Server(e)) | Err(FailoverError::UnknownCommand(e)) => {
                    replies.push(Value::Error(e))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(replies)
    }

    async fn close(&self) {
        self.mark_closed("Closed by client".to_string());
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed.subscribe();
        let reason = match rx.wait_for(|r| r.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "Connection dropped".to_string(),
        };
        reason
    }

    fn is_open(&self) -> bool {
        self.closed.borrow().is_none()
    }
}
