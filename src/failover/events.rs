//! Lifecycle events: severity-mapped logs plus a broadcast for subscribers.

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::{LogConfig, LogSeverity, NodeAddress};

const EVENT_CAPACITY: usize = 64;

/// A supervisor state change, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A verified node connection was adopted
    Connected {
        address: NodeAddress,
        /// False only for the first successful connect of this client
        reconnect: bool,
    },
    /// The live connection was lost or failed its role check
    Disconnected {
        address: Option<NodeAddress>,
        reason: String,
    },
    /// Discovery found nothing; the next attempt runs after `retry_in`
    ConnectionFailed { reason: String, retry_in: Duration },
    Terminated,
}

macro_rules! log_at {
    ($severity:expr, $($arg:tt)+) => {
        match $severity {
            LogSeverity::Debug => tracing::debug!($($arg)+),
            LogSeverity::Info => tracing::info!($($arg)+),
            LogSeverity::Warning => tracing::warn!($($arg)+),
            LogSeverity::Error => tracing::error!($($arg)+),
            LogSeverity::Off => {}
        }
    };
}

/// Logs each event at its configured severity and broadcasts it.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    log: LogConfig,
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventSink {
    pub(crate) fn new(log: LogConfig) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { log, tx }
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<SupervisorEvent> {
        self.tx.clone()
    }

    pub(crate) fn connected(&self, address: &NodeAddress, reconnect: bool) {
        if reconnect {
            log_at!(self.log.reconnection, node = %address, "Reconnected to node");
        } else {
            info!(node = %address, "Connected to node");
        }
        self.emit(SupervisorEvent::Connected {
            address: address.clone(),
            reconnect,
        });
    }

    pub(crate) fn disconnected(&self, address: Option<&NodeAddress>, reason: &str) {
        match address {
            Some(node) => {
                log_at!(self.log.disconnection, node = %node, reason = %reason, "Lost connection to node")
            }
            None => log_at!(self.log.disconnection, reason = %reason, "Lost connection to node"),
        }
        self.emit(SupervisorEvent::Disconnected {
            address: address.cloned(),
            reason: reason.to_string(),
        });
    }

    pub(crate) fn connection_failed(&self, reason: &str, retry_in: Duration) {
        log_at!(
            self.log.failed_connection,
            reason = %reason,
            retry_in = ?retry_in,
            "Failed to connect, backing off"
        );
        self.emit(SupervisorEvent::ConnectionFailed {
            reason: reason.to_string(),
            retry_in,
        });
    }

    pub(crate) fn terminated(&self) {
        info!("Supervisor terminated");
        self.emit(SupervisorEvent::Terminated);
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}
