//! Error types for kv-failover

use thiserror::Error;

use crate::config::MonitorAddress;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailoverError {
    #[error("No monitor yielded a verified node (tried: {})", format_tried(.tried))]
    DiscoveryExhausted { tried: Vec<MonitorAddress> },

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Role verification failed: {0}")]
    VerificationFailed(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FailoverError {
    /// Whether this error means the connection it came from is unusable.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            FailoverError::ConnectionClosed
                | FailoverError::Disconnected { .. }
                | FailoverError::Connection(_)
        )
    }
}

fn format_tried(tried: &[MonitorAddress]) -> String {
    if tried.is_empty() {
        return "none".to_string();
    }
    tried
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, FailoverError>;
