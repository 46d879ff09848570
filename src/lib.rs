//! kv-failover - Monitor-driven failover client for replicated key-value clusters
//!
//! Asks a set of monitors where the current primary (or a replica) of a group
//! lives, keeps one verified connection to it, and rediscovers with backoff
//! whenever that connection is lost or the node changes role.
//!
//! ## Architecture
//!
//! ```text
//!  FailoverClient ──execute──> CommandProxy ──> live node connection
//!        │                          ^
//!        │ stop                     │ snapshot (watch)
//!        v                          │
//!  ConnectionSupervisor ────────────┘
//!    ├── DiscoveryClient ──> monitors (in order) ──> node + role check
//!    ├── RoleVerifier (periodic, optional)
//!    └── BackoffPolicy
//! ```
//!
//! ## Modules
//!
//! - `failover` - discovery, supervision, command forwarding
//! - `datastore` - the connection capability the core relies on, with a
//!   RESP2-over-TCP implementation
//! - `config` - TOML configuration and validation

pub mod command;
pub mod config;
pub mod datastore;
pub mod error;
pub mod failover;

// Re-exports
pub use command::{Command, Value};
pub use config::{Config, ConnectOptions, LogConfig, LogSeverity, MonitorAddress, NodeAddress, Role};
pub use datastore::{Connection, Connector, RespConnector};
pub use error::{FailoverError, Result};
pub use failover::{ConnectionStatus, FailoverClient, Phase, RandomSource, SupervisorEvent};
