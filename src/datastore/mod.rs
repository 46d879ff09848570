//! Data Store Client
//!
//! The capability the failover core needs from the underlying client: open a
//! connection, run commands on it, close it, and learn when it dies.
//!
//! # Architecture
//!
//! | Module      | Responsibility                                    |
//! |-------------|---------------------------------------------------|
//! | `transport` | TCP connect with timeout                          |
//! | `protocol`  | RESP2 encoding and incremental decoding           |
//! | `session`   | One live connection, reply correlation, close signal |
//!
//! The failover core only ever talks to the `Connector` and `Connection`
//! traits. `RespConnector` is the default implementation; tests plug in an
//! in-memory cluster instead.
//!
//! # Death Signal
//!
//! `Connection::closed()` resolves as soon as the connection is gone, whether
//! the peer closed it, the socket errored, or `close()` was called. Owners
//! select on it instead of polling a flag.

use async_trait::async_trait;
use std::sync::Arc;

use crate::command::{Command, Value};
use crate::config::ConnectOptions;
use crate::error::Result;

mod protocol;
mod session;
mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use protocol::{decode_value, encode_command, encode_value};
pub use session::{RespConnector, Session};

/// Opens connections to monitors and data nodes.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>>;
}

/// A live connection to a monitor or a data node.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Run one command and wait for its reply.
    ///
    /// Error replies come back as `Err`: `UnknownCommand` when the server does
    /// not know the command name, `Server` otherwise.
    async fn execute(&self, command: Command) -> Result<Value>;

    /// Send several commands in one batch, one reply per command in order.
    ///
    /// Error replies stay in the result as `Value::Error`; only a failure of
    /// the connection itself fails the whole batch.
    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Value>>;

    /// Close the connection. Idempotent, tolerant of a dead connection.
    async fn close(&self);

    /// Resolves with the reason once the connection is gone.
    async fn closed(&self) -> String;

    fn is_open(&self) -> bool;
}
