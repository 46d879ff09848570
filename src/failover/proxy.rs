//! Forwards commands to whichever node connection is live.

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::supervisor::{Phase, Snapshot};
use crate::command::{Command, Value};
use crate::datastore::Connection;
use crate::error::{FailoverError, Result};

/// Fails fast with `ConnectionClosed` whenever no node is connected. Never
/// retries; that is up to the caller.
#[derive(Clone)]
pub struct CommandProxy {
    snapshot: watch::Receiver<Snapshot>,
}

impl CommandProxy {
    pub(crate) fn new(snapshot: watch::Receiver<Snapshot>) -> Self {
        Self { snapshot }
    }

    pub async fn execute(&self, command: Command) -> Result<Value> {
        let conn = self.current()?;
        forward(conn.execute(command)).await
    }

    pub async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Value>> {
        let conn = self.current()?;
        forward(conn.pipeline(commands)).await
    }

    fn current(&self) -> Result<Arc<dyn Connection>> {
        let snapshot = self.snapshot.borrow();
        match (&snapshot.status.phase, &snapshot.handle) {
            (Phase::Connected, Some(handle)) => Ok(Arc::clone(handle)),
            _ => Err(FailoverError::ConnectionClosed),
        }
    }
}

/// The handle can die between the snapshot read and the reply. Loss of the
/// connection, or a panic from a handle torn down underneath us, reads as
/// `ConnectionClosed`.
async fn forward<T>(call: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Err(e)) if e.is_connection_loss() => {
            debug!(error = %e, "Connection lost during command");
            Err(FailoverError::ConnectionClosed)
        }
        Ok(result) => result,
        Err(_) => {
            warn!("Command forwarding panicked");
            Err(FailoverError::ConnectionClosed)
        }
    }
}
