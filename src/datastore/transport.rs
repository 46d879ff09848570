//! TCP Transport Layer
//!
//! Single responsibility: Open a TCP stream to a host, honouring the connect timeout.
//! No knowledge of the wire protocol, authentication, or session management.

use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{FailoverError, Result};

/// A connected TCP transport.
///
/// Can only be constructed via `Transport::connect()`.
pub struct Transport {
    stream: TcpStream,
}

impl Transport {
    /// Connect to `host:port`, giving up after `timeout` when one is set.
    pub async fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        debug!(host = %host, port = port, "Connecting to TCP endpoint");

        let connect = TcpStream::connect((host, port));
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                FailoverError::Connection(format!(
                    "Connect to {}:{} timed out after {:?}",
                    host, port, limit
                ))
            })?,
            None => connect.await,
        }
        .map_err(|e| FailoverError::Connection(format!("Connect to {}:{} failed: {}", host, port, e)))?;

        // Commands are small and latency-bound
        let _ = stream.set_nodelay(true);

        debug!(host = %host, port = port, "TCP connected");
        Ok(Self { stream })
    }

    /// Split into separate read and write halves for concurrent use.
    pub fn split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}
