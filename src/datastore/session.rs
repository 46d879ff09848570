//! Data Node Session
//!
//! Single responsibility: One ready-to-use RESP connection.
//!
//! A `Session` can only be created via `Session::establish()`, which connects,
//! authenticates and selects the database before returning. If you have a
//! `Session`, you can run commands on it.
//!
//! # Reply Correlation
//!
//! RESP has no request IDs: replies arrive in the order requests were written.
//! Writes and the queue of pending reply channels are therefore updated under
//! the same writer lock, and the receiver task pops the queue front for every
//! decoded reply.
//!
//! A request that times out leaves the stream out of step, so a timeout closes
//! the session. The same holds for a write that stalls past the request
//! timeout, and for a caller dropped while its frame is only partly written.
//!
//! # Lifecycle
//!
//! Sessions never reconnect. When the socket dies every pending request fails
//! with `Disconnected` and `closed()` resolves with the reason.

use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use super::protocol::{decode_value, encode_command, reply_to_result};
use super::transport::Transport;
use super::{Connection, Connector};
use crate::command::{Command, Value};
use crate::config::ConnectOptions;
use crate::error::{FailoverError, Result};

type Pending = Arc<Mutex<VecDeque<oneshot::Sender<Result<Value>>>>>;

/// Opens `Session`s over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespConnector;

#[async_trait]
impl Connector for RespConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>> {
        let session = Session::establish(host, port, options).await?;
        Ok(Arc::new(session))
    }
}

/// A live RESP connection.
pub struct Session {
    endpoint: String,
    /// Write half; `None` once closed
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Reply channels in request order
    pending: Pending,
    /// `Some(reason)` once the connection is gone
    closed: Arc<watch::Sender<Option<String>>>,
    request_timeout: Option<Duration>,
    recv_task: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Establish a new session.
    ///
    /// # Steps
    /// 1. TCP connect (bounded by the connect timeout)
    /// 2. Start receiver task
    /// 3. `AUTH` when a password is configured
    /// 4. `SELECT` when a database is configured
    pub async fn establish(host: &str, port: u16, options: &ConnectOptions) -> Result<Self> {
        let endpoint = format!("{}:{}", host, port);
        debug!(endpoint = %endpoint, "Establishing session");

        let transport = Transport::connect(host, port, options.connect_timeout()).await?;
        let (reader, writer) = transport.split();

        let pending: Pending = Arc::new(Mutex::new(VecDeque::new()));
        let (closed_tx, _) = watch::channel(None);
        let closed = Arc::new(closed_tx);

        let recv_task = tokio::spawn(receiver_loop(
            endpoint.clone(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        let session = Self {
            endpoint,
            writer: Mutex::new(Some(writer)),
            pending,
            closed,
            request_timeout: options.request_timeout(),
            recv_task,
        };

        if let Some(password) = &options.password {
            let mut auth = Command::new("AUTH");
            if let Some(username) = &options.username {
                auth = auth.arg(username);
            }
            session
                .call(auth.arg(password))
                .await
                .map_err(|e| FailoverError::Connection(format!("Authentication failed: {}", e)))?;
            debug!(endpoint = %session.endpoint, "Authenticated");
        }

        if let Some(database) = options.database {
            session
                .call(Command::new("SELECT").arg(database.to_string()))
                .await?;
            debug!(endpoint = %session.endpoint, database = database, "Database selected");
        }

        info!(endpoint = %session.endpoint, "Session established");
        Ok(session)
    }

    /// Run one command. Error replies are returned as `Err`.
    pub async fn call(&self, command: Command) -> Result<Value> {
        let name = command.name();
        let mut receivers = self.send(std::slice::from_ref(&command)).await?;
        let rx = receivers
            .pop()
            .ok_or_else(|| FailoverError::Internal("No reply channel for request".into()))?;
        let reply = self.await_reply(rx, &name).await?;
        reply_to_result(reply)
    }

    /// Run a batch of commands written in one go.
    pub async fn call_batch(&self, commands: Vec<Command>) -> Result<Vec<Value>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let receivers = self.send(&commands).await?;
        let mut replies = Vec::with_capacity(receivers.len());
        for (rx, command) in receivers.into_iter().zip(&commands) {
            replies.push(self.await_reply(rx, &command.name()).await?);
        }
        Ok(replies)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Write the encoded commands and queue one reply channel per command.
    async fn send(&self, commands: &[Command]) -> Result<Vec<oneshot::Receiver<Result<Value>>>> {
        let mut buf = BytesMut::new();
        for command in commands {
            encode_command(command, &mut buf);
        }

        let mut writer_guard = self.writer.lock().await;
        let Some(writer) = writer_guard.as_mut() else {
            return Err(self.disconnected());
        };

        let mut receivers = Vec::with_capacity(commands.len());
        {
            let mut pending = self.pending.lock().await;
            // Checked under the pending lock: the receiver task marks the
            // session closed before it drains the queue.
            if self.closed.borrow().is_some() {
                return Err(self.disconnected());
            }
            for _ in commands {
                let (tx, rx) = oneshot::channel();
                pending.push_back(tx);
                receivers.push(rx);
            }
        }

        // From here on a dropped future leaves queued reply slots and possibly
        // half a frame on the wire.
        let mut in_flight = WriteInFlight {
            session: self,
            armed: true,
        };
        let written = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, writer.write_all(&buf)).await {
                Ok(written) => written,
                Err(_) => {
                    in_flight.disarm();
                    writer_guard.take();
                    drop(writer_guard);
                    self.shutdown(format!("Write timed out after {:?}", limit))
                        .await;
                    return Err(FailoverError::Timeout(format!(
                        "write to {} after {:?}",
                        self.endpoint, limit
                    )));
                }
            },
            None => writer.write_all(&buf).await,
        };
        in_flight.disarm();

        if let Err(e) = written {
            writer_guard.take();
            drop(writer_guard);
            self.shutdown(format!("Write failed: {}", e)).await;
            return Err(self.disconnected());
        }

        Ok(receivers)
    }

    /// Synchronous part of `shutdown`, usable from `Drop`.
    fn abandon(&self, reason: &str) {
        mark_closed(&self.closed, reason.to_string());
        self.recv_task.abort();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pending = Arc::clone(&self.pending);
            let reason = reason.to_string();
            runtime.spawn(async move { fail_pending(&pending, &reason).await });
        }
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Result<Value>>,
        name: &str,
    ) -> Result<Value> {
        let received = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.shutdown(format!("Request {} timed out", name)).await;
                    return Err(FailoverError::Timeout(format!(
                        "{} on {} after {:?}",
                        name, self.endpoint, limit
                    )));
                }
            },
            None => rx.await,
        };
        received.map_err(|_| self.disconnected())?
    }

    fn disconnected(&self) -> FailoverError {
        let reason = self
            .closed
            .borrow()
            .clone()
            .unwrap_or_else(|| "Session closed".to_string());
        FailoverError::Disconnected { reason }
    }

    /// Mark closed, stop the receiver, fail pending requests, close the socket.
    async fn shutdown(&self, reason: String) {
        mark_closed(&self.closed, reason.clone());
        self.recv_task.abort();
        fail_pending(&self.pending, &reason).await;
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

#[async_trait]
impl Connection for Session {
    async fn execute(&self, command: Command) -> Result<Value> {
        self.call(command).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Value>> {
        self.call_batch(commands).await
    }

    async fn close(&self) {
        if self.is_open() {
            debug!(endpoint = %self.endpoint, "Closing session");
        }
        self.shutdown("Closed by client".to_string()).await;
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "Session dropped".to_string(),
        };
        reason
    }

    fn is_open(&self) -> bool {
        self.closed.borrow().is_none()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

/// Closes the session if dropped while armed: the stream can no longer be
/// trusted to line up with the reply queue.
struct WriteInFlight<'a> {
    session: &'a Session,
    armed: bool,
}

impl WriteInFlight<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WriteInFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(endpoint = %self.session.endpoint, "Request dropped mid-write, closing session");
            self.session.abandon("Request cancelled mid-write");
        }
    }
}

/// Record why the session ended; the first reason wins.
fn mark_closed(closed: &watch::Sender<Option<String>>, reason: String) {
    closed.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

async fn fail_pending(pending: &Pending, reason: &str) {
    let mut pending = pending.lock().await;
    for tx in pending.drain(..) {
        let _ = tx.send(Err(FailoverError::Disconnected {
            reason: reason.to_string(),
        }));
    }
}

/// Receiver loop - runs in a spawned task.
///
/// Decodes replies and hands each one to the oldest pending request.
async fn receiver_loop(
    endpoint: String,
    mut reader: OwnedReadHalf,
    pending: Pending,
    closed: Arc<watch::Sender<Option<String>>>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let reason = 'conn: loop {
        loop {
            match decode_value(&mut buf) {
                Ok(Some(value)) => {
                    let waiter = pending.lock().await.pop_front();
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Ok(value));
                        }
                        None => warn!(endpoint = %endpoint, "Received reply with no pending request"),
                    }
                }
                Ok(None) => break,
                Err(e) => break 'conn format!("Protocol error: {}", e),
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => break "Connection closed by peer".to_string(),
            Ok(_) => {}
            Err(e) => break format!("Read error: {}", e),
        }
    };

    debug!(endpoint = %endpoint, reason = %reason, "Receiver loop ended");
    mark_closed(&closed, reason.clone());
    fail_pending(&pending, &reason).await;
}
