//! Fake monitor and data node servers speaking RESP over real TCP.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use kv_failover::datastore::{decode_value, encode_value};
use kv_failover::{MonitorAddress, NodeAddress, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

type Handler = Arc<dyn Fn(&[String]) -> Value + Send + Sync>;

/// A TCP server answering each request with `handler(args)`.
pub struct FakeServer {
    pub port: u16,
    kill: broadcast::Sender<()>,
    open: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Vec<String>>>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(handler: impl Fn(&[String]) -> Value + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler: Handler = Arc::new(handler);
        let (kill, _) = broadcast::channel(4);
        let open = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let kill_tx = kill.clone();
        let open_count = Arc::clone(&open);
        let log = Arc::clone(&received);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                let open = Arc::clone(&open_count);
                let log = Arc::clone(&log);
                let mut kill_rx = kill_tx.subscribe();
                open.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = serve(socket, handler, log) => {}
                        _ = kill_rx.recv() => {}
                    }
                    open.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            port,
            kill,
            open,
            received,
            task,
        }
    }

    pub fn monitor_address(&self) -> MonitorAddress {
        MonitorAddress::new("127.0.0.1", self.port)
    }

    pub fn node_address(&self) -> NodeAddress {
        NodeAddress::new("127.0.0.1", self.port)
    }

    /// Drop every accepted connection from the server side.
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Every request seen so far, across all connections.
    pub fn received(&self) -> Vec<Vec<String>> {
        self.received.lock().unwrap().clone()
    }

    /// Poll until no client connection is open.
    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.open_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connections still open");
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.kill_connections();
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, handler: Handler, log: Arc<Mutex<Vec<Vec<String>>>>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        loop {
            match decode_value(&mut buf) {
                Ok(Some(Value::Array(items))) => {
                    let args: Vec<String> = items
                        .iter()
                        .map(|v| v.as_str().unwrap_or_default().to_string())
                        .collect();
                    log.lock().unwrap().push(args.clone());
                    let mut out = BytesMut::new();
                    encode_value(&handler(&args), &mut out);
                    if socket.write_all(&out).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Ok(Some(_)) | Err(_) => return,
            }
        }
        match socket.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

pub fn bulk(s: &str) -> Value {
    Value::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn is(args: &[String], index: usize, expected: &str) -> bool {
    args.get(index)
        .map(|a| a.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

/// Monitor that reports `primary` for `group` and `replicas` as its replicas.
pub async fn monitor(
    group: &'static str,
    primary: Arc<Mutex<Option<u16>>>,
    replicas: Vec<u16>,
) -> FakeServer {
    FakeServer::start(move |args| {
        if !is(args, 0, "SENTINEL") || args.get(2).map(String::as_str) != Some(group) {
            return Value::Nil;
        }
        if is(args, 1, "get-master-addr-by-name") {
            match *primary.lock().unwrap() {
                Some(port) => Value::Array(vec![bulk("127.0.0.1"), bulk(&port.to_string())]),
                None => Value::Nil,
            }
        } else if is(args, 1, "slaves") {
            Value::Array(
                replicas
                    .iter()
                    .map(|port| {
                        Value::Array(vec![
                            bulk("name"),
                            bulk(&format!("127.0.0.1:{}", port)),
                            bulk("ip"),
                            bulk("127.0.0.1"),
                            bulk("port"),
                            bulk(&port.to_string()),
                        ])
                    })
                    .collect(),
            )
        } else {
            Value::Error("ERR unknown subcommand".into())
        }
    })
    .await
}

/// How a fake node answers role inquiries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleReply {
    Role(&'static str),
    /// Rejects ROLE, answers INFO replication
    InfoOnly(&'static str),
}

/// Data node named `name`: `GET` returns the name, `PING` returns PONG.
pub async fn node(name: &'static str, role: Arc<Mutex<RoleReply>>) -> FakeServer {
    FakeServer::start(move |args| {
        let command = args.first().map(|c| c.to_ascii_uppercase()).unwrap_or_default();
        let role = *role.lock().unwrap();
        match (command.as_str(), role) {
            ("ROLE", RoleReply::Role(r)) => {
                Value::Array(vec![bulk(r), Value::Int(0), Value::Array(vec![])])
            }
            ("ROLE", RoleReply::InfoOnly(_)) => {
                Value::Error("ERR unknown command 'ROLE', with args beginning with: ".into())
            }
            ("INFO", RoleReply::Role(r) | RoleReply::InfoOnly(r)) => bulk(&format!(
                "# Replication\r\nrole:{}\r\nconnected_slaves:0\r\n",
                r
            )),
            ("PING", _) => Value::Status("PONG".into()),
            ("AUTH", _) | ("SELECT", _) => Value::Status("OK".into()),
            ("GET", _) => bulk(name),
            _ => Value::Error(format!("ERR unknown command '{}'", command)),
        }
    })
    .await
}

/// A port nothing listens on.
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
