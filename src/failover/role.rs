//! Role inquiry against a data node.
//!
//! Two strategies, tried in order:
//!
//! 1. `ROLE`: the first element of the reply is the role name.
//! 2. `INFO replication`: free text of `key:value` lines; the `role` key.
//!
//! Only an unknown-command rejection of a strategy moves on to the next one.
//! Any other error is returned as is.

use std::collections::HashMap;
use tracing::debug;

use crate::command::{Command, Value};
use crate::config::Role;
use crate::datastore::Connection;
use crate::error::{FailoverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleQuery {
    RoleCommand,
    ReplicationInfo,
}

const STRATEGIES: [RoleQuery; 2] = [RoleQuery::RoleCommand, RoleQuery::ReplicationInfo];

impl RoleQuery {
    fn command(self) -> Command {
        match self {
            RoleQuery::RoleCommand => Command::new("ROLE"),
            RoleQuery::ReplicationInfo => Command::new("INFO").arg("replication"),
        }
    }

    fn parse(self, reply: &Value) -> Result<String> {
        match self {
            RoleQuery::RoleCommand => role_from_reply(reply),
            RoleQuery::ReplicationInfo => role_from_info(reply),
        }
    }
}

/// Ask the node which role it currently holds, as its wire name.
pub async fn query_role(conn: &dyn Connection) -> Result<String> {
    let mut last_rejection = None;
    for strategy in STRATEGIES {
        match conn.execute(strategy.command()).await {
            Ok(reply) => return strategy.parse(&reply),
            Err(FailoverError::UnknownCommand(message)) => {
                debug!(strategy = ?strategy, "Role strategy unsupported, trying next");
                last_rejection = Some(message);
            }
            Err(e) => return Err(e),
        }
    }
    Err(FailoverError::ProtocolMismatch(format!(
        "No role inquiry supported: {}",
        last_rejection.unwrap_or_default()
    )))
}

/// Check that the node holds `expected`.
pub async fn verify_role(conn: &dyn Connection, expected: Role) -> Result<()> {
    let reported = query_role(conn).await?;
    if reported == expected.wire_name() {
        Ok(())
    } else {
        Err(FailoverError::VerificationFailed(format!(
            "expected {}, node reports '{}'",
            expected.wire_name(),
            reported
        )))
    }
}

fn role_from_reply(reply: &Value) -> Result<String> {
    reply
        .as_array()
        .and_then(|items| items.first())
        .and_then(|first| first.as_str())
        .map(str::to_string)
        .ok_or_else(|| FailoverError::ProtocolMismatch(format!("Malformed ROLE reply: {:?}", reply)))
}

fn role_from_info(reply: &Value) -> Result<String> {
    let text = reply.as_str().ok_or_else(|| {
        FailoverError::ProtocolMismatch(format!("Malformed INFO reply: {:?}", reply))
    })?;
    parse_info(text)
        .remove("role")
        .ok_or_else(|| FailoverError::ProtocolMismatch("INFO reply has no role field".into()))
}

/// Parse `key:value` lines. Lines without a colon are dropped; only the first
/// colon splits, so values may contain colons.
pub fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}
