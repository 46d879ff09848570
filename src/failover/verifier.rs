//! Periodic role re-check of the live node connection.
//!
//! Catches a node that stops holding the expected role without closing the
//! socket. Each check runs as its own task and is aborted along with the
//! verifier. A failed check, a panic inside the check, or an error reply all
//! surface the same way.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::role::verify_role;
use crate::config::Role;
use crate::datastore::Connection;
use crate::error::{FailoverError, Result};

/// Owns the timer task for one connection. Dropping it stops the checks.
pub struct RoleVerifier {
    task: JoinHandle<()>,
    failures: mpsc::Receiver<FailoverError>,
}

impl RoleVerifier {
    /// First check fires one `period` from now, then every `period` after.
    pub fn spawn(connection: Arc<dyn Connection>, role: Role, period: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(run_checks(connection, role, period, tx));
        Self { task, failures: rx }
    }

    /// Resolves with the next failed check.
    pub async fn failed(&mut self) -> Option<FailoverError> {
        self.failures.recv().await
    }
}

impl Drop for RoleVerifier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// In-flight check; aborted with the timer task so it cannot outlive the verifier.
struct CheckTask(JoinHandle<Result<()>>);

impl Drop for CheckTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_checks(
    connection: Arc<dyn Connection>,
    role: Role,
    period: Duration,
    failures: mpsc::Sender<FailoverError>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let conn = Arc::clone(&connection);
        let mut check = CheckTask(tokio::spawn(async move {
            verify_role(conn.as_ref(), role).await
        }));

        let failure = match (&mut check.0).await {
            Ok(Ok(())) => {
                debug!(role = %role, "Role check passed");
                continue;
            }
            Ok(Err(e @ FailoverError::VerificationFailed(_))) => e,
            Ok(Err(e)) => FailoverError::VerificationFailed(e.to_string()),
            Err(e) => FailoverError::VerificationFailed(format!("role check aborted: {}", e)),
        };

        warn!(role = %role, error = %failure, "Role check failed");
        if failures.try_send(failure).is_err() && failures.is_closed() {
            return;
        }
    }
}
