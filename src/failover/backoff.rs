//! Retry delay policy between discovery attempts.

use std::time::Duration;

use crate::config::Config;

/// Multiplicative backoff: each retry waits 1.5x the previous delay, rounded
/// to the millisecond, up to an optional cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Option<Duration>,
}

impl BackoffPolicy {
    /// `max = None` grows without bound.
    pub fn new(initial: Duration, max: Option<Duration>) -> Self {
        Self { initial, max }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.backoff_initial(), config.backoff_max())
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Delay before the next attempt, given the delay used last time.
    ///
    /// The first failure after a successful connect has no previous delay and
    /// waits exactly `initial`.
    pub fn next(&self, current: Option<Duration>) -> Duration {
        match current {
            None => self.initial,
            Some(current) => self.next_backoff(current),
        }
    }

    /// `round(current * 1.5)`, capped.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let ms = u64::try_from(current.as_millis()).unwrap_or(u64::MAX);
        // Exact round-half-up of ms * 1.5 in integer arithmetic
        let grown = Duration::from_millis(ms.saturating_add(ms / 2 + ms % 2));
        match self.max {
            Some(max) => grown.min(max),
            None => grown,
        }
    }
}
