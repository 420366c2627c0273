//! Bounded retry policy and the per-node retry state it drives.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How failed operations with a retriable error are retried.
///
/// `max_attempts` counts every attempt including the first one, so the
/// default of 3 means the initial operation plus at most two retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Double the delay after every attempt.
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            exponential: true,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms;
        let ms = if self.exponential {
            let shift = attempt.saturating_sub(1).min(32);
            base.saturating_mul(1u64 << shift)
        } else {
            base
        };
        Duration::from_millis(ms.min(self.max_backoff_ms.max(base)))
    }
}

/// Retry bookkeeping attached to a graph node, visible through status
/// queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Number of attempts made so far.
    pub attempt: u32,
    /// A retry transaction is scheduled.
    pub scheduled: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Transaction in which the last attempt failed.
    pub failed_in_txn: u64,
}
