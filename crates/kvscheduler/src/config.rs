//! Scheduler configuration.
//!
//! Loaded from an optional JSON file, then overridden from the environment:
//!
//! | Variable                 | Field                 |
//! |--------------------------|-----------------------|
//! | `KVS_PARALLELISM`        | `parallelism`         |
//! | `KVS_OP_TIMEOUT_MS`      | `op_timeout_ms`       |
//! | `KVS_RETRY_MAX_ATTEMPTS` | `retry.max_attempts`  |
//! | `KVS_HISTORY_PATH`       | `history.persist_path`|

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::txn::retry::RetryPolicy;

/// Transaction history retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Record committed transactions at all.
    pub record: bool,
    /// Records older than this are trimmed. `0` keeps everything.
    pub age_limit_minutes: u64,
    /// Records started within this period after scheduler start are never
    /// trimmed.
    pub permanent_init_period_minutes: u64,
    /// Append records to this JSON-lines file instead of keeping them in
    /// memory only.
    pub persist_path: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            record: true,
            age_limit_minutes: 24 * 60,
            permanent_init_period_minutes: 60,
            persist_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of descriptor operations running at once inside one
    /// transaction.
    pub parallelism: usize,
    /// Timeout of a single Create/Update/Delete/Retrieve call.
    pub op_timeout_ms: u64,
    /// Capacity of the request queue in front of the engine.
    pub queue_capacity: usize,
    /// Log a human-readable summary of every committed transaction.
    pub print_txn_summary: bool,
    pub retry: RetryPolicy,
    pub history: HistoryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            op_timeout_ms: 30_000,
            queue_capacity: 256,
            print_txn_summary: false,
            retry: RetryPolicy::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Read the config file (if any), apply environment overrides and
    /// validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KVS_PARALLELISM") {
            self.parallelism = parse_var("KVS_PARALLELISM", &v)?;
        }
        if let Some(v) = lookup("KVS_OP_TIMEOUT_MS") {
            self.op_timeout_ms = parse_var("KVS_OP_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("KVS_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var("KVS_RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("KVS_HISTORY_PATH") {
            self.history.persist_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(SchedulerError::Config("parallelism must be at least 1".into()));
        }
        if self.op_timeout_ms == 0 {
            return Err(SchedulerError::Config("op_timeout_ms must be non-zero".into()));
        }
        if self.queue_capacity == 0 {
            return Err(SchedulerError::Config("queue_capacity must be non-zero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SchedulerError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SchedulerError::Config(format!("{name}={value:?}: {e}")))
}
