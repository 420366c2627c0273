//! Transactions: request building, planning, execution and records.

pub(crate) mod executor;
pub(crate) mod planner;
pub mod record;
pub mod retry;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::value::AnyValue;

/// Resync flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncMode {
    /// Replace the whole desired state and remove SB leftovers created by NB.
    Full,
    /// Keep the desired state, only re-read the southbound plane.
    Downstream,
}

/// What started a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxnKind {
    Change,
    Resync { mode: ResyncMode },
    Retry { for_txn: u64, attempt: u32 },
    SbNotification,
}

impl fmt::Display for TxnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnKind::Change => write!(f, "CHANGE"),
            TxnKind::Resync {
                mode: ResyncMode::Full,
            } => write!(f, "FULL-RESYNC"),
            TxnKind::Resync {
                mode: ResyncMode::Downstream,
            } => write!(f, "DOWNSTREAM-RESYNC"),
            TxnKind::Retry { for_txn, attempt } => {
                write!(f, "RETRY(txn {for_txn}, attempt {attempt})")
            }
            TxnKind::SbNotification => write!(f, "SB-NOTIFICATION"),
        }
    }
}

/// Cancellation handle for an in-flight transaction.
///
/// Cancelling stops dispatching further operations; calls already handed to
/// descriptors run to completion and are recorded.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Per-transaction options.
#[derive(Debug, Clone)]
pub struct TxnOptions {
    /// Log the record after commit even when the scheduler does not do so
    /// by default.
    pub verbose: bool,
    /// Schedule retry transactions for retriable failures.
    pub retry_enabled: bool,
    pub description: Option<String>,
    pub cancel: Option<CancelToken>,
}

impl Default for TxnOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            retry_enabled: true,
            description: None,
            cancel: None,
        }
    }
}

impl TxnOptions {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancelToken::is_cancelled)
            .unwrap_or(false)
    }
}

/// A change request: ordered puts and deletes. For a key staged more than
/// once, the last operation wins.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub(crate) ops: Vec<(String, Option<AnyValue>)>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: impl Into<String>, value: AnyValue) -> Self {
        self.ops.push((key.into(), Some(value)));
        self
    }

    /// Put a JSON value, decoded by the descriptor owning the key.
    pub fn put_json(self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.put(key, AnyValue::from_json(value))
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push((key.into(), None));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Staged operations with duplicates collapsed, last one winning.
    pub(crate) fn into_ops(self) -> Vec<(String, Option<AnyValue>)> {
        let mut seen = std::collections::HashSet::new();
        let mut ops: Vec<_> = self
            .ops
            .into_iter()
            .rev()
            .filter(|(k, _)| seen.insert(k.clone()))
            .collect();
        ops.reverse();
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_operation_on_a_key_wins() {
        let txn = Txn::new()
            .put_json("iface/if1", serde_json::json!({"mtu": 1500}))
            .put_json("iface/if2", serde_json::json!({"mtu": 1500}))
            .delete("iface/if1");
        let ops = txn.into_ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].0, "iface/if2");
        assert_eq!(ops[1].0, "iface/if1");
        assert!(ops[1].1.is_none());
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let opts = TxnOptions::default().with_cancel(token.clone());
        assert!(!opts.is_cancelled());
        token.cancel();
        assert!(opts.is_cancelled());
    }

    #[test]
    fn kind_display() {
        assert_eq!(
            TxnKind::Resync {
                mode: ResyncMode::Downstream
            }
            .to_string(),
            "DOWNSTREAM-RESYNC"
        );
        assert_eq!(
            TxnKind::Retry {
                for_txn: 3,
                attempt: 2
            }
            .to_string(),
            "RETRY(txn 3, attempt 2)"
        );
    }
}
