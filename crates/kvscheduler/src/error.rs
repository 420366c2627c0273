//! Error types for the scheduler and its descriptor contract.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::TxnOperation;
use crate::txn::record::RecordedTxn;

/// Error returned by descriptor callbacks (validate, create, update, delete,
/// retrieve).
///
/// Carries its own retriability hint which the default
/// [`crate::KvDescriptor::is_retriable_failure`] honours.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct DescriptorError {
    pub message: String,
    pub retriable: bool,
    /// Fields of the value rejected by validation, if the descriptor knows them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_fields: Vec<String>,
}

impl DescriptorError {
    /// A retriable failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
            invalid_fields: Vec::new(),
        }
    }

    /// A failure that repeating the operation cannot fix.
    pub fn non_retriable(message: impl Into<String>) -> Self {
        Self {
            retriable: false,
            ..Self::new(message)
        }
    }

    /// A validation failure naming the offending fields.
    pub fn invalid_value(message: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
            invalid_fields: fields,
        }
    }

    pub(crate) fn timeout(op: TxnOperation, key: &str, timeout_ms: u64) -> Self {
        Self::new(format!("{op} of {key} timed out after {timeout_ms} ms"))
    }
}

/// Per-key error taxonomy, attached to graph nodes and transaction records.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueError {
    /// Value rejected before any side effect. Never retried.
    #[error("invalid value: {message}")]
    Validation {
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        invalid_fields: Vec<String>,
    },

    /// Create/Update/Delete returned an error.
    #[error("operation failed: {message}")]
    Operation { message: String, retriable: bool },

    /// Not a descriptor error: something this value depends on is not satisfied.
    #[error("blocked by unsatisfied dependencies: {blocked_by:?}")]
    DependencyBlocked { blocked_by: Vec<String> },

    /// The value takes part in a dependency cycle.
    #[error("dependency cycle detected involving keys: {keys:?}")]
    Cycle { keys: Vec<String> },

    /// The owning descriptor failed to retrieve SB state.
    #[error("retrieve failed for descriptor {descriptor}: {message}")]
    Retrieval { descriptor: String, message: String },

    /// The transaction was cancelled before the operation was dispatched.
    #[error("transaction cancelled before the operation was started")]
    Cancelled,

    /// No registered descriptor claims the key.
    #[error("no descriptor registered for the key")]
    Unimplemented,
}

impl ValueError {
    /// Whether the next resync (or a retry transaction) may fix the value
    /// without a configuration change.
    pub fn is_retriable(&self) -> bool {
        match self {
            ValueError::Operation { retriable, .. } => *retriable,
            ValueError::DependencyBlocked { .. }
            | ValueError::Retrieval { .. }
            | ValueError::Cancelled => true,
            ValueError::Validation { .. } | ValueError::Cycle { .. } | ValueError::Unimplemented => {
                false
            }
        }
    }

    pub(crate) fn from_validation(err: DescriptorError) -> Self {
        ValueError::Validation {
            message: err.message,
            invalid_fields: err.invalid_fields,
        }
    }

    pub(crate) fn from_operation(err: &DescriptorError, retriable: bool) -> Self {
        ValueError::Operation {
            message: err.message.clone(),
            retriable,
        }
    }
}

/// A failed key as reported to the caller of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWithError {
    pub key: String,
    pub operation: TxnOperation,
    pub error: ValueError,
}

/// Aggregate error of a committed transaction in which at least one key failed.
///
/// The transaction itself always completes; the record is attached so the
/// caller can inspect every per-key outcome.
#[derive(Debug, Clone, Error)]
#[error("transaction {seq_num} failed for {} key(s): {}", errors.len(), summarize(errors))]
pub struct TransactionError {
    pub seq_num: u64,
    pub errors: Vec<KeyWithError>,
    pub record: Arc<RecordedTxn>,
}

fn summarize(errors: &[KeyWithError]) -> String {
    errors
        .iter()
        .map(|e| format!("{} ({}): {}", e.key, e.operation, e.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced by the scheduler API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("descriptor already registered: {name}")]
    DuplicateDescriptor { name: String },

    #[error("key selector of descriptor {new} collides with descriptor {existing} (prefix {prefix:?})")]
    KeySelectorCollision {
        new: String,
        existing: String,
        prefix: String,
    },

    #[error("descriptor not found: {name}")]
    DescriptorNotFound { name: String },

    #[error("no descriptor registered for key {key}")]
    UnimplementedKey { key: String },

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("transaction {seq_num} was cancelled")]
    Cancelled { seq_num: u64, record: Arc<RecordedTxn> },

    #[error("scheduler is shut down")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("history store error: {0}")]
    History(String),

    #[error("retrieve failed for descriptor {descriptor}: {source}")]
    Retrieve {
        descriptor: String,
        #[source]
        source: DescriptorError,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// The committed record, if the error came out of a finished transaction.
    pub fn record(&self) -> Option<&Arc<RecordedTxn>> {
        match self {
            SchedulerError::Transaction(e) => Some(&e.record),
            SchedulerError::Cancelled { record, .. } => Some(record),
            _ => None,
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_error_defaults_to_retriable() {
        assert!(DescriptorError::new("busy").retriable);
        assert!(!DescriptorError::non_retriable("bad mtu").retriable);
    }

    #[test]
    fn invalid_value_keeps_fields() {
        let err = DescriptorError::invalid_value("mtu out of range", vec!["mtu".into()]);
        let value_err = ValueError::from_validation(err);
        assert!(!value_err.is_retriable());
        assert!(matches!(
            value_err,
            ValueError::Validation { ref invalid_fields, .. } if invalid_fields == &vec!["mtu".to_string()]
        ));
    }

    #[test]
    fn cycle_error_displays_keys() {
        let err = ValueError::Cycle {
            keys: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
    }

    #[test]
    fn value_error_serializes_with_kind_tag() {
        let err = ValueError::DependencyBlocked {
            blocked_by: vec!["iface/if1".into()],
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "dependency_blocked");
        let back: ValueError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
