//! Immutable transaction records kept in history.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KeyWithError, ValueError};
use crate::state::{TxnOperation, ValueState};
use crate::txn::TxnKind;
use crate::value::{AnyValue, ValueOrigin};

/// A key-value pair as requested by the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedKv {
    pub key: String,
    /// `None` for delete requests.
    pub value: Option<serde_json::Value>,
    pub fingerprint: Option<String>,
    pub origin: ValueOrigin,
}

impl RecordedKv {
    pub fn new(key: impl Into<String>, value: Option<&AnyValue>, origin: ValueOrigin) -> Self {
        Self {
            key: key.into(),
            value: value.map(AnyValue::to_json),
            fingerprint: value.map(AnyValue::fingerprint),
            origin,
        }
    }
}

/// One operation executed (or skipped) by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedOp {
    pub key: String,
    pub operation: TxnOperation,
    pub prev_state: ValueState,
    pub new_state: ValueState,
    pub prev_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ValueError>,
    /// No descriptor call was made (blocked, cancelled, rejected, or a
    /// derived property).
    pub noop: bool,
    pub is_derived: bool,
    pub is_retry: bool,
    /// Delete or Create half of an update applied by re-creation.
    pub is_recreate: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

impl RecordedOp {
    pub(crate) fn new(key: &str, operation: TxnOperation, prev_state: ValueState) -> Self {
        Self {
            key: key.to_string(),
            operation,
            prev_state,
            new_state: prev_state,
            prev_value: None,
            new_value: None,
            error: None,
            noop: false,
            is_derived: false,
            is_retry: false,
            is_recreate: false,
            blocked_by: Vec::new(),
        }
    }
}

/// A descriptor whose Retrieve failed during resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveFailure {
    pub descriptor: String,
    pub message: String,
}

/// Committed transaction. Never mutated once appended to history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedTxn {
    pub seq_num: u64,
    pub id: Uuid,
    pub kind: TxnKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub values: Vec<RecordedKv>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrieve_failures: Vec<RetrieveFailure>,
    /// Operations in execution order.
    pub executed: Vec<RecordedOp>,
    #[serde(default)]
    pub cancelled: bool,
}

impl RecordedTxn {
    /// Operations for which a descriptor (or property) was actually applied.
    pub fn performed(&self) -> impl Iterator<Item = &RecordedOp> {
        self.executed.iter().filter(|op| !op.noop)
    }

    /// Position of the first performed `operation` on `key`.
    pub fn position_of(&self, key: &str, operation: TxnOperation) -> Option<usize> {
        self.executed
            .iter()
            .position(|op| !op.noop && op.key == key && op.operation == operation)
    }

    /// Keys that failed in this transaction. Dependency-blocked keys are
    /// pending, not failed, and are left out.
    pub fn errors(&self) -> Vec<KeyWithError> {
        let mut errors: Vec<KeyWithError> = self
            .executed
            .iter()
            .filter_map(|op| match &op.error {
                Some(ValueError::DependencyBlocked { .. }) | None => None,
                Some(err) => Some(KeyWithError {
                    key: op.key.clone(),
                    operation: op.operation,
                    error: err.clone(),
                }),
            })
            .collect();
        errors.extend(self.retrieve_failures.iter().map(|f| KeyWithError {
            key: f.descriptor.clone(),
            operation: TxnOperation::Undefined,
            error: ValueError::Retrieval {
                descriptor: f.descriptor.clone(),
                message: f.message.clone(),
            },
        }));
        errors
    }

    pub fn duration_ms(&self) -> i64 {
        (self.stop - self.start).num_milliseconds()
    }
}

impl fmt::Display for RecordedTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "o{}o", "-".repeat(70))?;
        write!(
            f,
            "  #{} {} {} (took {} ms)",
            self.seq_num,
            self.kind,
            self.start.format("%H:%M:%S%.3f"),
            self.duration_ms()
        )?;
        if let Some(desc) = &self.description {
            write!(f, " \"{desc}\"")?;
        }
        if self.cancelled {
            write!(f, " [CANCELLED]")?;
        }
        writeln!(f)?;

        if !self.values.is_empty() {
            writeln!(f, "  * values:")?;
            for kv in &self.values {
                match &kv.value {
                    Some(v) => writeln!(f, "      - {} [{}] {}", kv.key, kv.origin, v)?,
                    None => writeln!(f, "      - {} [{}] <delete>", kv.key, kv.origin)?,
                }
            }
        }
        for failure in &self.retrieve_failures {
            writeln!(
                f,
                "  * retrieve failed: {}: {}",
                failure.descriptor, failure.message
            )?;
        }

        if self.executed.is_empty() {
            writeln!(f, "  * executed: <none>")?;
        } else {
            writeln!(f, "  * executed:")?;
            for (i, op) in self.executed.iter().enumerate() {
                write!(
                    f,
                    "      {}. {} {} {} -> {}",
                    i + 1,
                    op.operation,
                    op.key,
                    op.prev_state,
                    op.new_state
                )?;
                let mut flags = Vec::new();
                if op.noop {
                    flags.push("noop");
                }
                if op.is_derived {
                    flags.push("derived");
                }
                if op.is_retry {
                    flags.push("retry");
                }
                if op.is_recreate {
                    flags.push("recreate");
                }
                if !flags.is_empty() {
                    write!(f, " ({})", flags.join(", "))?;
                }
                if let Some(err) = &op.error {
                    write!(f, " error: {err}")?;
                }
                writeln!(f)?;
            }
        }
        write!(f, "x{}x", "-".repeat(70))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RecordedTxn {
        let now = Utc::now();
        let mut ok = RecordedOp::new("iface/if1", TxnOperation::Create, ValueState::Pending);
        ok.new_state = ValueState::Configured;
        let mut failed = RecordedOp::new("bd/bd1", TxnOperation::Create, ValueState::Pending);
        failed.new_state = ValueState::Failed;
        failed.error = Some(ValueError::Operation {
            message: "no such bridge".into(),
            retriable: false,
        });
        let mut blocked = RecordedOp::new("route/r1", TxnOperation::Create, ValueState::Pending);
        blocked.noop = true;
        blocked.error = Some(ValueError::DependencyBlocked {
            blocked_by: vec!["bd/bd1".into()],
        });
        RecordedTxn {
            seq_num: 4,
            id: Uuid::new_v4(),
            kind: TxnKind::Change,
            description: Some("demo".into()),
            start: now,
            stop: now,
            values: vec![RecordedKv::new(
                "iface/if1",
                Some(&AnyValue::new(serde_json::json!({"mtu": 1500}))),
                ValueOrigin::FromNb,
            )],
            retrieve_failures: Vec::new(),
            executed: vec![ok, failed, blocked],
            cancelled: false,
        }
    }

    #[test]
    fn errors_skip_blocked_keys() {
        let errors = record().errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].key, "bd/bd1");
    }

    #[test]
    fn position_ignores_noops() {
        let r = record();
        assert_eq!(r.position_of("iface/if1", TxnOperation::Create), Some(0));
        assert_eq!(r.position_of("route/r1", TxnOperation::Create), None);
        assert_eq!(r.performed().count(), 2);
    }

    #[test]
    fn display_lists_operations() {
        let text = record().to_string();
        assert!(text.contains("#4 CHANGE"));
        assert!(text.contains("1. CREATE iface/if1 PENDING -> CONFIGURED"));
        assert!(text.contains("no such bridge"));
        assert!(text.contains("(noop)"));
    }

    #[test]
    fn record_survives_json_round_trip() {
        let r = record();
        let json = serde_json::to_string(&r).unwrap();
        let back: RecordedTxn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
