//! Value lifecycle states and the rules that derive them.
//!
//! A node's state is never set ad hoc: after every change the engine feeds
//! the node's facts into [`evaluate`], so the state is always a function of
//! desired/current equality, dependency satisfaction and the outcome of the
//! last operation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::DependencyTarget;
use crate::error::ValueError;
use crate::graph::{Graph, Node};
use crate::value::ValueOrigin;

/// Lifecycle state of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueState {
    /// Deleted or never seen.
    #[default]
    Nonexistent,
    /// NB value that no registered descriptor claims.
    Unimplemented,
    /// Reported on the operation that removed the value; the node then leaves the graph.
    Removed,
    /// NB value successfully applied.
    Configured,
    /// SB value not managed by NB, accepted as-is.
    Obtained,
    /// Value once applied by NB, found by retrieval, with no NB desire left.
    Discovered,
    /// NB value waiting for at least one dependency.
    Pending,
    /// NB value rejected by validation.
    Invalid,
    /// Last operation failed and will not be retried automatically.
    Failed,
    /// Last operation failed with a retriable error; a retry is scheduled.
    Retrying,
}

impl ValueState {
    /// Whether dependents of a value in this state may be created.
    pub fn is_satisfying(&self) -> bool {
        matches!(
            self,
            ValueState::Configured | ValueState::Obtained | ValueState::Discovered
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ValueState::Failed | ValueState::Retrying | ValueState::Invalid
        )
    }
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueState::Nonexistent => "NONEXISTENT",
            ValueState::Unimplemented => "UNIMPLEMENTED",
            ValueState::Removed => "REMOVED",
            ValueState::Configured => "CONFIGURED",
            ValueState::Obtained => "OBTAINED",
            ValueState::Discovered => "DISCOVERED",
            ValueState::Pending => "PENDING",
            ValueState::Invalid => "INVALID",
            ValueState::Failed => "FAILED",
            ValueState::Retrying => "RETRYING",
        };
        f.write_str(s)
    }
}

/// Operation executed (or attempted) for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnOperation {
    #[default]
    Undefined,
    Validate,
    Create,
    Update,
    Delete,
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnOperation::Undefined => "UNDEFINED",
            TxnOperation::Validate => "VALIDATE",
            TxnOperation::Create => "CREATE",
            TxnOperation::Update => "UPDATE",
            TxnOperation::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Facts about a node from which its state is derived.
#[derive(Debug, Clone, Copy)]
pub struct StateInputs<'a> {
    pub origin: ValueOrigin,
    pub has_descriptor: bool,
    pub is_derived: bool,
    pub desired: bool,
    pub available: bool,
    /// Applied value is equivalent to the desired one.
    pub in_sync: bool,
    pub deps_satisfied: bool,
    pub last_error: Option<&'a ValueError>,
    pub retry_scheduled: bool,
}

/// Derive a node's lifecycle state from its facts.
pub fn evaluate(inputs: StateInputs<'_>) -> ValueState {
    if !inputs.desired {
        if !inputs.available {
            return ValueState::Removed;
        }
        if inputs.origin == ValueOrigin::FromSb {
            return ValueState::Obtained;
        }
        return match inputs.last_error {
            Some(err) if !matches!(err, ValueError::DependencyBlocked { .. }) => {
                failure_state(err, inputs.retry_scheduled)
            }
            _ => ValueState::Discovered,
        };
    }

    if inputs.origin != ValueOrigin::FromSb && !inputs.is_derived && !inputs.has_descriptor {
        return ValueState::Unimplemented;
    }

    match inputs.last_error {
        Some(ValueError::DependencyBlocked { .. }) => return ValueState::Pending,
        Some(err) => return failure_state(err, inputs.retry_scheduled),
        None => {}
    }

    if inputs.available && inputs.in_sync {
        if inputs.origin == ValueOrigin::FromSb {
            ValueState::Obtained
        } else {
            ValueState::Configured
        }
    } else {
        ValueState::Pending
    }
}

fn failure_state(err: &ValueError, retry_scheduled: bool) -> ValueState {
    match err {
        ValueError::Validation { .. } => ValueState::Invalid,
        ValueError::Unimplemented => ValueState::Unimplemented,
        ValueError::Cancelled => ValueState::Pending,
        _ if retry_scheduled => ValueState::Retrying,
        _ => ValueState::Failed,
    }
}

/// Whether the node behind `key` currently satisfies a dependency on it.
pub fn is_key_satisfied(graph: &Graph, key: &str) -> bool {
    graph
        .node(key)
        .map(|n| n.is_available() && n.state.is_satisfying())
        .unwrap_or(false)
}

/// Dependencies of `node`'s desired value that are not satisfied in `graph`.
///
/// Derived values implicitly depend on their parent. Returned entries are
/// keys (or prefixes for `AnyOf` dependencies with no match).
pub fn unsatisfied_dependencies(graph: &Graph, node: &Node) -> Vec<String> {
    let mut missing = BTreeSet::new();
    if let Some(parent) = &node.parent {
        if !graph.node(parent).map(Node::is_available).unwrap_or(false) {
            missing.insert(parent.clone());
        }
    }
    for dep in &node.targets {
        match &dep.target {
            DependencyTarget::Key(key) => {
                if !is_key_satisfied(graph, key) {
                    missing.insert(key.clone());
                }
            }
            DependencyTarget::AnyOf { key_prefixes } => {
                let any = key_prefixes.iter().any(|prefix| {
                    graph
                        .keys_with_prefix(prefix)
                        .any(|k| k != node.key && is_key_satisfied(graph, k))
                });
                if !any {
                    missing.extend(key_prefixes.iter().map(|p| format!("{p}*")));
                }
            }
        }
    }
    missing.into_iter().collect()
}

/// Recompute and store the state of the node behind `key`.
///
/// Returns the new state, or `None` when the node does not exist.
pub fn refresh_node_state(graph: &mut Graph, key: &str, in_sync: bool) -> Option<ValueState> {
    let deps_satisfied = {
        let node = graph.node(key)?;
        unsatisfied_dependencies(graph, node).is_empty()
    };
    let node = graph.node_mut(key)?;
    let state = evaluate(StateInputs {
        origin: node.origin,
        has_descriptor: node.descriptor.is_some(),
        is_derived: node.parent.is_some(),
        desired: node.desired.is_some(),
        available: node.is_available(),
        in_sync,
        deps_satisfied,
        last_error: node.last_error.as_ref(),
        retry_scheduled: node.retry.as_ref().map(|r| r.scheduled).unwrap_or(false),
    });
    node.state = state;
    Some(state)
}
