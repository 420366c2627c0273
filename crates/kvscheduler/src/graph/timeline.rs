//! Revisions of graph nodes over time.
//!
//! Every commit that changes a node closes the node's open revision and opens
//! a new one; removing a node only closes it. Revisions are what the graph
//! looked like between two transactions, so they can answer both "how did
//! this key evolve" and "what did the graph look like at time T".

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Graph, Node};
use crate::descriptor::Dependency;
use crate::state::{TxnOperation, ValueState};
use crate::value::{AnyValue, ValueOrigin};

/// One revision of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedNode {
    pub key: String,
    pub descriptor: Option<String>,
    /// Applied value; `None` while unavailable.
    pub value: Option<serde_json::Value>,
    pub desired: Option<serde_json::Value>,
    pub state: ValueState,
    pub origin: ValueOrigin,
    pub last_op: TxnOperation,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<Dependency>,
    /// Transaction that opened the revision.
    pub since_seq: u64,
    pub since: DateTime<Utc>,
    /// Transaction that closed it; `None` for the current revision.
    pub until_seq: Option<u64>,
    pub until: Option<DateTime<Utc>>,
}

impl RecordedNode {
    fn of(node: &Node, seq_num: u64, at: DateTime<Utc>) -> Self {
        Self {
            key: node.key.clone(),
            descriptor: node.descriptor.clone(),
            value: node.value.as_ref().map(AnyValue::to_json),
            desired: node.desired.as_ref().map(AnyValue::to_json),
            state: node.state,
            origin: node.origin,
            last_op: node.last_op,
            error: node.last_error.as_ref().map(ToString::to_string),
            blocked_by: node.blocked_by.clone(),
            parent: node.parent.clone(),
            targets: node.targets.clone(),
            since_seq: seq_num,
            since: at,
            until_seq: None,
            until: None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.until.is_none()
    }

    pub fn is_derived(&self) -> bool {
        self.parent.is_some()
    }

    /// Whether the revision was the live one at `time`.
    pub fn covers(&self, time: DateTime<Utc>) -> bool {
        self.since <= time && self.until.map_or(true, |until| time < until)
    }

    fn same_content(&self, other: &RecordedNode) -> bool {
        self.descriptor == other.descriptor
            && self.value == other.value
            && self.desired == other.desired
            && self.state == other.state
            && self.origin == other.origin
            && self.last_op == other.last_op
            && self.error == other.error
            && self.blocked_by == other.blocked_by
            && self.parent == other.parent
            && self.targets == other.targets
    }
}

/// Revisions of every key seen since startup, oldest first per key.
#[derive(Debug, Default)]
pub struct Timeline {
    nodes: BTreeMap<String, Vec<RecordedNode>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the state of `keys` after transaction `seq_num` committed at
    /// `at`. Returns how many revisions were opened or closed.
    pub fn record(
        &mut self,
        graph: &Graph,
        keys: &BTreeSet<String>,
        seq_num: u64,
        at: DateTime<Utc>,
    ) -> usize {
        let mut recorded = 0;
        for key in keys {
            let revisions = self.nodes.entry(key.clone()).or_default();
            let open = revisions.last_mut().filter(|r| r.is_current());
            match (open, graph.node(key)) {
                (Some(open), Some(node)) => {
                    let next = RecordedNode::of(node, seq_num, at);
                    if open.same_content(&next) {
                        continue;
                    }
                    open.until_seq = Some(seq_num);
                    open.until = Some(at);
                    revisions.push(next);
                    recorded += 1;
                }
                (None, Some(node)) => {
                    revisions.push(RecordedNode::of(node, seq_num, at));
                    recorded += 1;
                }
                (Some(open), None) => {
                    open.until_seq = Some(seq_num);
                    open.until = Some(at);
                    recorded += 1;
                }
                (None, None) => {}
            }
            if revisions.is_empty() {
                self.nodes.remove(key);
            }
        }
        recorded
    }

    /// Every revision of `key`, oldest first.
    pub fn node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        self.nodes.get(key).cloned().unwrap_or_default()
    }

    /// The revision of every key that was live at `time`, ordered by key.
    pub fn snapshot_at(&self, time: DateTime<Utc>) -> Vec<RecordedNode> {
        self.nodes
            .values()
            .filter_map(|revisions| revisions.iter().rev().find(|r| r.covers(time)))
            .cloned()
            .collect()
    }

    /// Drop closed revisions that ended before `cutoff`, keeping those opened
    /// before `permanent_until`. Returns how many were dropped.
    pub fn trim(&mut self, cutoff: DateTime<Utc>, permanent_until: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        self.nodes.retain(|_, revisions| {
            let before = revisions.len();
            revisions.retain(|r| {
                let expired = r.until.map_or(false, |until| until < cutoff);
                !expired || r.since < permanent_until
            });
            dropped += before - revisions.len();
            !revisions.is_empty()
        });
        dropped
    }

    pub fn len(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
