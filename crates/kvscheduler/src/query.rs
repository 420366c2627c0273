//! Read-only views answered from a published graph snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KeyWithError, ValueError};
use crate::graph::{Graph, Node};
use crate::registry::DescriptorRegistry;
use crate::state::{TxnOperation, ValueState};
use crate::txn::retry::RetryState;
use crate::value::{AnyMetadata, ValueOrigin};

/// Status of one value, as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueStatus {
    pub key: String,
    pub state: ValueState,
    pub origin: ValueOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    pub last_op: TxnOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ValueError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryState>,
    /// Transaction that last changed the value.
    pub last_update: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived: Vec<ValueStatus>,
}

impl ValueStatus {
    pub(crate) fn of(graph: &Graph, node: &Node) -> Self {
        Self {
            key: node.key.clone(),
            state: node.state,
            origin: node.origin,
            descriptor: node.descriptor.clone(),
            last_op: node.last_op,
            error: node.last_error.clone(),
            blocked_by: node.blocked_by.clone(),
            retry: node.retry.clone(),
            last_update: node.last_update,
            derived: node
                .derived
                .iter()
                .filter_map(|k| graph.node(k))
                .map(|child| ValueStatus::of(graph, child))
                .collect(),
        }
    }

    /// Status reported for a key that left the graph.
    pub(crate) fn removed(key: &str, last_op: TxnOperation, last_update: u64) -> Self {
        Self {
            key: key.to_string(),
            state: ValueState::Removed,
            origin: ValueOrigin::Unknown,
            descriptor: None,
            last_op,
            error: None,
            blocked_by: Vec::new(),
            retry: None,
            last_update,
            derived: Vec::new(),
        }
    }

    /// Same state, error and retry bookkeeping, ignoring derived children.
    pub(crate) fn same_outcome(&self, other: &ValueStatus) -> bool {
        self.state == other.state
            && self.error == other.error
            && self.blocked_by == other.blocked_by
            && self.retry == other.retry
            && self.origin == other.origin
    }
}

impl fmt::Display for ValueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.key, self.state, self.origin)?;
        if self.last_op != TxnOperation::Undefined {
            write!(f, " last-op={}", self.last_op)?;
        }
        if let Some(err) = &self.error {
            write!(f, " error=\"{err}\"")?;
        }
        if let Some(retry) = &self.retry {
            write!(f, " attempt={}", retry.attempt)?;
        }
        Ok(())
    }
}

/// Where a dump reads values from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpView {
    /// The scheduler's own records.
    #[default]
    Cached,
    /// Fresh Retrieve from the southbound plane.
    Live,
    /// Values requested by NB, applied or not.
    Desired,
}

impl FromStr for DumpView {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cached" => Ok(DumpView::Cached),
            "live" => Ok(DumpView::Live),
            "desired" => Ok(DumpView::Desired),
            other => Err(format!("unknown dump view: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpedKv {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub origin: ValueOrigin,
}

/// Statuses of every key under `prefix`.
pub(crate) fn statuses(graph: &Graph, prefix: &str) -> Vec<ValueStatus> {
    graph
        .keys_with_prefix(prefix)
        .filter_map(|k| graph.node(k))
        .map(|n| ValueStatus::of(graph, n))
        .collect()
}

/// Applied values under `prefix`.
pub(crate) fn dump_cached(graph: &Graph, prefix: &str) -> Vec<DumpedKv> {
    graph
        .keys_with_prefix(prefix)
        .filter_map(|k| graph.node(k))
        .filter_map(|n| {
            n.value.as_ref().map(|v| DumpedKv {
                key: n.key.clone(),
                value: v.to_json(),
                metadata: n.metadata.as_ref().map(AnyMetadata::to_json),
                origin: n.origin,
            })
        })
        .collect()
}

/// Values NB asked for under `prefix`. Derived values are left out; they
/// follow from their parents.
pub(crate) fn dump_desired(graph: &Graph, prefix: &str) -> Vec<DumpedKv> {
    graph
        .keys_with_prefix(prefix)
        .filter_map(|k| graph.node(k))
        .filter(|n| !n.is_derived())
        .filter_map(|n| {
            n.desired.as_ref().map(|v| DumpedKv {
                key: n.key.clone(),
                value: v.to_json(),
                metadata: None,
                origin: ValueOrigin::FromNb,
            })
        })
        .collect()
}

/// Keys under `prefix` waiting for a dependency, with what blocks them.
pub(crate) fn pending(graph: &Graph, prefix: &str) -> Vec<ValueStatus> {
    statuses(graph, prefix)
        .into_iter()
        .filter(|s| s.state == ValueState::Pending)
        .collect()
}

/// Keys under `prefix` whose last operation failed or whose value was
/// rejected.
pub(crate) fn failed(graph: &Graph, prefix: &str) -> Vec<KeyWithError> {
    graph
        .keys_with_prefix(prefix)
        .filter_map(|k| graph.node(k))
        .filter(|n| n.state.is_failure() || n.state == ValueState::Unimplemented)
        .filter_map(|n| {
            n.last_error.clone().map(|error| KeyWithError {
                key: n.key.clone(),
                operation: n.last_op,
                error,
            })
        })
        .collect()
}

/// Read-only metadata of one descriptor, indexed by key label.
#[derive(Debug, Clone, Default)]
pub struct MetadataMap {
    descriptor: String,
    entries: BTreeMap<String, (String, AnyMetadata)>,
}

impl MetadataMap {
    pub(crate) fn build(graph: &Graph, registry: &DescriptorRegistry, descriptor: &str) -> Option<Self> {
        let desc = registry.get(descriptor)?;
        let entries = graph
            .nodes()
            .filter(|n| n.descriptor.as_deref() == Some(descriptor) && n.is_available())
            .filter_map(|n| {
                let metadata = n.metadata.clone()?;
                Some((desc.key_label(&n.key), (n.key.clone(), metadata)))
            })
            .collect();
        Some(Self {
            descriptor: descriptor.to_string(),
            entries,
        })
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Typed metadata for `label`; `None` if absent or of another type.
    pub fn get<M: 'static>(&self, label: &str) -> Option<&M> {
        self.entries.get(label).and_then(|(_, m)| m.downcast_ref::<M>())
    }

    /// Full key of the value behind `label`.
    pub fn key_of(&self, label: &str) -> Option<&str> {
        self.entries.get(label).map(|(k, _)| k.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MockDescriptor;
    use crate::value::AnyValue;

    fn graph() -> Graph {
        let mut graph = Graph::new();
        let n = graph.get_or_insert("iface/if1");
        n.descriptor = Some("iface".into());
        n.value = Some(AnyValue::new(serde_json::json!({"mtu": 1500})));
        n.metadata = Some(AnyMetadata::new(7u64));
        n.state = ValueState::Configured;
        n.origin = ValueOrigin::FromNb;
        let n = graph.get_or_insert("iface/if2");
        n.descriptor = Some("iface".into());
        n.state = ValueState::Failed;
        n.last_op = TxnOperation::Create;
        n.last_error = Some(ValueError::Operation {
            message: "busy".into(),
            retriable: false,
        });
        let n = graph.get_or_insert("bd/bd1");
        n.state = ValueState::Pending;
        n.blocked_by = vec!["iface/if2".into()];
        graph
    }

    #[test]
    fn dump_and_status_by_prefix() {
        let g = graph();
        let dumped = dump_cached(&g, "iface/");
        assert_eq!(dumped.len(), 1);
        assert_eq!(dumped[0].metadata, Some(serde_json::json!(7)));
        assert_eq!(statuses(&g, "iface/").len(), 2);
        assert_eq!(statuses(&g, "").len(), 3);
    }

    #[test]
    fn failed_and_pending_filters() {
        let g = graph();
        let failed = failed(&g, "");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key, "iface/if2");
        assert_eq!(failed[0].operation, TxnOperation::Create);
        let pending = pending(&g, "");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].blocked_by, vec!["iface/if2".to_string()]);
    }

    #[test]
    fn metadata_map_is_typed_and_labelled() {
        let mut registry = DescriptorRegistry::new();
        registry.register(MockDescriptor::new("iface", "iface/")).unwrap();
        let map = MetadataMap::build(&graph(), &registry, "iface").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get::<u64>("if1"), Some(&7));
        assert_eq!(map.get::<String>("if1"), None);
        assert_eq!(map.key_of("if1"), Some("iface/if1"));
        assert!(MetadataMap::build(&graph(), &registry, "acl").is_none());
    }

    #[test]
    fn dump_view_parses() {
        assert_eq!("live".parse::<DumpView>().unwrap(), DumpView::Live);
        assert_eq!("desired".parse::<DumpView>().unwrap(), DumpView::Desired);
        assert!("stale".parse::<DumpView>().is_err());
    }
}
