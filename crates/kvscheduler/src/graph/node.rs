//! Graph node: the scheduler's aggregate for one key.

use std::collections::BTreeSet;

use crate::descriptor::Dependency;
use crate::error::ValueError;
use crate::state::{TxnOperation, ValueState};
use crate::txn::retry::RetryState;
use crate::value::{AnyMetadata, AnyValue, ValueOrigin};

#[derive(Debug, Clone, Default)]
pub struct Node {
    pub key: String,
    /// Name of the owning descriptor; `None` for unimplemented keys and
    /// derived properties.
    pub descriptor: Option<String>,
    pub origin: ValueOrigin,
    /// Value currently applied in (or retrieved from) the southbound plane.
    pub value: Option<AnyValue>,
    pub metadata: Option<AnyMetadata>,
    /// Value requested by NB.
    pub desired: Option<AnyValue>,
    pub state: ValueState,
    /// Key of the value this one was derived from.
    pub parent: Option<String>,
    pub derived: BTreeSet<String>,
    /// Dependencies of the desired value (or of the applied one when nothing
    /// is desired).
    pub(crate) targets: Vec<Dependency>,
    /// Dependencies of the applied value.
    pub(crate) applied_targets: Vec<Dependency>,
    pub last_op: TxnOperation,
    pub last_error: Option<ValueError>,
    /// Root keys whose failure or absence keeps this value pending.
    pub blocked_by: Vec<String>,
    pub retry: Option<RetryState>,
    /// Bumped on every change of the applied value.
    pub revision: u64,
    /// Sequence number of the last transaction that changed the node.
    pub last_update: u64,
}

impl Node {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn is_available(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_derived(&self) -> bool {
        self.parent.is_some()
    }

    /// Derived value without a descriptor: applied implicitly with its parent.
    pub fn is_property(&self) -> bool {
        self.parent.is_some() && self.descriptor.is_none()
    }

    pub fn targets(&self) -> &[Dependency] {
        &self.targets
    }

    pub fn applied_targets(&self) -> &[Dependency] {
        &self.applied_targets
    }

    /// A node with nothing desired, nothing applied and no children can leave
    /// the graph.
    pub fn is_obsolete(&self) -> bool {
        self.desired.is_none() && self.value.is_none() && self.derived.is_empty()
    }
}
