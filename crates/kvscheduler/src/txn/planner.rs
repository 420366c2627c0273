//! Staging of requested changes and planning of operations.
//!
//! Staging writes new desired (or SB) values into the graph, validates them,
//! recomputes dependencies and derived values. Planning then restricts the
//! graph to the touched keys plus everything depending on them, projects
//! which of those values will be available once the transaction completes,
//! and turns the difference with the current state into two level-ordered
//! phases: teardown (dependents first) and build (dependencies first).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::{debug, warn};

use crate::descriptor::{Dependency, DependencyTarget};
use crate::error::ValueError;
use crate::graph::{plan_levels, Graph, Node};
use crate::registry::DescriptorRegistry;
use crate::state::{is_key_satisfied, refresh_node_state, TxnOperation, ValueState};
use crate::txn::record::{RecordedKv, RecordedOp};
use crate::value::{AnyMetadata, AnyValue, KeyValuePair, ValueOrigin};

/// Outcome of staging.
#[derive(Debug, Default)]
pub(crate) struct Staged {
    /// Keys whose desired or SB value changed, or that must be re-evaluated.
    pub touched: BTreeSet<String>,
    /// Keys explicitly (re)requested; failed values among them are attempted
    /// again even when the failure was not retriable.
    pub explicit: BTreeSet<String>,
    /// Keys whose applied value must be removed.
    pub to_remove: BTreeSet<String>,
    /// Values as requested, for the record.
    pub values: Vec<RecordedKv>,
    /// Values rejected before planning.
    pub rejected: Vec<RecordedOp>,
}

pub(crate) struct Staging<'a> {
    graph: &'a mut Graph,
    registry: &'a DescriptorRegistry,
    seq_num: u64,
    always_explicit: bool,
    staged: Staged,
    worklist: VecDeque<String>,
}

impl<'a> Staging<'a> {
    /// `always_explicit`: treat every put as an explicit request, even when
    /// the value did not change.
    pub fn new(
        graph: &'a mut Graph,
        registry: &'a DescriptorRegistry,
        seq_num: u64,
        always_explicit: bool,
    ) -> Self {
        Self {
            graph,
            registry,
            seq_num,
            always_explicit,
            staged: Staged::default(),
            worklist: VecDeque::new(),
        }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Stage an NB put (`Some`) or delete (`None`).
    pub fn set_desired(&mut self, key: &str, value: Option<AnyValue>) {
        self.staged
            .values
            .push(RecordedKv::new(key, value.as_ref(), ValueOrigin::FromNb));

        if value.is_none() && !self.graph.contains(key) {
            return;
        }
        let seq_num = self.seq_num;
        let node = self.graph.get_or_insert(key);
        if let Some(parent) = node.parent.clone() {
            let mut op = RecordedOp::new(key, TxnOperation::Validate, node.state);
            op.noop = true;
            op.is_derived = true;
            op.error = Some(ValueError::Validation {
                message: format!("value is derived from {parent} and cannot be changed directly"),
                invalid_fields: Vec::new(),
            });
            self.staged.rejected.push(op);
            return;
        }

        let changed = match (&node.desired, &value) {
            (Some(old), Some(new)) => !old.json_eq(new),
            (None, None) => false,
            _ => true,
        };
        if value.is_some() && !node.is_available() {
            node.origin = ValueOrigin::FromNb;
        }
        node.desired = value;
        node.last_update = seq_num;
        if node.desired.is_none() && node.origin != ValueOrigin::FromSb {
            self.staged.to_remove.insert(key.to_string());
        }
        if changed || self.always_explicit {
            self.staged.explicit.insert(key.to_string());
        }
        self.touch(key);
    }

    /// Re-evaluate `key` without changing what is desired.
    pub fn touch(&mut self, key: &str) {
        if self.staged.touched.insert(key.to_string()) {
            self.worklist.push_back(key.to_string());
        }
    }

    pub fn mark_explicit(&mut self, key: &str) {
        self.staged.explicit.insert(key.to_string());
    }

    /// Schedule removal of the applied value of `key`.
    pub fn mark_removal(&mut self, key: &str) {
        self.staged.to_remove.insert(key.to_string());
        self.touch(key);
    }

    /// Stage a value change reported by the southbound plane.
    pub fn set_sb_value(
        &mut self,
        key: &str,
        value: Option<AnyValue>,
        metadata: Option<AnyMetadata>,
    ) {
        self.staged
            .values
            .push(RecordedKv::new(key, value.as_ref(), ValueOrigin::FromSb));
        let seq_num = self.seq_num;
        let node = self.graph.get_or_insert(key);
        if value.is_some() {
            node.origin = ValueOrigin::FromSb;
        }
        node.value = value;
        node.metadata = metadata;
        node.revision += 1;
        node.last_update = seq_num;
        self.touch(key);
    }

    /// Replace the applied value of `key` with what Retrieve reported.
    /// `None` means the value is gone from the southbound plane.
    pub fn set_retrieved(
        &mut self,
        key: &str,
        value: Option<AnyValue>,
        metadata: Option<AnyMetadata>,
        origin: ValueOrigin,
    ) {
        let registry = self.registry;
        let node = self.graph.get_or_insert(key);
        let changed = match (&node.value, &value) {
            (Some(old), Some(new)) => match registry.descriptor_for_key(key) {
                Some(desc) => !desc.equivalent(key, old, new),
                None => !old.json_eq(new),
            },
            (None, None) => false,
            _ => true,
        };
        if changed {
            node.revision += 1;
        }
        if value.is_some() {
            node.origin = origin;
            node.metadata = metadata;
        } else {
            node.metadata = None;
        }
        node.value = value;
        let applied = match (&node.value, registry.descriptor_for_key(key)) {
            (Some(v), Some(desc)) => desc.dependencies(key, v),
            _ => Vec::new(),
        };
        self.graph.set_applied_targets(key, applied);
        self.touch(key);
    }

    /// Validate, derive and compute dependencies for everything touched.
    pub fn finish(mut self) -> Staged {
        let mut processed = BTreeSet::new();
        while let Some(key) = self.worklist.pop_front() {
            if processed.insert(key.clone()) {
                self.prepare(&key);
            }
        }
        self.staged
    }

    fn prepare(&mut self, key: &str) {
        let Some(node) = self.graph.node(key) else {
            return;
        };
        let is_derived = node.is_derived();
        let descriptor = self.registry.descriptor_for_key(key).cloned();
        let desc_name = descriptor.as_ref().map(|d| d.name().to_string());

        if let Some(desired) = node.desired.clone() {
            let Some(desc) = descriptor else {
                if let Some(node) = self.graph.node_mut(key) {
                    node.descriptor = None;
                }
                self.graph.set_targets(key, Vec::new());
                if !is_derived {
                    self.reject(key, TxnOperation::Validate, ValueError::Unimplemented);
                    self.update_derived(key, Vec::new());
                }
                return;
            };
            let checked = desc
                .normalize(key, &desired)
                .and_then(|v| desc.validate(key, &v).map(|_| v));
            match checked {
                Err(err) => {
                    if let Some(node) = self.graph.node_mut(key) {
                        node.descriptor = desc_name;
                    }
                    debug!(key = %key, error = %err, "value rejected by validation");
                    self.reject(key, TxnOperation::Validate, ValueError::from_validation(err));
                }
                Ok(value) => {
                    let deps = desc.dependencies(key, &value);
                    let derived = desc.derived_values(key, &value);
                    if let Some(node) = self.graph.node_mut(key) {
                        node.descriptor = desc_name;
                        node.desired = Some(value);
                        if matches!(
                            node.last_error,
                            Some(ValueError::Validation { .. }) | Some(ValueError::Unimplemented)
                        ) {
                            node.last_error = None;
                        }
                    }
                    self.graph.set_targets(key, deps);
                    self.update_derived(key, derived);
                }
            }
            return;
        }

        let sb_value = match node.origin {
            ValueOrigin::FromSb => node.value.clone(),
            _ => None,
        };
        if let Some(node) = self.graph.node_mut(key) {
            node.descriptor = desc_name;
            if matches!(
                node.last_error,
                Some(ValueError::Validation { .. }) | Some(ValueError::Unimplemented)
            ) {
                node.last_error = None;
            }
        }
        self.graph.set_targets(key, Vec::new());
        match (sb_value, descriptor) {
            (Some(value), Some(desc)) => {
                let derived = desc.derived_values(key, &value);
                self.update_sb_derived(key, derived);
            }
            (Some(_), None) => {}
            (None, _) => {
                let parent_is_sb = self
                    .graph
                    .node(key)
                    .map(|n| n.origin == ValueOrigin::FromSb)
                    .unwrap_or(false);
                if parent_is_sb {
                    self.update_sb_derived(key, Vec::new());
                } else {
                    self.update_derived(key, Vec::new());
                }
            }
        }
    }

    fn reject(&mut self, key: &str, operation: TxnOperation, error: ValueError) {
        let Some(node) = self.graph.node_mut(key) else {
            return;
        };
        let prev_state = node.state;
        node.state = match error {
            ValueError::Unimplemented => ValueState::Unimplemented,
            _ => ValueState::Invalid,
        };
        node.last_error = Some(error.clone());
        node.blocked_by.clear();
        let mut op = RecordedOp::new(key, operation, prev_state);
        op.new_state = node.state;
        op.new_value = node.desired.as_ref().map(AnyValue::to_json);
        op.noop = true;
        op.is_derived = node.is_derived();
        op.error = Some(error);
        self.staged.rejected.push(op);
    }

    /// Replace the NB-desired derived values of `parent`.
    fn update_derived(&mut self, parent: &str, derived: Vec<KeyValuePair>) {
        let old: BTreeSet<String> = self
            .graph
            .node(parent)
            .map(|n| n.derived.clone())
            .unwrap_or_default();
        let mut current = BTreeSet::new();
        for kv in derived {
            if kv.key == parent {
                continue;
            }
            let seq_num = self.seq_num;
            let child = self.graph.get_or_insert(&kv.key);
            match &child.parent {
                Some(p) if p != parent => {
                    warn!(key = %kv.key, parent = %parent, owner = %p, "derived key already owned by another value");
                    continue;
                }
                None if child.desired.is_some() => {
                    warn!(key = %kv.key, parent = %parent, "derived key collides with an NB value");
                    continue;
                }
                _ => {}
            }
            child.parent = Some(parent.to_string());
            let changed = child
                .desired
                .as_ref()
                .map(|d| !d.json_eq(&kv.value))
                .unwrap_or(true);
            child.desired = Some(kv.value);
            if !child.is_available() {
                child.origin = ValueOrigin::FromNb;
            }
            child.last_update = seq_num;
            if changed {
                self.staged.explicit.insert(kv.key.clone());
            }
            self.staged.to_remove.remove(&kv.key);
            current.insert(kv.key.clone());
            self.touch_derived(parent, &kv.key);
        }
        for gone in old.difference(&current) {
            if let Some(child) = self.graph.node_mut(gone) {
                child.desired = None;
                child.last_update = self.seq_num;
            }
            self.staged.to_remove.insert(gone.clone());
            self.touch(gone);
        }
    }

    /// Replace the derived values of an SB value; they are SB values too.
    fn update_sb_derived(&mut self, parent: &str, derived: Vec<KeyValuePair>) {
        let old: BTreeSet<String> = self
            .graph
            .node(parent)
            .map(|n| n.derived.clone())
            .unwrap_or_default();
        let mut current = BTreeSet::new();
        for kv in derived {
            if kv.key == parent {
                continue;
            }
            let child = self.graph.get_or_insert(&kv.key);
            if child.parent.as_deref().map(|p| p != parent).unwrap_or(false) {
                continue;
            }
            child.parent = Some(parent.to_string());
            child.origin = ValueOrigin::FromSb;
            child.value = Some(kv.value);
            child.last_update = self.seq_num;
            current.insert(kv.key.clone());
            self.touch_derived(parent, &kv.key);
        }
        for gone in old.difference(&current) {
            if let Some(child) = self.graph.node_mut(gone) {
                child.value = None;
                child.metadata = None;
            }
            self.touch(gone);
        }
    }

    fn touch_derived(&mut self, parent: &str, child: &str) {
        if let Some(p) = self.graph.node_mut(parent) {
            p.derived.insert(child.to_string());
        }
        self.touch(child);
    }
}

/// One operation scheduled for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedOp {
    pub key: String,
    pub operation: TxnOperation,
    /// Part of a Delete + Create pair replacing an update.
    pub recreate: bool,
}

/// Level-ordered operations of one transaction.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// Keys re-evaluated by the transaction.
    pub affected: BTreeSet<String>,
    /// Dependents are torn down before their dependencies.
    pub teardown: Vec<Vec<PlannedOp>>,
    /// Dependencies are built before their dependents.
    pub build: Vec<Vec<PlannedOp>>,
    /// Keys rejected because of a dependency cycle.
    pub rejected: Vec<RecordedOp>,
}

impl Plan {
    pub fn op_count(&self) -> usize {
        self.teardown.iter().chain(self.build.iter()).map(Vec::len).sum()
    }
}

/// Whether the applied value of `node` is equivalent to its desired one.
pub(crate) fn is_in_sync(registry: &DescriptorRegistry, node: &Node) -> bool {
    match (&node.desired, &node.value) {
        (Some(desired), Some(applied)) => match node
            .descriptor
            .as_deref()
            .and_then(|name| registry.get(name))
        {
            Some(desc) => desc.equivalent(&node.key, applied, desired),
            None => applied.json_eq(desired),
        },
        _ => false,
    }
}

/// Root causes of an unsatisfied dependency: blocked dependencies are
/// followed down to the keys that actually failed or are missing.
pub(crate) fn blocking_roots(graph: &Graph, unsatisfied: &[String]) -> Vec<String> {
    let mut roots = BTreeSet::new();
    for key in unsatisfied {
        match graph.node(key) {
            Some(dep) if !dep.blocked_by.is_empty() && dep.state == ValueState::Pending => {
                roots.extend(dep.blocked_by.iter().cloned());
            }
            _ => {
                roots.insert(key.clone());
            }
        }
    }
    roots.into_iter().collect()
}

/// Plan the operations for `staged`.
///
/// `retry_failed`: attempt values whose last failure was retriable even
/// when they were not explicitly requested (resync).
pub(crate) fn plan(
    graph: &mut Graph,
    registry: &DescriptorRegistry,
    staged: &Staged,
    retry_failed: bool,
) -> Plan {
    let affected = graph.dependents_closure(&staged.touched);

    let ordering = plan_levels(&affected, |k| graph.dependencies_of(k));
    let mut plan = Plan {
        affected: affected.clone(),
        ..Plan::default()
    };

    for cycle in &ordering.cycles {
        for key in cycle {
            let Some(node) = graph.node_mut(key) else {
                continue;
            };
            let error = ValueError::Cycle {
                keys: cycle.clone(),
            };
            let mut op = RecordedOp::new(key, TxnOperation::Validate, node.state);
            node.last_error = Some(error.clone());
            node.state = ValueState::Failed;
            node.blocked_by.clear();
            node.retry = None;
            op.new_state = ValueState::Failed;
            op.noop = true;
            op.is_derived = node.is_derived();
            op.error = Some(error);
            plan.rejected.push(op);
        }
    }
    let cyclic = ordering.cyclic_keys();

    // A cycle reported earlier that no longer exists is forgotten; the value
    // is then planned like any other.
    for key in affected.difference(&cyclic) {
        let in_sync = match graph.node_mut(key) {
            Some(node) if matches!(node.last_error, Some(ValueError::Cycle { .. })) => {
                node.last_error = None;
                node.blocked_by.clear();
                is_in_sync(registry, node)
            }
            _ => continue,
        };
        refresh_node_state(graph, key, in_sync);
    }

    // Projection: will the value be available once the transaction is done?
    let mut will: HashMap<String, bool> = HashMap::new();
    for key in &cyclic {
        will.insert(key.clone(), false);
    }
    for key in ordering.levels.iter().flatten() {
        let Some(node) = graph.node(key) else {
            continue;
        };
        let available = node.is_available();
        let projected = match &node.desired {
            None => {
                available && !staged.to_remove.contains(key) && parent_stays(graph, node, &will)
            }
            Some(_) => {
                if !is_appliable(node) || !is_attemptable(node, staged, retry_failed) {
                    // Whatever is applied stays as it is.
                    available
                } else {
                    deps_will_be_satisfied(graph, node, &affected, &will)
                }
            }
        };
        will.insert(key.clone(), projected);
    }

    // Operations per key.
    let mut deletes: BTreeMap<String, bool> = BTreeMap::new();
    let mut builds: BTreeMap<String, (TxnOperation, bool)> = BTreeMap::new();
    for key in ordering.levels.iter().flatten() {
        let Some(node) = graph.node(key) else {
            continue;
        };
        let available = node.is_available();
        let projected = will.get(key).copied().unwrap_or(false);
        let sb_owned = node.origin == ValueOrigin::FromSb;

        if node.desired.is_none() {
            if available && !projected && !sb_owned {
                deletes.insert(key.clone(), false);
            }
            continue;
        }
        if !is_appliable(node) || !is_attemptable(node, staged, retry_failed) {
            continue;
        }
        match (projected, available) {
            (true, false) => {
                builds.insert(key.clone(), (TxnOperation::Create, false));
            }
            (true, true) => {
                if is_in_sync(registry, node) {
                    continue;
                }
                if needs_recreate(registry, node) {
                    deletes.insert(key.clone(), true);
                    builds.insert(key.clone(), (TxnOperation::Create, true));
                } else {
                    builds.insert(key.clone(), (TxnOperation::Update, false));
                }
            }
            (false, true) if !sb_owned => {
                deletes.insert(key.clone(), false);
            }
            _ => {}
        }
    }

    // Anything whose applied value relies on a value being torn down goes
    // down first, and comes back afterwards if it is still wanted.
    let mut queue: VecDeque<String> = deletes.keys().cloned().collect();
    while let Some(torn) = queue.pop_front() {
        for dependent in graph.dependents_of(&torn) {
            if deletes.contains_key(&dependent) {
                continue;
            }
            let Some(node) = graph.node(&dependent) else {
                continue;
            };
            if !node.is_available()
                || node.origin == ValueOrigin::FromSb
                || !relies_on(graph, node, &torn, &deletes, &will)
            {
                continue;
            }
            let comes_back = will.get(&dependent).copied().unwrap_or(false)
                && node.desired.is_some()
                && is_appliable(node);
            deletes.insert(dependent.clone(), comes_back);
            if comes_back {
                builds.insert(dependent.clone(), (TxnOperation::Create, true));
            } else {
                builds.remove(&dependent);
            }
            queue.push_back(dependent);
        }
    }

    let teardown_keys: BTreeSet<String> = deletes.keys().cloned().collect();
    let teardown = plan_levels(&teardown_keys, |k| graph.applied_dependencies_of(k));
    plan.teardown = teardown
        .levels
        .into_iter()
        .rev()
        .map(|level| {
            level
                .into_iter()
                .map(|key| {
                    let recreate = deletes.get(&key).copied().unwrap_or(false);
                    PlannedOp {
                        key,
                        operation: TxnOperation::Delete,
                        recreate,
                    }
                })
                .collect()
        })
        .collect();
    // Teardown edges cannot form cycles the build graph did not have, but a
    // stale applied graph might; tear those down last, one by one.
    for key in teardown.cycles.into_iter().flatten() {
        let recreate = deletes.get(&key).copied().unwrap_or(false);
        plan.teardown.push(vec![PlannedOp {
            key,
            operation: TxnOperation::Delete,
            recreate,
        }]);
    }

    let build_keys: BTreeSet<String> = builds.keys().cloned().collect();
    let build = plan_levels(&build_keys, |k| graph.dependencies_of(k));
    plan.build = build
        .levels
        .into_iter()
        .map(|level| {
            level
                .into_iter()
                .filter_map(|key| {
                    let (operation, recreate) = builds.get(&key).copied()?;
                    Some(PlannedOp {
                        key,
                        operation,
                        recreate,
                    })
                })
                .collect()
        })
        .collect();

    debug!(
        affected = plan.affected.len(),
        ops = plan.op_count(),
        cycles = ordering.cycles.len(),
        "transaction planned"
    );
    plan
}

/// Validated NB value that may be applied.
fn is_appliable(node: &Node) -> bool {
    !matches!(
        node.last_error,
        Some(ValueError::Validation { .. }) | Some(ValueError::Unimplemented)
    ) && (node.descriptor.is_some() || node.is_property())
}

fn is_attemptable(node: &Node, staged: &Staged, retry_failed: bool) -> bool {
    if staged.explicit.contains(&node.key) {
        return true;
    }
    match node.state {
        ValueState::Failed | ValueState::Retrying => {
            retry_failed
                && node
                    .last_error
                    .as_ref()
                    .map(ValueError::is_retriable)
                    .unwrap_or(true)
        }
        _ => true,
    }
}

fn parent_stays(graph: &Graph, node: &Node, will: &HashMap<String, bool>) -> bool {
    match &node.parent {
        None => true,
        Some(parent) => match will.get(parent) {
            Some(w) => *w,
            None => graph.node(parent).map(Node::is_available).unwrap_or(false),
        },
    }
}

fn projected_satisfied(
    graph: &Graph,
    key: &str,
    affected: &BTreeSet<String>,
    will: &HashMap<String, bool>,
) -> bool {
    if affected.contains(key) {
        will.get(key).copied().unwrap_or(false)
    } else {
        is_key_satisfied(graph, key)
    }
}

fn deps_will_be_satisfied(
    graph: &Graph,
    node: &Node,
    affected: &BTreeSet<String>,
    will: &HashMap<String, bool>,
) -> bool {
    if let Some(parent) = &node.parent {
        let parent_ok = if affected.contains(parent) {
            will.get(parent).copied().unwrap_or(false)
        } else {
            graph.node(parent).map(Node::is_available).unwrap_or(false)
        };
        if !parent_ok {
            return false;
        }
    }
    node.targets().iter().all(|dep| match &dep.target {
        DependencyTarget::Key(target) => projected_satisfied(graph, target, affected, will),
        DependencyTarget::AnyOf { key_prefixes } => key_prefixes.iter().any(|prefix| {
            graph
                .keys_with_prefix(prefix)
                .any(|k| k != node.key && projected_satisfied(graph, k, affected, will))
        }),
    })
}

fn needs_recreate(registry: &DescriptorRegistry, node: &Node) -> bool {
    let (Some(desired), Some(applied)) = (&node.desired, &node.value) else {
        return false;
    };
    match node.descriptor.as_deref().and_then(|n| registry.get(n)) {
        Some(desc) => desc.update_with_recreate(&node.key, applied, desired, node.metadata.as_ref()),
        // Properties have no update operation.
        None => true,
    }
}

/// Whether the applied value of `node` stops being valid once `torn` goes.
fn relies_on(
    graph: &Graph,
    node: &Node,
    torn: &str,
    deletes: &BTreeMap<String, bool>,
    will: &HashMap<String, bool>,
) -> bool {
    if node.parent.as_deref() == Some(torn) {
        return true;
    }
    node.applied_targets()
        .iter()
        .any(|dep: &Dependency| match &dep.target {
            DependencyTarget::Key(target) => target == torn,
            DependencyTarget::AnyOf { key_prefixes } => {
                dep.matches(torn)
                    && !key_prefixes.iter().any(|prefix| {
                        graph.keys_with_prefix(prefix).any(|k| {
                            k != torn
                                && k != node.key
                                && !deletes.contains_key(k)
                                && will
                                    .get(k)
                                    .copied()
                                    .unwrap_or_else(|| is_key_satisfied(graph, k))
                        })
                    })
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MockDescriptor;
    use serde_json::json;

    fn registry() -> DescriptorRegistry {
        let mut registry = DescriptorRegistry::new();
        registry
            .register(MockDescriptor::new("iface", "iface/"))
            .unwrap();
        registry
            .register(MockDescriptor::new("bd", "bd/").with_dependencies(|_, v| {
                v["members"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|m| m.as_str())
                    .map(|m| Dependency::on_key("member", format!("iface/{m}")))
                    .collect()
            }))
            .unwrap();
        registry
    }

    fn stage(
        graph: &mut Graph,
        registry: &DescriptorRegistry,
        ops: &[(&str, Option<serde_json::Value>)],
    ) -> Staged {
        let mut staging = Staging::new(graph, registry, 1, true);
        for (key, value) in ops {
            staging.set_desired(key, value.clone().map(AnyValue::from_json));
        }
        staging.finish()
    }

    fn keys_of(levels: &[Vec<PlannedOp>]) -> Vec<Vec<String>> {
        levels
            .iter()
            .map(|l| l.iter().map(|op| op.key.clone()).collect())
            .collect()
    }

    #[test]
    fn missing_dependency_yields_no_operation() {
        let registry = registry();
        let mut graph = Graph::new();
        let staged = stage(
            &mut graph,
            &registry,
            &[("bd/bd1", Some(json!({"members": ["if1"]})))],
        );
        let plan = plan(&mut graph, &registry, &staged, false);
        assert_eq!(plan.op_count(), 0);
        assert!(plan.affected.contains("bd/bd1"));
    }

    #[test]
    fn dependencies_are_built_first() {
        let registry = registry();
        let mut graph = Graph::new();
        let staged = stage(
            &mut graph,
            &registry,
            &[
                ("bd/bd1", Some(json!({"members": ["if1"]}))),
                ("iface/if1", Some(json!({"mtu": 1500}))),
            ],
        );
        let plan = plan(&mut graph, &registry, &staged, false);
        assert!(plan.teardown.is_empty());
        assert_eq!(
            keys_of(&plan.build),
            vec![vec!["iface/if1".to_string()], vec!["bd/bd1".to_string()]]
        );
    }

    #[test]
    fn unimplemented_key_is_rejected() {
        let registry = registry();
        let mut graph = Graph::new();
        let staged = stage(&mut graph, &registry, &[("acl/a1", Some(json!({})))]);
        assert_eq!(staged.rejected.len(), 1);
        assert_eq!(
            graph.node("acl/a1").unwrap().state,
            ValueState::Unimplemented
        );
        let plan = plan(&mut graph, &registry, &staged, false);
        assert_eq!(plan.op_count(), 0);
    }

    #[test]
    fn applied_dependents_are_torn_down_first() {
        let registry = registry();
        let mut graph = Graph::new();
        for (key, value) in [
            ("iface/if1", json!({"mtu": 1500})),
            ("bd/bd1", json!({"members": ["if1"]})),
        ] {
            let node = graph.get_or_insert(key);
            let v = registry
                .descriptor_for_key(key)
                .unwrap()
                .normalize(key, &AnyValue::from_json(value))
                .unwrap();
            node.desired = Some(v.clone());
            node.value = Some(v);
            node.descriptor = registry.descriptor_for_key(key).map(|d| d.name().to_string());
            node.origin = ValueOrigin::FromNb;
            node.state = ValueState::Configured;
        }
        graph.set_targets("bd/bd1", vec![Dependency::on_key("member", "iface/if1")]);
        graph.set_applied_targets("bd/bd1", vec![Dependency::on_key("member", "iface/if1")]);

        let staged = stage(&mut graph, &registry, &[("iface/if1", None)]);
        let plan = plan(&mut graph, &registry, &staged, false);
        assert_eq!(
            keys_of(&plan.teardown),
            vec![vec!["bd/bd1".to_string()], vec!["iface/if1".to_string()]]
        );
        assert!(plan.build.is_empty());
    }

    #[test]
    fn roots_follow_blocked_dependencies() {
        let mut graph = Graph::new();
        graph.get_or_insert("c").state = ValueState::Failed;
        let b = graph.get_or_insert("b");
        b.state = ValueState::Pending;
        b.blocked_by = vec!["c".into()];
        assert_eq!(blocking_roots(&graph, &["b".to_string()]), vec!["c"]);
        assert_eq!(blocking_roots(&graph, &["x".to_string()]), vec!["x"]);
    }
}
