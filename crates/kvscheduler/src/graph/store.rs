//! In-memory graph of nodes with a reverse-dependency index.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::descriptor::{Dependency, DependencyTarget};
use crate::graph::node::Node;

/// Nodes keyed by key, plus `dependency → dependents` adjacency.
///
/// Exact-key dependencies are indexed by key, `AnyOf` dependencies by
/// prefix. Both the desired and the applied dependencies of a node are
/// indexed, so teardown can find everything still relying on a value.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Node>,
    dependents: HashMap<String, BTreeSet<String>>,
    prefix_dependents: BTreeMap<String, BTreeSet<String>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn node(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub(crate) fn node_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub(crate) fn get_or_insert(&mut self, key: &str) -> &mut Node {
        self.nodes
            .entry(key.to_string())
            .or_insert_with(|| Node::new(key))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Keys starting with `prefix`, in key order.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.nodes
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .map(|(k, _)| k.as_str())
            .take_while(move |k| k.starts_with(prefix))
    }

    /// Remove a node, its index entries and its link from the parent.
    pub(crate) fn remove(&mut self, key: &str) -> Option<Node> {
        let node = self.nodes.remove(key)?;
        self.unindex(key, node.targets.iter().chain(node.applied_targets.iter()));
        if let Some(parent) = &node.parent {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.derived.remove(key);
            }
        }
        Some(node)
    }

    /// Replace the dependencies of the desired value of `key`.
    pub(crate) fn set_targets(&mut self, key: &str, targets: Vec<Dependency>) {
        let applied = self
            .nodes
            .get(key)
            .map(|n| n.applied_targets.clone())
            .unwrap_or_default();
        self.replace_dependencies(key, targets, applied);
    }

    /// Replace the dependencies of the applied value of `key`.
    pub(crate) fn set_applied_targets(&mut self, key: &str, applied: Vec<Dependency>) {
        let targets = self
            .nodes
            .get(key)
            .map(|n| n.targets.clone())
            .unwrap_or_default();
        self.replace_dependencies(key, targets, applied);
    }

    fn replace_dependencies(
        &mut self,
        key: &str,
        targets: Vec<Dependency>,
        applied: Vec<Dependency>,
    ) {
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };
        let old_targets = std::mem::replace(&mut node.targets, targets);
        let old_applied = std::mem::replace(&mut node.applied_targets, applied);
        self.unindex(key, old_targets.iter().chain(old_applied.iter()));

        let node = &self.nodes[key];
        let new: Vec<Dependency> = node
            .targets
            .iter()
            .chain(node.applied_targets.iter())
            .cloned()
            .collect();
        for dep in new {
            match dep.target {
                DependencyTarget::Key(target) => {
                    self.dependents
                        .entry(target)
                        .or_default()
                        .insert(key.to_string());
                }
                DependencyTarget::AnyOf { key_prefixes } => {
                    for prefix in key_prefixes {
                        self.prefix_dependents
                            .entry(prefix)
                            .or_default()
                            .insert(key.to_string());
                    }
                }
            }
        }
    }

    fn unindex<'d>(&mut self, key: &str, deps: impl Iterator<Item = &'d Dependency>) {
        for dep in deps {
            match &dep.target {
                DependencyTarget::Key(target) => {
                    if let Some(set) = self.dependents.get_mut(target) {
                        set.remove(key);
                        if set.is_empty() {
                            self.dependents.remove(target);
                        }
                    }
                }
                DependencyTarget::AnyOf { key_prefixes } => {
                    for prefix in key_prefixes {
                        if let Some(set) = self.prefix_dependents.get_mut(prefix) {
                            set.remove(key);
                            if set.is_empty() {
                                self.prefix_dependents.remove(prefix);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Keys that directly depend on `key`, including its derived values.
    pub fn dependents_of(&self, key: &str) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.dependents.get(key).cloned().unwrap_or_default();
        for (prefix, keys) in &self.prefix_dependents {
            if key.starts_with(prefix.as_str()) {
                out.extend(keys.iter().cloned());
            }
        }
        if let Some(node) = self.nodes.get(key) {
            out.extend(node.derived.iter().cloned());
        }
        out.remove(key);
        out
    }

    /// `seeds` plus everything depending on them, directly or transitively.
    pub fn dependents_closure(&self, seeds: &BTreeSet<String>) -> BTreeSet<String> {
        let mut visited = seeds.clone();
        let mut queue: VecDeque<String> = seeds.iter().cloned().collect();
        while let Some(key) = queue.pop_front() {
            for dependent in self.dependents_of(&key) {
                if visited.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        visited
    }

    /// Existing keys the desired value of `key` depends on (parent included).
    pub fn dependencies_of(&self, key: &str) -> Vec<String> {
        self.resolve(key, |n| &n.targets)
    }

    /// Existing keys the applied value of `key` depends on (parent included).
    pub fn applied_dependencies_of(&self, key: &str) -> Vec<String> {
        self.resolve(key, |n| &n.applied_targets)
    }

    fn resolve(&self, key: &str, deps: impl Fn(&Node) -> &Vec<Dependency>) -> Vec<String> {
        let Some(node) = self.nodes.get(key) else {
            return Vec::new();
        };
        let mut out = BTreeSet::new();
        if let Some(parent) = &node.parent {
            out.insert(parent.clone());
        }
        for dep in deps(node) {
            match &dep.target {
                DependencyTarget::Key(target) => {
                    if self.nodes.contains_key(target) {
                        out.insert(target.clone());
                    }
                }
                DependencyTarget::AnyOf { key_prefixes } => {
                    for prefix in key_prefixes {
                        out.extend(
                            self.keys_with_prefix(prefix)
                                .filter(|k| *k != key)
                                .map(str::to_string),
                        );
                    }
                }
            }
        }
        out.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(keys: &[&str]) -> Graph {
        let mut g = Graph::new();
        for k in keys {
            g.get_or_insert(k);
        }
        g
    }

    #[test]
    fn reverse_lookup_follows_exact_and_prefix_dependencies() {
        let mut g = graph_with(&["iface/if1", "iface/if2", "bd/bd1", "route/r1"]);
        g.set_targets("bd/bd1", vec![Dependency::on_key("member", "iface/if1")]);
        g.set_targets(
            "route/r1",
            vec![Dependency::any_of("uplink", vec!["iface/".into()])],
        );

        let deps = g.dependents_of("iface/if1");
        assert!(deps.contains("bd/bd1"));
        assert!(deps.contains("route/r1"));
        assert_eq!(g.dependents_of("iface/if2").len(), 1);
        assert_eq!(
            g.dependencies_of("route/r1"),
            vec!["iface/if1".to_string(), "iface/if2".to_string()]
        );
    }

    #[test]
    fn replacing_targets_drops_stale_edges() {
        let mut g = graph_with(&["a", "b", "c"]);
        g.set_targets("a", vec![Dependency::on_key("x", "b")]);
        g.set_targets("a", vec![Dependency::on_key("x", "c")]);
        assert!(g.dependents_of("b").is_empty());
        assert!(g.dependents_of("c").contains("a"));
    }

    #[test]
    fn applied_dependencies_stay_indexed_until_replaced() {
        let mut g = graph_with(&["a", "b"]);
        g.set_applied_targets("a", vec![Dependency::on_key("x", "b")]);
        g.set_targets("a", Vec::new());
        assert!(g.dependents_of("b").contains("a"));
        g.set_applied_targets("a", Vec::new());
        assert!(g.dependents_of("b").is_empty());
    }

    #[test]
    fn closure_includes_transitive_dependents_and_derived() {
        let mut g = graph_with(&["a", "b", "c", "a/prop"]);
        g.set_targets("b", vec![Dependency::on_key("x", "a")]);
        g.set_targets("c", vec![Dependency::on_key("x", "b")]);
        g.get_or_insert("a/prop").parent = Some("a".into());
        g.get_or_insert("a").derived.insert("a/prop".into());

        let seeds: BTreeSet<String> = ["a".to_string()].into();
        let closure = g.dependents_closure(&seeds);
        assert_eq!(closure.len(), 4);
    }

    #[test]
    fn remove_detaches_from_parent_and_index() {
        let mut g = graph_with(&["a", "a/prop", "b"]);
        g.get_or_insert("a/prop").parent = Some("a".into());
        g.get_or_insert("a").derived.insert("a/prop".into());
        g.set_targets("b", vec![Dependency::on_key("x", "a/prop")]);

        g.remove("b");
        g.remove("a/prop");
        assert!(g.node("a").unwrap().derived.is_empty());
        assert!(g.dependents_of("a/prop").is_empty());
    }

    #[test]
    fn prefix_iteration_is_bounded() {
        let g = graph_with(&["bd/bd1", "bd/bd2", "bdx", "iface/if1"]);
        let keys: Vec<&str> = g.keys_with_prefix("bd/").collect();
        assert_eq!(keys, vec!["bd/bd1", "bd/bd2"]);
    }
}
