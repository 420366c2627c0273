//! Graph store: nodes, dependency edges and level-ordered planning.
//!
//! Ordering uses Kahn's algorithm restricted to the keys a transaction
//! touches, producing levels whose members share no dependency edge and can
//! be applied concurrently. Cycles are isolated beforehand with Tarjan's
//! strongly-connected-components pass so that the rest of the subset can
//! still be ordered.

mod node;
mod store;
mod timeline;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

pub use node::Node;
pub use store::Graph;
pub use timeline::{RecordedNode, Timeline};

/// Immutable view of the graph published after each commit.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    /// Sequence number of the last committed transaction.
    pub seq_num: u64,
    pub taken_at: Option<DateTime<Utc>>,
    pub graph: Graph,
}

/// Execution order for a subset of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelPlan {
    /// Dependencies come in earlier levels than their dependents. Keys are
    /// sorted within a level.
    pub levels: Vec<Vec<String>>,
    /// Groups of keys that depend on each other in a cycle.
    pub cycles: Vec<Vec<String>>,
}

impl LevelPlan {
    pub fn cyclic_keys(&self) -> BTreeSet<String> {
        self.cycles.iter().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty() && self.cycles.is_empty()
    }
}

/// Order `keys` so that every key comes after the keys it depends on.
///
/// `deps_of` returns the dependencies of a key; those outside `keys` are
/// ignored. Keys in a cycle are reported in [`LevelPlan::cycles`] and left
/// out of the levels.
pub fn plan_levels<F>(keys: &BTreeSet<String>, deps_of: F) -> LevelPlan
where
    F: Fn(&str) -> Vec<String>,
{
    let adjacency: BTreeMap<&str, Vec<&str>> = keys
        .iter()
        .map(|k| {
            let mut deps: Vec<&str> = deps_of(k)
                .iter()
                .filter_map(|d| keys.get(d.as_str()).map(String::as_str))
                .collect();
            deps.sort_unstable();
            deps.dedup();
            (k.as_str(), deps)
        })
        .collect();

    let cycles = find_cycles(&adjacency);
    let cyclic: HashSet<&str> = cycles.iter().flatten().map(String::as_str).collect();

    // Kahn over the acyclic remainder.
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (&key, deps) in &adjacency {
        if cyclic.contains(key) {
            continue;
        }
        let live: Vec<&str> = deps
            .iter()
            .copied()
            .filter(|d| !cyclic.contains(d))
            .collect();
        in_degree.insert(key, live.len());
        for dep in live {
            dependents.entry(dep).or_default().push(key);
        }
    }

    let mut levels = Vec::new();
    let mut current: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&k, _)| k)
        .collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for key in &current {
            for dependent in dependents.get(key).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        next.sort_unstable();
        levels.push(current.iter().map(|k| k.to_string()).collect());
        current = next;
    }

    LevelPlan { levels, cycles }
}

fn find_cycles(adjacency: &BTreeMap<&str, Vec<&str>>) -> Vec<Vec<String>> {
    let mut tarjan = Tarjan {
        adjacency,
        next_index: 0,
        index: HashMap::new(),
        low: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        components: Vec::new(),
    };
    for &key in adjacency.keys() {
        if !tarjan.index.contains_key(key) {
            tarjan.visit(key);
        }
    }
    let mut cycles: Vec<Vec<String>> = tarjan
        .components
        .into_iter()
        .filter(|c| {
            c.len() > 1
                || adjacency
                    .get(c[0].as_str())
                    .map(|deps| deps.contains(&c[0].as_str()))
                    .unwrap_or(false)
        })
        .map(|mut c| {
            c.sort();
            c
        })
        .collect();
    cycles.sort();
    cycles
}

struct Tarjan<'a> {
    adjacency: &'a BTreeMap<&'a str, Vec<&'a str>>,
    next_index: usize,
    index: HashMap<&'a str, usize>,
    low: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: HashSet<&'a str>,
    components: Vec<Vec<String>>,
}

impl<'a> Tarjan<'a> {
    fn visit(&mut self, v: &'a str) {
        self.index.insert(v, self.next_index);
        self.low.insert(v, self.next_index);
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack.insert(v);

        let adjacency = self.adjacency;
        for &w in adjacency.get(v).into_iter().flatten() {
            if !self.index.contains_key(w) {
                self.visit(w);
                let low = self.low[v].min(self.low[w]);
                self.low.insert(v, low);
            } else if self.on_stack.contains(w) {
                let low = self.low[v].min(self.index[w]);
                self.low.insert(v, low);
            }
        }

        if self.low[v] == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack.remove(w);
                component.push(w.to_string());
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
