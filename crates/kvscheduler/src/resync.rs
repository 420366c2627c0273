//! Retrieval and correlation of southbound state.
//!
//! A resync first dumps every descriptor (in `retrieve_dependencies` order),
//! then writes the dumped values into the graph as the applied state and,
//! for a full resync, replaces the desired state with the requested one. The
//! planner then sees an ordinary diff between desired and applied values.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::descriptor::{ErasedDescriptor, ErasedKv};
use crate::error::DescriptorError;
use crate::graph::{plan_levels, Graph};
use crate::obs;
use crate::registry::DescriptorRegistry;
use crate::txn::planner::Staging;
use crate::txn::record::RetrieveFailure;
use crate::txn::ResyncMode;
use crate::value::{AnyValue, KeyValuePair, ValueOrigin};

/// Result of dumping one descriptor.
pub(crate) struct Dumped {
    pub descriptor: String,
    /// `None` when the descriptor cannot retrieve.
    pub values: Option<Vec<ErasedKv>>,
    /// Origins known to the scheduler for the correlated keys.
    pub correlated: HashMap<String, ValueOrigin>,
}

#[derive(Default)]
pub(crate) struct Retrieval {
    pub dumped: Vec<Dumped>,
    pub failures: Vec<RetrieveFailure>,
}

impl Retrieval {
    /// Names of descriptors whose Retrieve failed.
    pub fn failed(&self) -> BTreeSet<String> {
        self.failures.iter().map(|f| f.descriptor.clone()).collect()
    }
}

/// Descriptors ordered so that every one comes after those named in its
/// `retrieve_dependencies`. Unknown names are ignored; descriptors caught
/// in a cycle go last in registration order.
pub(crate) fn retrieve_order(registry: &DescriptorRegistry) -> Vec<Arc<dyn ErasedDescriptor>> {
    let names: BTreeSet<String> = registry.names().into_iter().collect();
    let order = plan_levels(&names, |name| {
        registry
            .get(name)
            .map(|d| d.retrieve_dependencies())
            .unwrap_or_default()
    });
    let mut ordered: Vec<Arc<dyn ErasedDescriptor>> = order
        .levels
        .iter()
        .flatten()
        .filter_map(|name| registry.get(name).cloned())
        .collect();
    if !order.cycles.is_empty() {
        let cyclic = order.cyclic_keys();
        warn!(descriptors = ?cyclic, "retrieve dependencies form a cycle");
        ordered.extend(
            registry
                .descriptors()
                .filter(|d| cyclic.contains(d.name()))
                .cloned(),
        );
    }
    ordered
}

/// Values the scheduler knows for keys of `descriptor`: applied ones from the
/// graph, plus requested ones (full resync) not applied yet.
pub(crate) fn correlate_for(
    graph: &Graph,
    descriptor: &dyn ErasedDescriptor,
    requested: &[KeyValuePair],
) -> Vec<ErasedKv> {
    let mut correlate: BTreeMap<String, ErasedKv> = graph
        .nodes()
        .filter(|n| n.descriptor.as_deref() == Some(descriptor.name()))
        .filter_map(|n| {
            let value = n.value.clone()?;
            let kv = ErasedKv {
                key: n.key.clone(),
                value,
                metadata: n.metadata.clone(),
                origin: n.origin,
            };
            Some((n.key.clone(), kv))
        })
        .collect();
    for kv in requested {
        if descriptor.key_selector(&kv.key) && !correlate.contains_key(&kv.key) {
            correlate.insert(
                kv.key.clone(),
                ErasedKv {
                    key: kv.key.clone(),
                    value: kv.value.clone(),
                    metadata: None,
                    origin: ValueOrigin::FromNb,
                },
            );
        }
    }
    correlate.into_values().collect()
}

/// Run Retrieve on `descriptors`, one after another.
pub(crate) async fn retrieve(
    graph: &Graph,
    descriptors: &[Arc<dyn ErasedDescriptor>],
    requested: &[KeyValuePair],
    config: &SchedulerConfig,
) -> Retrieval {
    let mut retrieval = Retrieval::default();
    for descriptor in descriptors {
        let correlate = correlate_for(graph, descriptor.as_ref(), requested);
        let correlated = correlate
            .iter()
            .map(|kv| (kv.key.clone(), kv.origin))
            .collect();
        match retrieve_one(descriptor.as_ref(), &correlate, config).await {
            Ok(values) => {
                debug!(
                    descriptor = %descriptor.name(),
                    retrieved = values.as_ref().map(Vec::len),
                    "descriptor retrieved"
                );
                retrieval.dumped.push(Dumped {
                    descriptor: descriptor.name().to_string(),
                    values,
                    correlated,
                });
            }
            Err(err) => {
                obs::emit_retrieve_failed(descriptor.name(), &err);
                retrieval.failures.push(RetrieveFailure {
                    descriptor: descriptor.name().to_string(),
                    message: err.message,
                });
            }
        }
    }
    retrieval
}

pub(crate) async fn retrieve_one(
    descriptor: &dyn ErasedDescriptor,
    correlate: &[ErasedKv],
    config: &SchedulerConfig,
) -> Result<Option<Vec<ErasedKv>>, DescriptorError> {
    match tokio::time::timeout(config.op_timeout(), descriptor.retrieve(correlate)).await {
        Ok(result) => result,
        Err(_) => Err(DescriptorError::new(format!(
            "retrieve of {} timed out after {} ms",
            descriptor.name(),
            config.op_timeout_ms
        ))),
    }
}

/// Origin of a retrieved value whose descriptor could not tell.
pub(crate) fn resolve_origin(
    graph: &Graph,
    kv: &ErasedKv,
    correlated: &HashMap<String, ValueOrigin>,
) -> ValueOrigin {
    if kv.origin != ValueOrigin::Unknown {
        return kv.origin;
    }
    if let Some(origin) = correlated.get(&kv.key).filter(|o| **o != ValueOrigin::Unknown) {
        return *origin;
    }
    match graph.node(&kv.key) {
        Some(node) if node.origin != ValueOrigin::Unknown => node.origin,
        _ => ValueOrigin::FromSb,
    }
}

/// Write the retrieved state into the graph and stage the resync.
pub(crate) fn stage_resync(
    staging: &mut Staging<'_>,
    registry: &DescriptorRegistry,
    retrieval: &Retrieval,
    mode: ResyncMode,
    requested: Vec<KeyValuePair>,
) {
    let failed = retrieval.failed();
    let excluded = |key: &str| {
        registry
            .descriptor_for_key(key)
            .map(|d| failed.contains(d.name()))
            .unwrap_or(false)
    };

    for dumped in &retrieval.dumped {
        let Some(values) = &dumped.values else {
            continue;
        };
        let mut seen = BTreeSet::new();
        for kv in values {
            let owner = registry.descriptor_for_key(&kv.key).map(|d| d.name().to_string());
            if owner.as_deref() != Some(dumped.descriptor.as_str()) {
                debug!(key = %kv.key, descriptor = %dumped.descriptor, "ignoring retrieved key of another descriptor");
                continue;
            }
            let origin = resolve_origin(staging.graph(), kv, &dumped.correlated);
            seen.insert(kv.key.clone());
            staging.set_retrieved(&kv.key, Some(kv.value.clone()), kv.metadata.clone(), origin);
        }
        let gone: Vec<String> = staging
            .graph()
            .nodes()
            .filter(|n| {
                n.is_available()
                    && !seen.contains(&n.key)
                    && registry
                        .descriptor_for_key(&n.key)
                        .map(|d| d.name() == dumped.descriptor)
                        .unwrap_or(false)
            })
            .map(|n| n.key.clone())
            .collect();
        for key in gone {
            staging.set_retrieved(&key, None, None, ValueOrigin::Unknown);
        }
    }

    sync_properties(staging);

    match mode {
        ResyncMode::Full => {
            let requested_keys: BTreeSet<String> =
                requested.iter().map(|kv| kv.key.clone()).collect();
            for kv in requested {
                if excluded(&kv.key) {
                    continue;
                }
                staging.set_desired(&kv.key, Some(kv.value));
            }
            let (stale, orphans): (Vec<String>, Vec<String>) = {
                let graph = staging.graph();
                let stale = graph
                    .nodes()
                    .filter(|n| {
                        n.desired.is_some()
                            && !n.is_derived()
                            && !requested_keys.contains(&n.key)
                            && !excluded(&n.key)
                    })
                    .map(|n| n.key.clone())
                    .collect();
                let orphans = graph
                    .nodes()
                    .filter(|n| {
                        n.desired.is_none()
                            && !n.is_derived()
                            && n.is_available()
                            && n.origin != ValueOrigin::FromSb
                            && !requested_keys.contains(&n.key)
                            && !excluded(&n.key)
                    })
                    .map(|n| n.key.clone())
                    .collect();
                (stale, orphans)
            };
            for key in stale {
                staging.set_desired(&key, None);
            }
            for key in orphans {
                staging.mark_removal(&key);
            }
        }
        ResyncMode::Downstream => {}
    }

    let all: Vec<String> = staging
        .graph()
        .nodes()
        .filter(|n| !excluded(&n.key))
        .map(|n| n.key.clone())
        .collect();
    for key in all {
        staging.touch(&key);
    }
}

/// Properties are applied together with their parent.
fn sync_properties(staging: &mut Staging<'_>) {
    let updates: Vec<(String, Option<AnyValue>)> = staging
        .graph()
        .nodes()
        .filter(|n| n.is_property())
        .filter_map(|n| {
            let parent = n.parent.as_deref().and_then(|p| staging.graph().node(p))?;
            let value = if parent.is_available() {
                n.value.clone().or_else(|| n.desired.clone())
            } else {
                None
            };
            let changed = value.is_some() != n.is_available();
            changed.then(|| (n.key.clone(), value))
        })
        .collect();
    for (key, value) in updates {
        staging.set_retrieved(&key, value, None, ValueOrigin::FromNb);
    }
}
