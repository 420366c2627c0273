//! Execution of planned operations.
//!
//! Levels run one after another; operations inside a level are independent
//! and are dispatched concurrently, bounded by the configured parallelism.
//! Before dispatch every operation re-checks its preconditions against the
//! graph as left by the previous levels, so a failure early in the
//! transaction blocks its dependents instead of letting them run against a
//! missing value. The graph is only mutated between levels, never while
//! descriptor calls are in flight.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::descriptor::{DependencyTarget, ErasedDescriptor};
use crate::error::{DescriptorError, ValueError};
use crate::graph::Graph;
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::DescriptorRegistry;
use crate::state::{refresh_node_state, unsatisfied_dependencies, TxnOperation, ValueState};
use crate::txn::planner::{blocking_roots, is_in_sync, Plan, PlannedOp};
use crate::txn::record::RecordedOp;
use crate::txn::retry::RetryState;
use crate::txn::{CancelToken, TxnKind, TxnOptions};
use crate::value::{AnyMetadata, AnyValue, ValueOrigin};

pub(crate) struct ExecContext<'a> {
    pub registry: &'a DescriptorRegistry,
    pub config: &'a SchedulerConfig,
    pub options: &'a TxnOptions,
    pub seq_num: u64,
    pub kind: TxnKind,
}

impl ExecContext<'_> {
    fn is_retry(&self) -> bool {
        matches!(self.kind, TxnKind::Retry { .. })
    }
}

/// What execution left behind.
#[derive(Debug, Default)]
pub(crate) struct Execution {
    /// Operations in the order their outcome was applied.
    pub executed: Vec<RecordedOp>,
    /// Keys for which a retry was scheduled, with the attempt that failed.
    pub retries: Vec<(String, u32)>,
    pub cancelled: bool,
}

struct Job {
    key: String,
    operation: TxnOperation,
    recreate: bool,
    descriptor: Arc<dyn ErasedDescriptor>,
    desired: Option<AnyValue>,
    applied: Option<AnyValue>,
    metadata: Option<AnyMetadata>,
}

enum Outcome {
    Done(Option<AnyMetadata>),
    Failed { error: DescriptorError, retriable: bool },
    Cancelled,
}

struct Finished {
    key: String,
    operation: TxnOperation,
    recreate: bool,
    outcome: Outcome,
}

/// Run `plan` against `graph`.
pub(crate) async fn execute(graph: &mut Graph, plan: &Plan, ctx: &ExecContext<'_>) -> Execution {
    let mut execution = Execution::default();
    // Keys whose Delete half of a re-creation did not happen.
    let mut kept: BTreeSet<String> = BTreeSet::new();

    for level in plan.teardown.iter().chain(plan.build.iter()) {
        let mut jobs = Vec::new();
        let mut immediate = Vec::new();
        for op in level {
            if op.operation != TxnOperation::Delete && op.recreate && kept.contains(&op.key) {
                continue;
            }
            match prepare(graph, op, ctx, &mut execution) {
                Prepared::Job(job) => jobs.push(job),
                Prepared::Immediate(finished) => immediate.push(finished),
                Prepared::Skipped => {
                    if op.operation == TxnOperation::Delete {
                        kept.insert(op.key.clone());
                    }
                }
            }
        }

        let mut finished = run_jobs(jobs, ctx.config, ctx.options.cancel.clone()).await;
        finished.extend(immediate);
        finished.sort_by(|a, b| a.key.cmp(&b.key));
        for result in finished {
            if result.operation == TxnOperation::Delete && !matches!(result.outcome, Outcome::Done(_)) {
                kept.insert(result.key.clone());
            }
            if matches!(result.outcome, Outcome::Cancelled) {
                execution.cancelled = true;
            }
            apply(graph, result, ctx, &mut execution);
        }
    }

    finalize(graph, plan, ctx);
    execution
}

enum Prepared {
    Job(Job),
    Immediate(Finished),
    Skipped,
}

fn prepare(
    graph: &mut Graph,
    op: &PlannedOp,
    ctx: &ExecContext<'_>,
    execution: &mut Execution,
) -> Prepared {
    let Some(node) = graph.node(&op.key) else {
        return Prepared::Skipped;
    };

    if ctx.options.is_cancelled() {
        return Prepared::Immediate(Finished {
            key: op.key.clone(),
            operation: op.operation,
            recreate: op.recreate,
            outcome: Outcome::Cancelled,
        });
    }

    if op.operation == TxnOperation::Delete {
        let holders = applied_holders(graph, &op.key);
        if !holders.is_empty() {
            let mut rec = RecordedOp::new(&op.key, op.operation, node.state);
            rec.noop = true;
            rec.is_derived = node.is_derived();
            rec.is_retry = ctx.is_retry();
            rec.is_recreate = op.recreate;
            rec.prev_value = node.value.as_ref().map(AnyValue::to_json);
            rec.new_value = rec.prev_value.clone();
            rec.error = Some(ValueError::DependencyBlocked { blocked_by: holders });
            execution.executed.push(rec);
            return Prepared::Skipped;
        }
    } else {
        let unsatisfied = unsatisfied_dependencies(graph, node);
        if !unsatisfied.is_empty() {
            let roots = blocking_roots(graph, &unsatisfied);
            let is_derived = node.is_derived();
            let prev_state = node.state;
            let prev_value = node.value.as_ref().map(AnyValue::to_json);
            let error = ValueError::DependencyBlocked {
                blocked_by: roots.clone(),
            };
            let in_sync = {
                let Some(node) = graph.node_mut(&op.key) else {
                    return Prepared::Skipped;
                };
                node.blocked_by = roots;
                node.last_error = Some(error.clone());
                is_in_sync(ctx.registry, node)
            };
            let new_state =
                refresh_node_state(graph, &op.key, in_sync).unwrap_or(ValueState::Pending);
            let mut rec = RecordedOp::new(&op.key, op.operation, prev_state);
            rec.new_state = new_state;
            rec.noop = true;
            rec.is_derived = is_derived;
            rec.is_retry = ctx.is_retry();
            rec.is_recreate = op.recreate;
            rec.new_value = prev_value.clone();
            rec.prev_value = prev_value;
            rec.error = Some(error);
            debug!(key = %op.key, "operation blocked by unsatisfied dependencies");
            execution.executed.push(rec);
            return Prepared::Skipped;
        }
    }

    if node.is_property() {
        return Prepared::Immediate(Finished {
            key: op.key.clone(),
            operation: op.operation,
            recreate: op.recreate,
            outcome: Outcome::Done(None),
        });
    }

    let Some(descriptor) = node
        .descriptor
        .as_deref()
        .and_then(|name| ctx.registry.get(name))
        .cloned()
    else {
        return Prepared::Skipped;
    };
    Prepared::Job(Job {
        key: op.key.clone(),
        operation: op.operation,
        recreate: op.recreate,
        descriptor,
        desired: node.desired.clone(),
        applied: node.value.clone(),
        metadata: node.metadata.clone(),
    })
}

/// NB values whose applied state still relies on `key`.
fn applied_holders(graph: &Graph, key: &str) -> Vec<String> {
    graph
        .dependents_of(key)
        .into_iter()
        .filter(|dependent| {
            graph
                .node(dependent)
                .map(|n| {
                    n.is_available()
                        && n.origin != ValueOrigin::FromSb
                        && (n.parent.as_deref() == Some(key)
                            || n.applied_targets().iter().any(|d| {
                                matches!(&d.target, DependencyTarget::Key(k) if k == key)
                            }))
                })
                .unwrap_or(false)
        })
        .collect()
}

async fn run_jobs(
    jobs: Vec<Job>,
    config: &SchedulerConfig,
    cancel: Option<CancelToken>,
) -> Vec<Finished> {
    if jobs.is_empty() {
        return Vec::new();
    }
    let timeout = config.op_timeout();
    stream::iter(jobs.into_iter().map(|job| {
        let cancel = cancel.clone();
        async move { run_job(job, timeout, cancel).await }
    }))
    .buffer_unordered(config.parallelism.max(1))
    .collect()
    .await
}

async fn run_job(job: Job, timeout: Duration, cancel: Option<CancelToken>) -> Finished {
    let Job {
        key,
        operation,
        recreate,
        descriptor,
        desired,
        applied,
        metadata,
    } = job;

    if cancel.as_ref().map(CancelToken::is_cancelled).unwrap_or(false) {
        return Finished {
            key,
            operation,
            recreate,
            outcome: Outcome::Cancelled,
        };
    }

    let call = async {
        match operation {
            TxnOperation::Create => match &desired {
                Some(value) => descriptor.create(&key, value).await.map(Some),
                None => Err(DescriptorError::non_retriable(format!("nothing to create for {key}"))),
            },
            TxnOperation::Update => match (&applied, &desired) {
                (Some(old), Some(new)) => descriptor
                    .update(&key, old, new, metadata.as_ref())
                    .await
                    .map(Some),
                _ => Err(DescriptorError::non_retriable(format!("nothing to update for {key}"))),
            },
            TxnOperation::Delete => match &applied {
                Some(value) => descriptor
                    .delete(&key, value, metadata.as_ref())
                    .await
                    .map(|_| None),
                None => Ok(None),
            },
            TxnOperation::Validate | TxnOperation::Undefined => Ok(None),
        }
    };

    let outcome = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(metadata)) => Outcome::Done(metadata),
        Ok(Err(error)) => {
            let retriable = descriptor.is_retriable_failure(&error);
            Outcome::Failed { error, retriable }
        }
        Err(_) => Outcome::Failed {
            error: DescriptorError::timeout(operation, &key, timeout.as_millis() as u64),
            retriable: true,
        },
    };
    Finished {
        key,
        operation,
        recreate,
        outcome,
    }
}

fn apply(graph: &mut Graph, result: Finished, ctx: &ExecContext<'_>, execution: &mut Execution) {
    let Finished {
        key,
        operation,
        recreate,
        outcome,
    } = result;
    let Some(node) = graph.node_mut(&key) else {
        return;
    };
    let prev_state = node.state;
    let prev_value = node.value.as_ref().map(AnyValue::to_json);
    let mut rec = RecordedOp::new(&key, operation, prev_state);
    rec.is_derived = node.is_derived();
    rec.is_retry = ctx.is_retry();
    rec.is_recreate = recreate;
    rec.prev_value = prev_value;

    let mut applied_targets = None;
    match outcome {
        Outcome::Done(metadata) => {
            match operation {
                TxnOperation::Delete => {
                    node.value = None;
                    node.metadata = None;
                    applied_targets = Some(Vec::new());
                }
                _ => {
                    node.value = node.desired.clone();
                    node.metadata = metadata;
                    node.origin = ValueOrigin::FromNb;
                    node.blocked_by.clear();
                    applied_targets = Some(node.targets().to_vec());
                }
            }
            node.last_error = None;
            node.retry = None;
            node.revision += 1;
            METRICS.inc_operations();
        }
        Outcome::Failed { error, retriable } => {
            let attempt = match (&node.retry, ctx.is_retry()) {
                (Some(retry), true) => retry.attempt + 1,
                _ => 1,
            };
            let policy = &ctx.config.retry;
            let scheduled =
                retriable && ctx.options.retry_enabled && policy.allows_retry_after(attempt);
            let next_retry_at = scheduled
                .then(|| chrono::Duration::from_std(policy.backoff(attempt)).ok())
                .flatten()
                .map(|delay| Utc::now() + delay);
            node.retry = Some(RetryState {
                attempt,
                scheduled,
                next_retry_at,
                failed_in_txn: ctx.seq_num,
            });
            let value_error = ValueError::from_operation(&error, retriable);
            node.last_error = Some(value_error.clone());
            node.blocked_by.clear();
            rec.error = Some(value_error);
            if scheduled {
                execution.retries.push((key.clone(), attempt));
            }
            METRICS.inc_failures();
            obs::emit_op_failed(&key, operation, &error, retriable);
        }
        Outcome::Cancelled => {
            node.last_error = Some(ValueError::Cancelled);
            rec.error = Some(ValueError::Cancelled);
            rec.noop = true;
        }
    }
    node.last_op = operation;
    node.last_update = ctx.seq_num;
    let new_value = node.value.as_ref().map(AnyValue::to_json);
    let in_sync = is_in_sync(ctx.registry, node);

    if let Some(targets) = applied_targets {
        graph.set_applied_targets(&key, targets);
    }
    let new_state = refresh_node_state(graph, &key, in_sync).unwrap_or(prev_state);
    rec.new_state = new_state;
    rec.new_value = new_value;
    if rec.error.is_none() {
        obs::emit_op_executed(&key, operation, new_state);
    }
    execution.executed.push(rec);
}

/// Settle every affected node once all levels ran: pending values learn what
/// blocks them, states are recomputed and nodes with nothing left are
/// dropped from the graph.
fn finalize(graph: &mut Graph, plan: &Plan, ctx: &ExecContext<'_>) {
    for key in &plan.affected {
        let Some(node) = graph.node(key) else {
            continue;
        };
        let in_sync = is_in_sync(ctx.registry, node);
        let blocked = matches!(
            node.last_error,
            None | Some(ValueError::DependencyBlocked { .. })
        );
        let roots = if node.desired.is_some() && blocked && !in_sync {
            let unsatisfied = unsatisfied_dependencies(graph, node);
            blocking_roots(graph, &unsatisfied)
        } else {
            Vec::new()
        };
        let Some(node) = graph.node_mut(key) else {
            continue;
        };
        if blocked {
            if roots.is_empty() {
                node.blocked_by.clear();
                node.last_error = None;
            } else {
                node.last_error = Some(ValueError::DependencyBlocked {
                    blocked_by: roots.clone(),
                });
                node.blocked_by = roots;
            }
        }
        refresh_node_state(graph, key, in_sync);
    }

    // Children first, so that a parent emptied of them can go too.
    let mut removed = true;
    while removed {
        removed = false;
        let obsolete: Vec<String> = plan
            .affected
            .iter()
            .filter(|k| graph.node(k).map(|n| n.is_obsolete()).unwrap_or(false))
            .cloned()
            .collect();
        for key in obsolete {
            if graph.remove(&key).is_some() {
                removed = true;
            }
        }
    }
}
