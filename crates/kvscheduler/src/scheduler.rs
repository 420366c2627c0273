//! The scheduler handle and the serial transaction engine behind it.
//!
//! All requests go through one `mpsc` queue into a single engine task, so
//! transactions run strictly one after another in arrival order. The engine
//! is the only owner of the graph; after each commit it publishes an
//! immutable snapshot through a `watch` channel, from which every read-only
//! query is answered without ever waiting for the engine.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{KeyWithError, Result, SchedulerError, TransactionError};
use crate::graph::{Graph, GraphSnapshot, RecordedNode, Timeline};
use crate::history::{HistoryStore, JsonlHistory, MemoryHistory};
use crate::metrics::METRICS;
use crate::obs::{self, TxnSpan};
use crate::query::{self, DumpView, DumpedKv, MetadataMap, ValueStatus};
use crate::registry::DescriptorRegistry;
use crate::resync;
use crate::txn::executor::{self, ExecContext};
use crate::txn::planner::{self, Staging};
use crate::txn::record::RecordedTxn;
use crate::txn::{ResyncMode, Txn, TxnKind, TxnOptions};
use crate::value::{AnyMetadata, AnyValue, KeyValuePair, ValueOrigin};

const STATUS_CHANNEL_CAPACITY: usize = 1024;

type TxnReply = oneshot::Sender<Result<Arc<RecordedTxn>>>;

enum TxnRequest {
    Change(Txn),
    Resync {
        mode: ResyncMode,
        values: Vec<KeyValuePair>,
    },
    SbNotification {
        key: String,
        value: Option<AnyValue>,
        metadata: Option<AnyMetadata>,
    },
    Retry {
        for_txn: u64,
        attempt: u32,
        keys: Vec<String>,
    },
}

impl TxnRequest {
    fn kind(&self) -> TxnKind {
        match self {
            TxnRequest::Change(_) => TxnKind::Change,
            TxnRequest::Resync { mode, .. } => TxnKind::Resync { mode: *mode },
            TxnRequest::SbNotification { .. } => TxnKind::SbNotification,
            TxnRequest::Retry {
                for_txn, attempt, ..
            } => TxnKind::Retry {
                for_txn: *for_txn,
                attempt: *attempt,
            },
        }
    }
}

enum Request {
    Txn {
        request: TxnRequest,
        options: TxnOptions,
        reply: TxnReply,
    },
    Retry {
        for_txn: u64,
        attempt: u32,
    },
    DumpLive {
        prefix: String,
        reply: oneshot::Sender<Result<Vec<DumpedKv>>>,
    },
}

/// Handle to a running scheduler. Cheap to clone; the engine stops once
/// every handle is dropped.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Request>,
    snapshot: watch::Receiver<Arc<GraphSnapshot>>,
    status_tx: broadcast::Sender<ValueStatus>,
    registry: Arc<DescriptorRegistry>,
    config: Arc<SchedulerConfig>,
    history: Option<Arc<dyn HistoryStore>>,
    timeline: Option<Arc<Mutex<Timeline>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("descriptors", &self.registry.names())
            .field("seq_num", &self.snapshot.borrow().seq_num)
            .finish()
    }
}

impl Scheduler {
    /// Start the engine with the history backend chosen by `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(registry: DescriptorRegistry, config: SchedulerConfig) -> Result<Self> {
        let history: Option<Arc<dyn HistoryStore>> = if !config.history.record {
            None
        } else {
            match &config.history.persist_path {
                Some(path) => Some(Arc::new(JsonlHistory::open(path)?)),
                None => Some(Arc::new(MemoryHistory::new())),
            }
        };
        Self::start_with_history(registry, config, history).await
    }

    /// Start the engine recording into `history` (`None` disables history).
    pub async fn start_with_history(
        registry: DescriptorRegistry,
        config: SchedulerConfig,
        history: Option<Arc<dyn HistoryStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let next_seq = match &history {
            Some(h) => h.last_seq().await?.map(|s| s + 1).unwrap_or(1),
            None => 1,
        };
        let registry = Arc::new(registry);
        let config = Arc::new(config);
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (snapshot_tx, snapshot) = watch::channel(Arc::new(GraphSnapshot {
            seq_num: next_seq.saturating_sub(1),
            ..GraphSnapshot::default()
        }));
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let timeline = config
            .history
            .record
            .then(|| Arc::new(Mutex::new(Timeline::new())));

        let engine = Engine {
            graph: Graph::new(),
            registry: registry.clone(),
            config: config.clone(),
            history: history.clone(),
            timeline: timeline.clone(),
            next_seq,
            started: Utc::now(),
            snapshot_tx,
            status_tx: status_tx.clone(),
            retry_tx: tx.downgrade(),
        };
        tokio::spawn(engine.run(rx));
        info!(
            descriptors = registry.len(),
            parallelism = config.parallelism,
            next_seq = next_seq,
            "scheduler started"
        );

        Ok(Self {
            tx,
            snapshot,
            status_tx,
            registry,
            config,
            history,
            timeline,
        })
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    async fn submit(&self, request: TxnRequest, options: TxnOptions) -> Result<Arc<RecordedTxn>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Txn {
                request,
                options,
                reply,
            })
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    /// Run an incremental Change transaction.
    ///
    /// The transaction always completes; `Err(SchedulerError::Transaction)`
    /// carries the record when at least one key failed.
    pub async fn apply(&self, txn: Txn, options: TxnOptions) -> Result<Arc<RecordedTxn>> {
        self.submit(TxnRequest::Change(txn), options).await
    }

    /// Retrieve everything, make `values` the complete desired state and
    /// remove whatever NB created that is no longer desired.
    pub async fn resync_full(
        &self,
        values: Vec<KeyValuePair>,
        options: TxnOptions,
    ) -> Result<Arc<RecordedTxn>> {
        let request = TxnRequest::Resync {
            mode: ResyncMode::Full,
            values,
        };
        self.submit(request, options).await
    }

    /// Retrieve everything and converge it to the current desired state.
    pub async fn resync_downstream(&self, options: TxnOptions) -> Result<Arc<RecordedTxn>> {
        let request = TxnRequest::Resync {
            mode: ResyncMode::Downstream,
            values: Vec::new(),
        };
        self.submit(request, options).await
    }

    /// Report a value created, changed (`Some`) or removed (`None`) by the
    /// southbound plane on its own.
    pub async fn push_sb_notification(
        &self,
        key: impl Into<String>,
        value: Option<AnyValue>,
        metadata: Option<AnyMetadata>,
    ) -> Result<Arc<RecordedTxn>> {
        let key = key.into();
        if self.registry.descriptor_for_key(&key).is_none() {
            return Err(SchedulerError::UnimplementedKey { key });
        }
        let request = TxnRequest::SbNotification {
            key,
            value,
            metadata,
        };
        self.submit(request, TxnOptions::default()).await
    }

    /// Latest published snapshot of the graph.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self, key: &str) -> Option<ValueStatus> {
        let snapshot = self.snapshot();
        snapshot
            .graph
            .node(key)
            .map(|n| ValueStatus::of(&snapshot.graph, n))
    }

    pub fn status_prefix(&self, prefix: &str) -> Vec<ValueStatus> {
        query::statuses(&self.snapshot().graph, prefix)
    }

    pub fn pending_values(&self, prefix: &str) -> Vec<ValueStatus> {
        query::pending(&self.snapshot().graph, prefix)
    }

    pub fn failed_values(&self, prefix: &str) -> Vec<KeyWithError> {
        query::failed(&self.snapshot().graph, prefix)
    }

    pub fn metadata_map(&self, descriptor: &str) -> Result<MetadataMap> {
        MetadataMap::build(&self.snapshot().graph, &self.registry, descriptor).ok_or_else(|| {
            SchedulerError::DescriptorNotFound {
                name: descriptor.to_string(),
            }
        })
    }

    /// Status updates of keys whose status changed in a committed
    /// transaction. Slow receivers lose the oldest updates.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ValueStatus> {
        self.status_tx.subscribe()
    }

    /// Key-value pairs under `prefix`. A live dump runs Retrieve, queued
    /// behind pending transactions.
    pub async fn dump(&self, prefix: &str, view: DumpView) -> Result<Vec<DumpedKv>> {
        match view {
            DumpView::Cached => Ok(query::dump_cached(&self.snapshot().graph, prefix)),
            DumpView::Desired => Ok(query::dump_desired(&self.snapshot().graph, prefix)),
            DumpView::Live => {
                let (reply, rx) = oneshot::channel();
                self.tx
                    .send(Request::DumpLive {
                        prefix: prefix.to_string(),
                        reply,
                    })
                    .await
                    .map_err(|_| SchedulerError::Closed)?;
                rx.await.map_err(|_| SchedulerError::Closed)?
            }
        }
    }

    pub async fn history(&self, seq_num: u64) -> Result<Option<Arc<RecordedTxn>>> {
        match &self.history {
            Some(h) => h.get(seq_num).await,
            None => Ok(None),
        }
    }

    pub async fn history_all(&self) -> Result<Vec<Arc<RecordedTxn>>> {
        match &self.history {
            Some(h) => h.all().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn history_range(&self, from: u64, to: u64) -> Result<Vec<Arc<RecordedTxn>>> {
        match &self.history {
            Some(h) => h.range(from, to).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn history_since(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Arc<RecordedTxn>>> {
        match &self.history {
            Some(h) => h.between(since, until).await,
            None => Ok(Vec::new()),
        }
    }

    /// Every recorded revision of `key`, oldest first. Empty when history
    /// recording is disabled.
    pub fn key_timeline(&self, key: &str) -> Vec<RecordedNode> {
        match &self.timeline {
            Some(t) => t
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .node_timeline(key),
            None => Vec::new(),
        }
    }

    /// The graph as it was at `time`: one revision per key that existed then.
    pub fn graph_snapshot_at(&self, time: DateTime<Utc>) -> Vec<RecordedNode> {
        match &self.timeline {
            Some(t) => t
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshot_at(time),
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Engine {
    graph: Graph,
    registry: Arc<DescriptorRegistry>,
    config: Arc<SchedulerConfig>,
    history: Option<Arc<dyn HistoryStore>>,
    timeline: Option<Arc<Mutex<Timeline>>>,
    next_seq: u64,
    started: DateTime<Utc>,
    snapshot_tx: watch::Sender<Arc<GraphSnapshot>>,
    status_tx: broadcast::Sender<ValueStatus>,
    retry_tx: mpsc::WeakSender<Request>,
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Txn {
                    request,
                    options,
                    reply,
                } => {
                    let result = self.process(request, options).await;
                    // The caller may have given up waiting.
                    let _ = reply.send(result);
                }
                Request::Retry { for_txn, attempt } => {
                    let keys = self.retry_keys(for_txn);
                    if keys.is_empty() {
                        debug!(for_txn = for_txn, "nothing left to retry");
                        continue;
                    }
                    let request = TxnRequest::Retry {
                        for_txn,
                        attempt,
                        keys,
                    };
                    if let Err(err) = self.process(request, TxnOptions::default()).await {
                        debug!(
                            for_txn = for_txn,
                            attempt = attempt,
                            error = %err,
                            "retry transaction finished with errors"
                        );
                    }
                }
                Request::DumpLive { prefix, reply } => {
                    let _ = reply.send(self.dump_live(&prefix).await);
                }
            }
        }
        debug!("scheduler engine stopped");
    }

    /// Keys still waiting for the retry scheduled by `for_txn`; keys changed
    /// by a newer transaction are skipped.
    fn retry_keys(&self, for_txn: u64) -> Vec<String> {
        self.graph
            .nodes()
            .filter(|n| {
                n.last_update == for_txn
                    && n.retry
                        .as_ref()
                        .map(|r| r.scheduled && r.failed_in_txn == for_txn)
                        .unwrap_or(false)
            })
            .map(|n| n.key.clone())
            .collect()
    }

    async fn process(
        &mut self,
        request: TxnRequest,
        options: TxnOptions,
    ) -> Result<Arc<RecordedTxn>> {
        let seq_num = self.next_seq;
        self.next_seq += 1;
        let kind = request.kind();
        let span = TxnSpan::new(seq_num, &kind);
        span.instrument(self.transaction(seq_num, kind, request, options))
            .await
    }

    async fn transaction(
        &mut self,
        seq_num: u64,
        kind: TxnKind,
        request: TxnRequest,
        options: TxnOptions,
    ) -> Result<Arc<RecordedTxn>> {
        let start = Utc::now();
        let previous = self.snapshot_tx.borrow().clone();

        let retrieval = match &request {
            TxnRequest::Resync { values, .. } => {
                METRICS.inc_resyncs();
                let descriptors = resync::retrieve_order(&self.registry);
                Some(resync::retrieve(&self.graph, &descriptors, values, &self.config).await)
            }
            _ => None,
        };

        let always_explicit = matches!(kind, TxnKind::Change | TxnKind::Retry { .. });
        let registry = self.registry.clone();
        let mut staging = Staging::new(&mut self.graph, &registry, seq_num, always_explicit);
        match request {
            TxnRequest::Change(txn) => {
                for (key, value) in txn.into_ops() {
                    staging.set_desired(&key, value);
                }
            }
            TxnRequest::Resync { mode, values } => {
                if let Some(retrieval) = &retrieval {
                    resync::stage_resync(&mut staging, &registry, retrieval, mode, values);
                }
            }
            TxnRequest::SbNotification {
                key,
                value,
                metadata,
            } => stage_notification(&mut staging, &registry, &key, value, metadata),
            TxnRequest::Retry { keys, .. } => {
                for key in keys {
                    let removal = staging
                        .graph()
                        .node(&key)
                        .map(|n| n.desired.is_none() && n.origin != ValueOrigin::FromSb)
                        .unwrap_or(false);
                    staging.mark_explicit(&key);
                    if removal {
                        staging.mark_removal(&key);
                    } else {
                        staging.touch(&key);
                    }
                }
            }
        }
        let staged = staging.finish();
        obs::emit_txn_started(seq_num, &kind, staged.values.len());

        let retry_failed = matches!(kind, TxnKind::Resync { .. });
        let mut plan = planner::plan(&mut self.graph, &registry, &staged, retry_failed);
        let ctx = ExecContext {
            registry: &registry,
            config: &self.config,
            options: &options,
            seq_num,
            kind,
        };
        let execution = executor::execute(&mut self.graph, &plan, &ctx).await;

        let mut executed = staged.rejected;
        executed.append(&mut plan.rejected);
        executed.extend(execution.executed);
        let record = Arc::new(RecordedTxn {
            seq_num,
            id: Uuid::new_v4(),
            kind,
            description: options.description.clone(),
            start,
            stop: Utc::now(),
            values: staged.values,
            retrieve_failures: retrieval.map(|r| r.failures).unwrap_or_default(),
            executed,
            cancelled: execution.cancelled,
        });

        let mut changed: BTreeSet<String> = plan.affected;
        changed.extend(staged.touched);
        self.commit(&record, &previous, &changed, &options).await;
        self.schedule_retry(seq_num, &execution.retries);

        if record.cancelled {
            return Err(SchedulerError::Cancelled { seq_num, record });
        }
        let errors = record.errors();
        if errors.is_empty() {
            Ok(record)
        } else {
            Err(TransactionError {
                seq_num,
                errors,
                record,
            }
            .into())
        }
    }

    async fn commit(
        &mut self,
        record: &Arc<RecordedTxn>,
        previous: &GraphSnapshot,
        changed: &BTreeSet<String>,
        options: &TxnOptions,
    ) {
        let limits = &self.config.history;
        let cutoff = (limits.age_limit_minutes > 0)
            .then(|| Utc::now().checked_sub_signed(minutes(limits.age_limit_minutes)))
            .flatten();
        let permanent_until = self
            .started
            .checked_add_signed(minutes(limits.permanent_init_period_minutes))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if let Some(history) = &self.history {
            if let Err(err) = history.append(record.clone()).await {
                warn!(seq_num = record.seq_num, error = %err, "failed to record transaction");
            }
            if let Some(cutoff) = cutoff {
                match history.trim(cutoff, permanent_until).await {
                    Ok(0) => {}
                    Ok(dropped) => debug!(dropped = dropped, "trimmed transaction history"),
                    Err(err) => warn!(error = %err, "failed to trim transaction history"),
                }
            }
        }
        if let Some(timeline) = &self.timeline {
            let mut timeline = timeline.lock().unwrap_or_else(PoisonError::into_inner);
            timeline.record(&self.graph, changed, record.seq_num, record.stop);
            if let Some(cutoff) = cutoff {
                let dropped = timeline.trim(cutoff, permanent_until);
                if dropped > 0 {
                    debug!(dropped = dropped, "trimmed node revisions");
                }
            }
        }

        // Readers see the new snapshot only once its record is queryable.
        self.snapshot_tx.send_replace(Arc::new(GraphSnapshot {
            seq_num: record.seq_num,
            taken_at: Some(record.stop),
            graph: self.graph.clone(),
        }));

        for key in changed {
            let old = previous
                .graph
                .node(key)
                .map(|n| ValueStatus::of(&previous.graph, n));
            let new = self
                .graph
                .node(key)
                .map(|n| ValueStatus::of(&self.graph, n));
            let update = match (old, new) {
                (Some(old), Some(new)) => (!old.same_outcome(&new)).then_some(new),
                (None, Some(new)) => Some(new),
                (Some(old), None) => Some(ValueStatus::removed(
                    key,
                    last_op_of(record, key).unwrap_or(old.last_op),
                    record.seq_num,
                )),
                (None, None) => None,
            };
            if let Some(status) = update {
                // No subscribers is fine.
                let _ = self.status_tx.send(status);
            }
        }

        let failed = record.errors().len();
        METRICS.inc_transactions();
        obs::emit_txn_finished(
            record.seq_num,
            record.duration_ms(),
            record.performed().count(),
            failed,
        );
        if self.config.print_txn_summary || options.verbose {
            info!("transaction summary:\n{record}");
        }
    }

    fn schedule_retry(&self, for_txn: u64, retries: &[(String, u32)]) {
        let Some(attempt) = retries.iter().map(|(_, a)| *a).max() else {
            return;
        };
        let delay = self.config.retry.backoff(attempt);
        let weak = self.retry_tx.clone();
        METRICS.inc_retries();
        obs::emit_retry_scheduled(for_txn, attempt + 1, retries.len(), delay.as_millis() as u64);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx
                    .send(Request::Retry {
                        for_txn,
                        attempt: attempt + 1,
                    })
                    .await;
            }
        });
    }

    async fn dump_live(&self, prefix: &str) -> Result<Vec<DumpedKv>> {
        let mut dumped: BTreeMap<String, DumpedKv> = BTreeMap::new();
        for descriptor in resync::retrieve_order(&self.registry) {
            let own = descriptor.key_prefix();
            if !own.starts_with(prefix) && !prefix.starts_with(own) {
                continue;
            }
            let correlate = resync::correlate_for(&self.graph, descriptor.as_ref(), &[]);
            let retrieved = resync::retrieve_one(descriptor.as_ref(), &correlate, &self.config)
                .await
                .map_err(|source| SchedulerError::Retrieve {
                    descriptor: descriptor.name().to_string(),
                    source,
                })?;
            let correlated: HashMap<String, ValueOrigin> =
                correlate.iter().map(|kv| (kv.key.clone(), kv.origin)).collect();
            match retrieved {
                Some(values) => {
                    for kv in values.iter().filter(|kv| kv.key.starts_with(prefix)) {
                        let origin = resync::resolve_origin(&self.graph, kv, &correlated);
                        dumped.insert(
                            kv.key.clone(),
                            DumpedKv {
                                key: kv.key.clone(),
                                value: kv.value.to_json(),
                                metadata: kv.metadata.as_ref().map(AnyMetadata::to_json),
                                origin,
                            },
                        );
                    }
                }
                None => {
                    for kv in query::dump_cached(&self.graph, prefix) {
                        if descriptor.key_selector(&kv.key) {
                            dumped.insert(kv.key.clone(), kv);
                        }
                    }
                }
            }
        }
        Ok(dumped.into_values().collect())
    }
}

fn stage_notification(
    staging: &mut Staging<'_>,
    registry: &DescriptorRegistry,
    key: &str,
    value: Option<AnyValue>,
    metadata: Option<AnyMetadata>,
) {
    let nb_managed = staging
        .graph()
        .node(key)
        .map(|n| n.desired.is_some() || (n.is_available() && n.origin == ValueOrigin::FromNb))
        .unwrap_or(false);
    if nb_managed {
        warn!(key = %key, "ignoring southbound notification for a value managed by NB");
        return;
    }
    let Some(descriptor) = registry.descriptor_for_key(key) else {
        return;
    };
    let value = value.map(|v| descriptor.normalize(key, &v).unwrap_or(v));
    staging.set_sb_value(key, value, metadata);
}

fn last_op_of(record: &RecordedTxn, key: &str) -> Option<crate::state::TxnOperation> {
    record
        .executed
        .iter()
        .rev()
        .find(|op| op.key == key && !op.noop)
        .map(|op| op.operation)
}

fn minutes(m: u64) -> chrono::Duration {
    let m = i64::try_from(m).unwrap_or(i64::MAX).min(i64::MAX / 60_000);
    chrono::Duration::minutes(m)
}
