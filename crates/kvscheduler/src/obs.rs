//! Structured observability hooks for the transaction lifecycle.
//!
//! This module provides:
//! - Transaction-scoped tracing spans via `TxnSpan`
//! - Emission functions for lifecycle events: start, operation outcome,
//!   retrieve failure, retry scheduling, finish
//!
//! Events are emitted at `info!` level, failures at `warn!`. Verbosity is
//! controlled through `KVS_LOG` or `RUST_LOG` (see
//! [`crate::telemetry::init_tracing`]).

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{info, warn, Instrument};

use crate::state::{TxnOperation, ValueState};
use crate::txn::TxnKind;

/// Transaction-scoped tracing span.
///
/// Synchronous sections enter it through an RAII guard; the asynchronous
/// part of a transaction is instrumented with it, so that the span is never
/// held across an `.await` by a guard.
///
/// ```ignore
/// let span = TxnSpan::new(12, &TxnKind::Change);
/// span.instrument(run_transaction()).await;
/// ```
pub struct TxnSpan {
    span: tracing::Span,
}

impl TxnSpan {
    pub fn new(seq_num: u64, kind: &TxnKind) -> Self {
        Self {
            span: tracing::info_span!("kvs.txn", seq_num = seq_num, kind = %kind),
        }
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    pub fn instrument<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }
}

pub fn emit_txn_started(seq_num: u64, kind: &TxnKind, values: usize) {
    info!(event = "txn.started", seq_num = seq_num, kind = %kind, values = values);
}

/// Emit event: transaction committed.
pub fn emit_txn_finished(seq_num: u64, duration_ms: i64, executed: usize, failed: usize) {
    info!(
        event = "txn.finished",
        seq_num = seq_num,
        duration_ms = duration_ms,
        executed = executed,
        failed = failed,
        success = failed == 0,
    );
}

pub fn emit_op_executed(key: &str, operation: TxnOperation, new_state: ValueState) {
    info!(event = "op.executed", key = %key, operation = %operation, state = %new_state);
}

pub fn emit_op_failed(key: &str, operation: TxnOperation, error: &dyn std::fmt::Display, retriable: bool) {
    warn!(
        event = "op.failed",
        key = %key,
        operation = %operation,
        error = %error,
        retriable = retriable,
    );
}

/// Emit event: a descriptor's Retrieve failed; its keys sit out this resync.
pub fn emit_retrieve_failed(descriptor: &str, error: &dyn std::fmt::Display) {
    warn!(event = "retrieve.failed", descriptor = %descriptor, error = %error);
}

pub fn emit_retry_scheduled(for_txn: u64, attempt: u32, keys: usize, delay_ms: u64) {
    info!(
        event = "retry.scheduled",
        for_txn = for_txn,
        attempt = attempt,
        keys = keys,
        delay_ms = delay_ms,
    );
}
