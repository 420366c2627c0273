//! Global atomic counters for scheduler observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on shutdown or from a periodic tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    transactions_processed: AtomicU64,
    operations_executed: AtomicU64,
    operations_failed: AtomicU64,
    retries_scheduled: AtomicU64,
    resyncs: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            transactions_processed: AtomicU64::new(0),
            operations_executed: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        }
    }

    pub fn inc_transactions(&self) {
        self.transactions_processed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "transactions_processed", "counter incremented");
    }

    pub fn inc_operations(&self) {
        self.operations_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "operations_executed", "counter incremented");
    }

    pub fn inc_failures(&self) {
        self.operations_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "operations_failed", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries_scheduled", "counter incremented");
    }

    pub fn inc_resyncs(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "resyncs", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            transactions_processed = self.transactions_processed(),
            operations_executed = self.operations_executed(),
            operations_failed = self.operations_failed(),
            retries_scheduled = self.retries_scheduled(),
            resyncs = self.resyncs(),
        );
    }

    pub fn transactions_processed(&self) -> u64 {
        self.transactions_processed.load(Ordering::Relaxed)
    }

    pub fn operations_executed(&self) -> u64 {
        self.operations_executed.load(Ordering::Relaxed)
    }

    pub fn operations_failed(&self) -> u64 {
        self.operations_failed.load(Ordering::Relaxed)
    }

    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled.load(Ordering::Relaxed)
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.transactions_processed.store(0, Ordering::Relaxed);
        self.operations_executed.store(0, Ordering::Relaxed);
        self.operations_failed.store(0, Ordering::Relaxed);
        self.retries_scheduled.store(0, Ordering::Relaxed);
        self.resyncs.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_transactions();
        m.inc_operations();
        m.inc_operations();
        m.inc_failures();
        m.inc_retries();
        m.inc_resyncs();
        assert_eq!(m.transactions_processed(), 1);
        assert_eq!(m.operations_executed(), 2);
        assert_eq!(m.operations_failed(), 1);
        assert_eq!(m.retries_scheduled(), 1);
        assert_eq!(m.resyncs(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_transactions();
        m.inc_failures();
        m.reset();
        assert_eq!(m.transactions_processed(), 0);
        assert_eq!(m.operations_failed(), 0);
    }
}
