//! Observability of whole transactions: counters and tracing output.
//!
//! Counters are process-wide and other tests in this binary bump them too,
//! so assertions only look at lower bounds of the deltas.

use kvscheduler::fakes::{MockDescriptor, MockPlane};
use kvscheduler::{
    DescriptorRegistry, Scheduler, SchedulerConfig, Txn, TxnOptions, METRICS,
};
use serde_json::json;
use tracing_test::traced_test;

async fn scheduler(descriptor: MockDescriptor) -> Scheduler {
    let mut registry = DescriptorRegistry::new();
    registry.register(descriptor).unwrap();
    let config = SchedulerConfig {
        print_txn_summary: true,
        ..SchedulerConfig::default()
    };
    Scheduler::start(registry, config).await.unwrap()
}

#[traced_test]
#[tokio::test]
async fn committed_transactions_are_counted() {
    let plane = MockPlane::new();
    let scheduler = scheduler(MockDescriptor::new("iface", "iface/").with_plane(plane)).await;
    let txns = METRICS.transactions_processed();
    let ops = METRICS.operations_executed();

    scheduler
        .apply(
            Txn::new()
                .put_json("iface/if1", json!({}))
                .put_json("iface/if2", json!({})),
            TxnOptions::default().verbose(),
        )
        .await
        .unwrap();

    assert!(METRICS.transactions_processed() >= txns + 1);
    assert!(METRICS.operations_executed() >= ops + 2);
}

#[traced_test]
#[tokio::test]
async fn failures_and_retries_are_counted() {
    let plane = MockPlane::new();
    let scheduler = scheduler(
        MockDescriptor::new("iface", "iface/")
            .with_plane(plane)
            .fail_on("iface/if1", 1, true),
    )
    .await;
    let failures = METRICS.operations_failed();
    let retries = METRICS.retries_scheduled();

    scheduler
        .apply(
            Txn::new().put_json("iface/if1", json!({})),
            TxnOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(METRICS.operations_failed() >= failures + 1);
    assert!(METRICS.retries_scheduled() >= retries + 1);
}

#[traced_test]
#[tokio::test]
async fn resyncs_are_counted() {
    let plane = MockPlane::new();
    let scheduler = scheduler(
        MockDescriptor::new("iface", "iface/")
            .with_plane(plane)
            .with_retrieve(),
    )
    .await;
    let resyncs = METRICS.resyncs();

    scheduler
        .resync_downstream(TxnOptions::default())
        .await
        .unwrap();
    scheduler
        .resync_full(Vec::new(), TxnOptions::default())
        .await
        .unwrap();

    assert!(METRICS.resyncs() >= resyncs + 2);
    // Flushing logs the counters without resetting them.
    METRICS.flush();
    assert!(METRICS.resyncs() >= resyncs + 2);
}
