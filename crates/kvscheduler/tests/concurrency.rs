//! Serial transactions, bounded parallelism and cancellation.

use std::time::Duration;

use kvscheduler::fakes::{MockDescriptor, MockPlane};
use kvscheduler::{
    CancelToken, DescriptorRegistry, Scheduler, SchedulerConfig, SchedulerError, Txn,
    TxnOperation, TxnOptions, ValueState,
};
use serde_json::json;

async fn slow_scheduler(latency: Duration, parallelism: usize) -> (Scheduler, MockPlane) {
    let plane = MockPlane::new();
    let mut registry = DescriptorRegistry::new();
    registry
        .register(
            MockDescriptor::new("iface", "iface/")
                .with_plane(plane.clone())
                .with_latency(latency),
        )
        .unwrap();
    let config = SchedulerConfig {
        parallelism,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::start(registry, config).await.unwrap();
    (scheduler, plane)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_changes_never_overlap_on_a_key() {
    let (scheduler, plane) = slow_scheduler(Duration::from_millis(5), 4).await;

    let mut handles = Vec::new();
    for mtu in 0..12u64 {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move {
            let txn = if mtu % 4 == 3 {
                Txn::new().delete("iface/if1")
            } else {
                Txn::new().put_json("iface/if1", json!({ "mtu": 1000 + mtu }))
            };
            scheduler.apply(txn, TxnOptions::default()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(plane.max_in_flight_per_key(), 1);
    assert_eq!(scheduler.history_all().await.unwrap().len(), 12);
}

#[tokio::test(start_paused = true)]
async fn operations_in_a_level_run_in_parallel_up_to_the_limit() {
    let (scheduler, plane) = slow_scheduler(Duration::from_millis(10), 3).await;
    let mut txn = Txn::new();
    for i in 0..8 {
        txn = txn.put_json(format!("iface/if{i}"), json!({}));
    }
    scheduler.apply(txn, TxnOptions::default()).await.unwrap();

    assert_eq!(plane.calls_of(TxnOperation::Create).len(), 8);
    assert_eq!(plane.max_in_flight_total(), 3);
    assert_eq!(plane.max_in_flight_per_key(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_operation_times_out() {
    let (scheduler, plane) = slow_scheduler(Duration::from_secs(120), 4).await;
    let err = scheduler
        .apply(
            Txn::new().put_json("iface/if1", json!({})),
            TxnOptions::default().with_retry(false),
        )
        .await
        .unwrap_err();
    let errors = err.record().unwrap().errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].error.is_retriable());
    assert_eq!(
        scheduler.status("iface/if1").unwrap().state,
        ValueState::Failed
    );
    assert_eq!(plane.calls_of(TxnOperation::Create).len(), 1);
    assert!(plane.get("iface/if1").is_none());
}

#[tokio::test]
async fn cancelled_before_dispatch_runs_nothing() {
    let (scheduler, plane) = slow_scheduler(Duration::ZERO, 4).await;
    let token = CancelToken::new();
    token.cancel();

    let err = scheduler
        .apply(
            Txn::new().put_json("iface/if1", json!({})),
            TxnOptions::default().with_cancel(token),
        )
        .await
        .unwrap_err();
    let SchedulerError::Cancelled { record, .. } = err else {
        panic!("expected cancellation");
    };
    assert!(record.cancelled);
    assert_eq!(record.performed().count(), 0);
    assert!(plane.calls().is_empty());
    assert_eq!(
        scheduler.status("iface/if1").unwrap().state,
        ValueState::Pending
    );

    scheduler
        .apply(
            Txn::new().put_json("iface/if1", json!({})),
            TxnOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        scheduler.status("iface/if1").unwrap().state,
        ValueState::Configured
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_lets_dispatched_calls_finish() {
    let (scheduler, plane) = slow_scheduler(Duration::from_millis(50), 1).await;
    let token = CancelToken::new();

    let pending = {
        let scheduler = scheduler.clone();
        let options = TxnOptions::default().with_cancel(token.clone());
        tokio::spawn(async move {
            scheduler
                .apply(
                    Txn::new()
                        .put_json("iface/if1", json!({}))
                        .put_json("iface/if2", json!({}))
                        .put_json("iface/if3", json!({})),
                    options,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let err = pending.await.unwrap().unwrap_err();
    let record = err.record().unwrap();
    assert!(record.cancelled);
    assert_eq!(record.performed().count(), 1);
    assert_eq!(plane.calls().len(), 1);
    assert_eq!(plane.keys(), vec!["iface/if1"]);
    assert_eq!(
        scheduler.status("iface/if1").unwrap().state,
        ValueState::Configured
    );
    for key in ["iface/if2", "iface/if3"] {
        assert_eq!(scheduler.status(key).unwrap().state, ValueState::Pending);
    }
}
