//! Dependency ordering, failure isolation and cycle rejection across whole
//! transactions.

use kvscheduler::fakes::{MockDescriptor, MockPlane};
use kvscheduler::{
    Dependency, DescriptorRegistry, Scheduler, SchedulerConfig, SchedulerError, Txn, TxnOperation,
    TxnOptions, ValueError, ValueState,
};
use serde_json::{json, Value};

fn member_deps(_key: &str, value: &Value) -> Vec<Dependency> {
    value["members"]
        .as_array()
        .map(|members| {
            members
                .iter()
                .filter_map(Value::as_str)
                .map(|m| Dependency::on_key(format!("member-{m}"), format!("iface/{m}")))
                .collect()
        })
        .unwrap_or_default()
}

/// `iface/<name>` and `bd/<name>`; a bridge domain depends on each member
/// interface.
async fn iface_and_bd() -> (Scheduler, MockPlane) {
    let plane = MockPlane::new();
    let mut registry = DescriptorRegistry::new();
    registry
        .register(MockDescriptor::new("iface", "iface/").with_plane(plane.clone()))
        .unwrap();
    registry
        .register(
            MockDescriptor::new("bridge-domain", "bd/")
                .with_plane(plane.clone())
                .with_dependencies(member_deps),
        )
        .unwrap();
    let scheduler = Scheduler::start(registry, SchedulerConfig::default())
        .await
        .unwrap();
    (scheduler, plane)
}

/// Value under `<prefix><name>` depending on the keys listed in `after`.
fn chain_descriptor(plane: &MockPlane) -> MockDescriptor {
    MockDescriptor::new("node", "node/")
        .with_plane(plane.clone())
        .with_dependencies(|_key, value| {
            value["after"]
                .as_array()
                .map(|deps| {
                    deps.iter()
                        .filter_map(Value::as_str)
                        .map(|d| Dependency::on_key(d, format!("node/{d}")))
                        .collect()
                })
                .unwrap_or_default()
        })
}

#[tokio::test]
async fn bridge_domain_waits_for_its_interface() {
    let (scheduler, plane) = iface_and_bd().await;

    let first = scheduler
        .apply(
            Txn::new().put_json("bd/bd1", json!({"members": ["if1"]})),
            TxnOptions::default(),
        )
        .await
        .expect("blocked values are not errors");
    assert_eq!(first.performed().count(), 0);
    let bd = scheduler.status("bd/bd1").unwrap();
    assert_eq!(bd.state, ValueState::Pending);
    assert_eq!(bd.blocked_by, vec!["iface/if1".to_string()]);
    assert!(plane.calls().is_empty());

    let second = scheduler
        .apply(
            Txn::new().put_json("iface/if1", json!({"mtu": 1500})),
            TxnOptions::default(),
        )
        .await
        .unwrap();
    let iface_at = second.position_of("iface/if1", TxnOperation::Create).unwrap();
    let bd_at = second.position_of("bd/bd1", TxnOperation::Create).unwrap();
    assert!(iface_at < bd_at);
    assert_eq!(
        plane.calls_of(TxnOperation::Create),
        vec!["iface/if1", "bd/bd1"]
    );

    assert_eq!(
        scheduler.status("iface/if1").unwrap().state,
        ValueState::Configured
    );
    let bd = scheduler.status("bd/bd1").unwrap();
    assert_eq!(bd.state, ValueState::Configured);
    assert!(bd.blocked_by.is_empty());
    assert!(bd.error.is_none());
}

#[tokio::test]
async fn dependents_are_deleted_before_their_dependency() {
    let (scheduler, plane) = iface_and_bd().await;
    scheduler
        .apply(
            Txn::new()
                .put_json("iface/if1", json!({"mtu": 1500}))
                .put_json("bd/bd1", json!({"members": ["if1"]})),
            TxnOptions::default(),
        )
        .await
        .unwrap();

    let record = scheduler
        .apply(Txn::new().delete("iface/if1"), TxnOptions::default())
        .await
        .unwrap();
    let bd_at = record.position_of("bd/bd1", TxnOperation::Delete).unwrap();
    let iface_at = record.position_of("iface/if1", TxnOperation::Delete).unwrap();
    assert!(bd_at < iface_at);
    assert!(plane.keys().is_empty());

    // Still desired, so it waits for the interface to come back.
    assert!(scheduler.status("iface/if1").is_none());
    let bd = scheduler.status("bd/bd1").unwrap();
    assert_eq!(bd.state, ValueState::Pending);
    assert_eq!(bd.blocked_by, vec!["iface/if1".to_string()]);

    scheduler
        .apply(
            Txn::new().put_json("iface/if1", json!({"mtu": 1500})),
            TxnOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        scheduler.status("bd/bd1").unwrap().state,
        ValueState::Configured
    );
}

#[tokio::test]
async fn failure_does_not_spread_past_its_dependents() {
    let plane = MockPlane::new();
    let mut registry = DescriptorRegistry::new();
    registry
        .register(chain_descriptor(&plane).fail_on("node/c", 1, false))
        .unwrap();
    registry
        .register(MockDescriptor::new("other", "other/").with_plane(plane.clone()))
        .unwrap();
    let scheduler = Scheduler::start(registry, SchedulerConfig::default())
        .await
        .unwrap();

    let err = scheduler
        .apply(
            Txn::new()
                .put_json("node/a", json!({"after": ["b"]}))
                .put_json("node/b", json!({"after": ["c"]}))
                .put_json("node/c", json!({}))
                .put_json("other/x", json!({})),
            TxnOptions::default(),
        )
        .await
        .unwrap_err();

    let SchedulerError::Transaction(failure) = err else {
        panic!("expected a transaction error");
    };
    assert_eq!(failure.errors.len(), 1);
    assert_eq!(failure.errors[0].key, "node/c");
    assert_eq!(failure.errors[0].operation, TxnOperation::Create);

    let c = scheduler.status("node/c").unwrap();
    assert_eq!(c.state, ValueState::Failed);
    assert!(matches!(
        c.error,
        Some(ValueError::Operation {
            retriable: false,
            ..
        })
    ));
    for key in ["node/a", "node/b"] {
        let status = scheduler.status(key).unwrap();
        assert_eq!(status.state, ValueState::Pending, "{key}");
        assert_eq!(status.blocked_by, vec!["node/c".to_string()], "{key}");
    }
    assert_eq!(
        scheduler.status("other/x").unwrap().state,
        ValueState::Configured
    );
    let mut created = plane.calls_of(TxnOperation::Create);
    created.sort();
    assert_eq!(created, vec!["node/c", "other/x"]);

    let failed = scheduler.failed_values("node/");
    assert_eq!(failed.len(), 1);
    let pending = scheduler.pending_values("");
    assert_eq!(pending.len(), 2);
}

#[tokio::test]
async fn cycle_is_rejected_without_side_effects() {
    let plane = MockPlane::new();
    let mut registry = DescriptorRegistry::new();
    registry.register(chain_descriptor(&plane)).unwrap();
    let scheduler = Scheduler::start(registry, SchedulerConfig::default())
        .await
        .unwrap();

    let err = scheduler
        .apply(
            Txn::new()
                .put_json("node/a", json!({"after": ["b"]}))
                .put_json("node/b", json!({"after": ["a"]}))
                .put_json("node/free", json!({})),
            TxnOptions::default(),
        )
        .await
        .unwrap_err();
    let record = err.record().unwrap();
    assert_eq!(record.errors().len(), 2);

    for key in ["node/a", "node/b"] {
        let status = scheduler.status(key).unwrap();
        assert_eq!(status.state, ValueState::Failed, "{key}");
        match status.error {
            Some(ValueError::Cycle { keys }) => {
                assert_eq!(keys, vec!["node/a".to_string(), "node/b".to_string()]);
            }
            other => panic!("expected a cycle error for {key}, got {other:?}"),
        }
    }
    assert_eq!(plane.calls_of(TxnOperation::Create), vec!["node/free"]);
}

async fn scheduler_with_cycle(plane: &MockPlane) -> Scheduler {
    let mut registry = DescriptorRegistry::new();
    registry.register(chain_descriptor(plane)).unwrap();
    let scheduler = Scheduler::start(registry, SchedulerConfig::default())
        .await
        .unwrap();
    scheduler
        .apply(
            Txn::new()
                .put_json("node/a", json!({"after": ["b"]}))
                .put_json("node/b", json!({"after": ["a"]})),
            TxnOptions::default(),
        )
        .await
        .unwrap_err();
    scheduler
}

#[tokio::test]
async fn breaking_a_cycle_applies_both_members() {
    let plane = MockPlane::new();
    let scheduler = scheduler_with_cycle(&plane).await;

    // Only `a` changes; `b` still waits for `a` but is no longer in a cycle.
    let record = scheduler
        .apply(
            Txn::new().put_json("node/a", json!({})),
            TxnOptions::default(),
        )
        .await
        .unwrap();

    let a = record.position_of("node/a", TxnOperation::Create).unwrap();
    let b = record.position_of("node/b", TxnOperation::Create).unwrap();
    assert!(a < b);
    for key in ["node/a", "node/b"] {
        let status = scheduler.status(key).unwrap();
        assert_eq!(status.state, ValueState::Configured, "{key}");
        assert!(status.error.is_none(), "{key}");
    }
}

#[tokio::test]
async fn removing_a_cycle_member_leaves_the_other_blocked() {
    let plane = MockPlane::new();
    let scheduler = scheduler_with_cycle(&plane).await;

    // The outcome of the transaction itself is not what matters here.
    let _ = scheduler
        .apply(Txn::new().delete("node/b"), TxnOptions::default())
        .await;

    assert!(scheduler.status("node/b").is_none());
    let a = scheduler.status("node/a").unwrap();
    assert_eq!(a.state, ValueState::Pending);
    assert_eq!(a.blocked_by, vec!["node/b".to_string()]);
    assert!(matches!(
        a.error,
        Some(ValueError::DependencyBlocked { ref blocked_by }) if blocked_by == &vec!["node/b".to_string()]
    ));
    assert!(plane.calls_of(TxnOperation::Create).is_empty());
}

#[tokio::test]
async fn any_of_dependency_needs_one_candidate() {
    let plane = MockPlane::new();
    let mut registry = DescriptorRegistry::new();
    registry
        .register(MockDescriptor::new("iface", "iface/").with_plane(plane.clone()))
        .unwrap();
    registry
        .register(
            MockDescriptor::new("route", "route/")
                .with_plane(plane.clone())
                .with_dependencies(|_, _| {
                    vec![Dependency::any_of("uplink", vec!["iface/".to_string()])]
                }),
        )
        .unwrap();
    let scheduler = Scheduler::start(registry, SchedulerConfig::default())
        .await
        .unwrap();

    scheduler
        .apply(
            Txn::new().put_json("route/default", json!({"via": "10.0.0.1"})),
            TxnOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        scheduler.status("route/default").unwrap().state,
        ValueState::Pending
    );

    scheduler
        .apply(
            Txn::new().put_json("iface/eth1", json!({})),
            TxnOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        scheduler.status("route/default").unwrap().state,
        ValueState::Configured
    );
}

#[tokio::test]
async fn invalid_and_unimplemented_values_are_reported() {
    let plane = MockPlane::new();
    let mut registry = DescriptorRegistry::new();
    registry
        .register(
            MockDescriptor::new("iface", "iface/")
                .with_plane(plane.clone())
                .with_validate(|_, value| {
                    if value["mtu"].as_u64().unwrap_or(0) > 9000 {
                        Err(kvscheduler::DescriptorError::invalid_value(
                            "mtu above 9000",
                            vec!["mtu".into()],
                        ))
                    } else {
                        Ok(())
                    }
                }),
        )
        .unwrap();
    let scheduler = Scheduler::start(registry, SchedulerConfig::default())
        .await
        .unwrap();

    let err = scheduler
        .apply(
            Txn::new()
                .put_json("iface/if1", json!({"mtu": 9600}))
                .put_json("acl/a1", json!({})),
            TxnOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.record().unwrap().errors().len(), 2);
    assert_eq!(
        scheduler.status("iface/if1").unwrap().state,
        ValueState::Invalid
    );
    assert_eq!(
        scheduler.status("acl/a1").unwrap().state,
        ValueState::Unimplemented
    );
    assert!(plane.calls().is_empty());

    scheduler
        .apply(
            Txn::new().put_json("iface/if1", json!({"mtu": 1500})),
            TxnOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        scheduler.status("iface/if1").unwrap().state,
        ValueState::Configured
    );
}
