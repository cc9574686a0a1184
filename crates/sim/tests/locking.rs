mod common;

use std::thread;
use std::time::Duration;

use clusterset_core::lock::{self, LockMode, LockScope, CLUSTER_SET_NAMESPACE};
use clusterset_core::topology;
use clusterset_core::{Connector, ErrorCode, OperationContext, RemoveOptions, Settings, SwitchoverOptions};
use clusterset_sim::world::EventKind;
use common::cluster_set;

fn cluster_set_id(h: &common::Harness, address: &str) -> String {
    h.metadata(address)
        .cluster_sets
        .into_keys()
        .next()
        .expect("one ClusterSet")
}

#[test]
fn busy_cluster_set_lock_fails_the_operation() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    let id = cluster_set_id(&h, &primary);
    let holder = h.lab.connector().connect(&primary).expect("reachable");
    let guard = lock::acquire(&holder, &LockScope::ClusterSet(id), LockMode::Exclusive, Duration::from_secs(1))
        .expect("lock is free");
    assert!(guard.is_held());

    let err = topology::set_primary_cluster(&h.ctx(), &primary, "replica", &SwitchoverOptions::default())
        .expect_err("lock is busy");
    assert_eq!(err.code(), Some(ErrorCode::LockGetFailed));
    h.status(&primary);

    guard.release();
    topology::set_primary_cluster(&h.ctx(), &primary, "replica", &SwitchoverOptions::default())
        .expect("lock is free again");
}

#[test]
fn operation_waits_for_a_short_lived_holder() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    let id = cluster_set_id(&h, &primary);
    let holder = h.lab.connector().connect(&primary).expect("reachable");
    let guard = lock::acquire(&holder, &LockScope::ClusterSet(id), LockMode::Exclusive, Duration::from_secs(1))
        .expect("lock is free");
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        drop(guard);
    });

    topology::set_primary_cluster(&h.ctx(), &primary, "replica", &SwitchoverOptions::default())
        .expect("lock frees up within the timeout");
    releaser.join().expect("releaser finished");
}

#[test]
fn journal_shows_locks_taken_and_released() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    let start = h.lab.events().len();
    topology::set_primary_cluster(&h.ctx(), &primary, "replica", &SwitchoverOptions::default())
        .expect("switchover");

    let events = h.lab.events().split_off(start);
    let acquired = events
        .iter()
        .position(|e| matches!(&e.kind, EventKind::LockAcquired { namespace, .. } if namespace == CLUSTER_SET_NAMESPACE))
        .expect("ClusterSet lock taken");
    let connection = events[acquired].connection;
    assert!(events[acquired + 1..].iter().any(|e| e.connection == connection
        && matches!(&e.kind, EventKind::LocksReleased { namespace } if namespace == CLUSTER_SET_NAMESPACE)));
}

#[test]
fn concurrent_operations_serialize_on_the_cluster_set_lock() {
    let h = cluster_set(&["r2", "r3"]);
    let primary = h.primary("cluster1");
    let ctx = OperationContext::builder()
        .console(h.console.clone())
        .connector(h.lab.connector())
        .settings(Settings::builder().lock_timeout_secs(10).default_sync_timeout_secs(2).build())
        .build();
    let start = h.lab.events().len();

    thread::scope(|s| {
        for name in ["r2", "r3"] {
            let (ctx, primary) = (&ctx, &primary);
            s.spawn(move || {
                topology::remove_cluster(ctx, primary, name, &RemoveOptions::default())
                    .unwrap_or_else(|err| panic!("removing {name}: {err}"));
            });
        }
    });
    assert_eq!(h.metadata(&primary).clusters.len(), 1);

    let mut holder = None;
    let mut taken = 0;
    for event in h.lab.events().split_off(start) {
        match &event.kind {
            EventKind::LockAcquired { namespace, .. } if namespace == CLUSTER_SET_NAMESPACE => {
                assert_eq!(holder, None, "ClusterSet lock taken twice at once");
                holder = Some(event.connection);
                taken += 1;
            }
            EventKind::LocksReleased { namespace } if namespace == CLUSTER_SET_NAMESPACE => {
                if holder == Some(event.connection) {
                    holder = None;
                }
            }
            _ => {}
        }
    }
    assert_eq!(taken, 2);
    assert_eq!(holder, None);
}
