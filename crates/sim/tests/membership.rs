mod common;

use clusterset_core::metadata::routing;
use clusterset_core::replication::CLUSTER_SET_CHANNEL;
use clusterset_core::topology::status::{ClusterGlobalStatus, ClusterSetHealth};
use clusterset_core::topology;
use clusterset_core::topology::account::ReplicationAccount;
use clusterset_core::lock::CLUSTER_SET_NAMESPACE;
use clusterset_core::{DissolveOptions, ErrorCode, FailoverOptions, RejoinOptions, RemoveOptions};
use clusterset_sim::testing::Level;
use clusterset_sim::world::EventKind;
use clusterset_sim::{ClusterSpec, LabSpec};
use common::{cluster_set, Harness};

#[test]
fn removed_cluster_becomes_standalone() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    let replica = h.primary("replica");
    h.lab.write(&primary, "orders").expect("writable");
    let record = h
        .metadata(&primary)
        .clusters
        .into_values()
        .find(|c| c.name == "replica")
        .expect("recorded");
    let account = ReplicationAccount::of(&record);
    assert!(h.lab.server(&replica).expect("known").data.users.contains_key(&format!("{}@%", account.user)));

    topology::remove_cluster(&h.ctx(), &primary, "replica", &RemoveOptions::default()).expect("removed");

    let metadata = h.metadata(&primary);
    assert!(metadata.clusters.values().all(|c| c.name != "replica"));
    assert_eq!(metadata.members.len(), 1);
    let server = h.lab.server(&replica).expect("known");
    assert!(server.group.is_none());
    assert!(!server.channels.contains_key(CLUSTER_SET_CHANNEL));
    assert_eq!(server.data.tables.get("orders"), Some(&1));
    assert!(!server.data.users.contains_key(&format!("{}@%", account.user)));

    let status = h.status(&primary);
    assert_eq!(status.clusters.len(), 1);
    assert_eq!(status.status, ClusterSetHealth::Healthy);
}

#[test]
fn remove_dry_run_takes_the_locks_but_changes_nothing() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    let replica = h.primary("replica");
    h.lab.write(&primary, "orders").expect("writable");
    let before = h.metadata(&primary);
    let start = h.lab.events().len();

    topology::remove_cluster(&h.ctx(), &primary, "replica", &RemoveOptions::builder().dry_run(true).build())
        .expect("dry run");

    let events = h.lab.events().split_off(start);
    assert!(events.iter().any(
        |e| matches!(&e.kind, EventKind::LockAcquired { namespace, .. } if namespace == CLUSTER_SET_NAMESPACE)
    ));
    assert_eq!(h.metadata(&primary), before);
    let server = h.lab.server(&replica).expect("known");
    assert!(server.group.is_some());
    assert!(server.channels.contains_key(CLUSTER_SET_CHANNEL));
}

#[test]
fn remove_dry_run_reports_a_lagging_cluster() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    h.lab.stop_channel(&h.primary("replica"));
    h.lab.write(&primary, "orders").expect("writable");
    h.lab.write(&primary, "orders").expect("writable");

    topology::remove_cluster(&h.ctx(), &primary, "replica", &RemoveOptions::builder().dry_run(true).build())
        .expect("dry run does not wait");
    assert!(h
        .console
        .at(Level::Warn)
        .iter()
        .any(|line| line.contains("has not applied 2 transactions")));
    assert!(h.metadata(&primary).clusters.values().any(|c| c.name == "replica"));
}

#[test]
fn primary_cluster_cannot_be_removed() {
    let h = cluster_set(&["replica"]);
    let err = topology::remove_cluster(&h.ctx(), &h.primary("cluster1"), "cluster1", &RemoveOptions::default())
        .expect_err("primary");
    assert_eq!(err.code(), Some(ErrorCode::TargetIsPrimary));
}

#[test]
fn unreachable_cluster_is_removed_only_with_force() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    h.lab.partition_cluster("replica");

    let err = topology::remove_cluster(&h.ctx(), &primary, "replica", &RemoveOptions::default())
        .expect_err("unreachable");
    assert_eq!(err.code(), Some(ErrorCode::ClusterUnreachable));

    topology::remove_cluster(&h.ctx(), &primary, "replica", &RemoveOptions::builder().force(true).build())
        .expect("forced");
    assert!(h.metadata(&primary).clusters.values().all(|c| c.name != "replica"));
}

#[test]
fn routers_targeting_a_cluster_block_its_removal() {
    let h = Harness::new(
        &LabSpec::builder()
            .clusters(vec![ClusterSpec::builder()
                .name("cluster1")
                .routers(vec!["app1::r1".to_string()])
                .build()])
            .spare_servers(1)
            .build(),
    );
    h.create();
    h.add_replica("replica");
    let primary = h.primary("cluster1");

    topology::set_routing_option(&h.ctx(), &primary, Some("app1::r1"), routing::TARGET_CLUSTER, Some("replica"))
        .expect("router option set");
    let err = topology::remove_cluster(&h.ctx(), &primary, "replica", &RemoveOptions::default())
        .expect_err("router targets it");
    assert_eq!(err.code(), Some(ErrorCode::RouterTargetConflict));

    topology::set_routing_option(&h.ctx(), &primary, Some("app1::r1"), routing::TARGET_CLUSTER, None)
        .expect("router option cleared");
    topology::remove_cluster(&h.ctx(), &primary, "replica", &RemoveOptions::default()).expect("removed");
}

#[test]
fn rejoin_restarts_a_stopped_channel() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    let replica = h.primary("replica");
    h.lab.stop_channel(&replica);
    h.lab.write(&primary, "orders").expect("writable");
    assert_eq!(
        h.status(&primary).cluster("replica").expect("reported").global_status,
        ClusterGlobalStatus::OkNotReplicating
    );

    topology::rejoin_cluster(&h.ctx(), &primary, "replica", &RejoinOptions::default()).expect("rejoined");
    assert_eq!(h.lab.server(&replica).expect("known").data.tables.get("orders"), Some(&1));
    assert_eq!(h.status(&primary).status, ClusterSetHealth::Healthy);

    topology::rejoin_cluster(&h.ctx(), &primary, "replica", &RejoinOptions::default()).expect("nothing to do");
    assert!(h.console.contains("nothing to do"));
}

#[test]
fn rejoin_brings_back_the_failed_primary() {
    let h = cluster_set(&["replica"]);
    let old = h.primary("cluster1");
    let new = h.primary("replica");
    h.lab.partition_cluster("cluster1");
    topology::force_primary_cluster(&h.ctx(), &new, "replica", &FailoverOptions::default()).expect("failover");
    h.lab.heal_cluster("cluster1");
    h.lab.write(&new, "orders").expect("writable");

    let status = h.status(&new);
    assert_eq!(
        status.cluster("cluster1").expect("reported").global_status,
        ClusterGlobalStatus::Invalidated
    );

    topology::rejoin_cluster(&h.ctx(), &new, "cluster1", &RejoinOptions::default()).expect("rejoined");
    let server = h.lab.server(&old).expect("known");
    assert!(server.super_read_only());
    assert_eq!(server.data.tables.get("orders"), Some(&1));
    let status = h.status(&new);
    assert_eq!(status.status, ClusterSetHealth::Healthy, "{status:?}");
    assert_eq!(status.primary_cluster, "replica");
}

#[test]
fn rejoin_refuses_a_diverged_cluster() {
    let h = cluster_set(&["replica"]);
    let old = h.primary("cluster1");
    let new = h.primary("replica");
    h.lab.partition_cluster("cluster1");
    topology::force_primary_cluster(&h.ctx(), &new, "replica", &FailoverOptions::default()).expect("failover");
    h.lab.heal_cluster("cluster1");
    h.lab.write(&old, "split_brain").expect("old primary still unfenced");

    let err = topology::rejoin_cluster(&h.ctx(), &new, "cluster1", &RejoinOptions::default())
        .expect_err("errant transactions");
    assert_eq!(err.code(), Some(ErrorCode::DataErrantTransactions));
}

#[test]
fn dissolve_leaves_independent_servers() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    let replica = h.primary("replica");
    h.lab.write(&primary, "orders").expect("writable");
    let mut servers = h.lab.addresses_of("cluster1");
    servers.push(replica);

    topology::dissolve(&h.ctx(), &primary, &DissolveOptions::default()).expect("dissolved");

    for address in &servers {
        let server = h.lab.server(address).expect("known");
        assert!(server.data.metadata.is_none(), "{address}");
        assert!(server.group.is_none(), "{address}");
        assert!(server.channels.is_empty(), "{address}");
        assert_eq!(server.data.tables.get("orders"), Some(&1), "{address}");
    }
    assert!(h.lab.metadata(&primary).is_none());
    assert!(h.console.at(Level::Success).iter().any(|l| l.contains("dissolved")));
}

#[test]
fn dissolve_needs_force_for_unreachable_replicas() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    h.lab.partition_cluster("replica");

    let err = topology::dissolve(&h.ctx(), &primary, &DissolveOptions::default()).expect_err("unreachable");
    assert_eq!(err.code(), Some(ErrorCode::ClusterUnreachable));

    topology::dissolve(&h.ctx(), &primary, &DissolveOptions::builder().force(true).build()).expect("forced");
    assert!(h.lab.metadata(&primary).is_none());
}
