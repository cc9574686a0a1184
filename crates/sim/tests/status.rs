mod common;

use clusterset_core::metadata::routing;
use clusterset_core::metadata::Value;
use clusterset_core::topology::status::{ClusterGlobalStatus, ClusterRole, ClusterSetHealth};
use clusterset_core::topology::{self, ClusterAvailability};
use clusterset_core::ErrorCode;
use clusterset_sim::{ClusterSpec, LabSpec};
use common::{cluster_set, Harness, DOMAIN};

fn with_routers() -> Harness {
    let h = Harness::new(
        &LabSpec::builder()
            .clusters(vec![ClusterSpec::builder()
                .name("cluster1")
                .routers(vec!["app1::r1".to_string(), "app2::r2".to_string()])
                .build()])
            .spare_servers(1)
            .build(),
    );
    h.create();
    h.add_replica("replica");
    h
}

#[test]
fn status_reports_every_cluster() {
    let h = cluster_set(&["replica"]);
    let primary = h.primary("cluster1");
    let status = h.status(&h.primary("replica"));
    assert_eq!(status.domain_name, DOMAIN);
    assert_eq!(status.primary_cluster, "cluster1");
    assert_eq!(status.global_primary_instance.as_deref(), Some(primary.as_str()));
    assert_eq!(status.status, ClusterSetHealth::Healthy);
    assert_eq!(status.clusters.len(), 2);

    let first = status.cluster("cluster1").expect("reported");
    assert_eq!(first.role, ClusterRole::Primary);
    assert_eq!(first.global_status, ClusterGlobalStatus::Ok);
    assert_eq!(first.transaction_set_consistent, Some(true));
    let replica = status.cluster("replica").expect("reported");
    assert_eq!(replica.role, ClusterRole::Replica);
    assert!(replica.errant.is_none());
}

#[test]
fn describe_lists_the_recorded_topology() {
    let h = cluster_set(&["replica"]);
    let description = topology::describe(&h.ctx(), &h.primary("cluster1")).expect("readable");
    assert_eq!(description.domain_name, DOMAIN);
    assert_eq!(description.primary_cluster, "cluster1");
    let first = description.clusters.iter().find(|c| c.name == "cluster1").expect("listed");
    assert_eq!(first.instances.len(), 3);
    assert!(!first.invalidated);
    let replica = description.clusters.iter().find(|c| c.name == "replica").expect("listed");
    assert_eq!(replica.role, ClusterRole::Replica);
    assert_eq!(replica.instances, vec![h.primary("replica")]);
}

#[test]
fn partitioned_replica_is_unknown() {
    let h = cluster_set(&["replica"]);
    h.lab.partition_cluster("replica");
    let status = h.status(&h.primary("cluster1"));
    let replica = status.cluster("replica").expect("still reported");
    assert_eq!(replica.availability, ClusterAvailability::Unreachable);
    assert_eq!(replica.global_status, ClusterGlobalStatus::Unknown);
    assert_eq!(status.status, ClusterSetHealth::Available);

    h.lab.heal_cluster("replica");
    assert_eq!(h.status(&h.primary("cluster1")).status, ClusterSetHealth::Healthy);
}

#[test]
fn first_recorded_member_leaving_its_group_keeps_the_cluster_online() {
    let h = cluster_set(&["replica"]);
    let members = h.lab.addresses_of("cluster1");
    h.lab.stop_group_replication(&members[0]).expect("reachable");
    let elected = h.primary("cluster1");
    assert_ne!(elected, members[0]);

    let status = h.status(&h.primary("replica"));
    let primary = status.cluster("cluster1").expect("reported");
    assert_eq!(primary.availability, ClusterAvailability::SomeUnreachable);
    assert_eq!(primary.global_status, ClusterGlobalStatus::Ok);
    assert_eq!(status.global_primary_instance.as_deref(), Some(elected.as_str()));
    assert_ne!(status.status, ClusterSetHealth::Unavailable);
}

#[test]
fn cluster_with_group_replication_stopped_everywhere_is_offline() {
    let h = cluster_set(&["replica"]);
    let replica = h.primary("replica");
    h.lab.stop_group_replication(&replica).expect("reachable");

    let status = h.status(&h.primary("cluster1"));
    let cluster = status.cluster("replica").expect("reported");
    assert_eq!(cluster.availability, ClusterAvailability::Offline);
    assert_eq!(cluster.global_status, ClusterGlobalStatus::NotOk);
}

#[test]
fn primary_without_quorum_makes_the_set_unavailable() {
    let h = cluster_set(&["replica"]);
    let members = h.lab.addresses_of("cluster1");
    let replica = h.primary("replica");
    h.lab.partition(&members[1]);
    h.lab.partition(&members[2]);

    let status = h.status(&replica);
    let primary = status.cluster("cluster1").expect("reported");
    assert_eq!(primary.availability, ClusterAvailability::NoQuorum);
    assert_eq!(primary.global_status, ClusterGlobalStatus::NotOk);
    assert_eq!(status.status, ClusterSetHealth::Unavailable);
}

#[test]
fn routers_inherit_cluster_set_options() {
    let h = with_routers();
    let primary = h.primary("cluster1");
    let routers = topology::list_routers(&h.ctx(), &primary).expect("readable");
    let names: Vec<&str> = routers.routers.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["app1::r1", "app2::r2"]);
    assert_eq!(
        routers.effective("app1::r1", routing::TARGET_CLUSTER),
        Some(&Value::from(routing::TARGET_PRIMARY))
    );

    topology::set_routing_option(&h.ctx(), &primary, Some("app1::r1"), routing::TARGET_CLUSTER, Some("replica"))
        .expect("router override");
    topology::set_routing_option(
        &h.ctx(),
        &primary,
        None,
        routing::INVALIDATED_CLUSTER_POLICY,
        Some(routing::POLICY_ACCEPT_RO),
    )
    .expect("global option");

    let routers = topology::list_routers(&h.ctx(), &primary).expect("readable");
    assert_eq!(
        routers.effective("app1::r1", routing::TARGET_CLUSTER),
        Some(&Value::from("replica"))
    );
    assert_eq!(
        routers.effective("app2::r2", routing::TARGET_CLUSTER),
        Some(&Value::from(routing::TARGET_PRIMARY))
    );
    assert_eq!(
        routers.effective("app2::r2", routing::INVALIDATED_CLUSTER_POLICY),
        Some(&Value::from(routing::POLICY_ACCEPT_RO))
    );

    topology::set_routing_option(&h.ctx(), &primary, Some("app1::r1"), routing::TARGET_CLUSTER, None)
        .expect("override dropped");
    topology::set_routing_option(&h.ctx(), &primary, None, routing::INVALIDATED_CLUSTER_POLICY, None)
        .expect("back to default");
    let routers = topology::list_routers(&h.ctx(), &primary).expect("readable");
    assert_eq!(
        routers.effective("app1::r1", routing::TARGET_CLUSTER),
        Some(&Value::from(routing::TARGET_PRIMARY))
    );
    assert_eq!(
        routers.effective("app1::r1", routing::INVALIDATED_CLUSTER_POLICY),
        Some(&Value::from(routing::POLICY_DROP_ALL))
    );
}

#[test]
fn routing_options_are_validated() {
    let h = with_routers();
    let primary = h.primary("cluster1");

    let err = topology::set_routing_option(&h.ctx(), &primary, None, "tag:color", Some("red"))
        .expect_err("unknown option");
    assert_eq!(err.code(), Some(ErrorCode::InvalidOption));

    let err = topology::set_routing_option(&h.ctx(), &primary, None, routing::TARGET_CLUSTER, Some("nowhere"))
        .expect_err("unknown cluster");
    assert_eq!(err.code(), Some(ErrorCode::InvalidOption));

    let err = topology::set_routing_option(&h.ctx(), &primary, None, routing::INVALIDATED_CLUSTER_POLICY, Some("maybe"))
        .expect_err("unknown policy");
    assert_eq!(err.code(), Some(ErrorCode::InvalidOption));

    let err = topology::set_routing_option(&h.ctx(), &primary, Some("ghost::r9"), routing::TARGET_CLUSTER, None)
        .expect_err("unknown router");
    assert_eq!(err.code(), Some(ErrorCode::RouterNotFound));
}
