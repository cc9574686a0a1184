mod common;

use clusterset_core::gtid::consistency::{check_transaction_set, reconcile_view_changes};
use clusterset_core::{Connector, GtidSet, InstanceRef};
use common::Harness;

const VIEW_CHANGE_UUID: &str = "6b1c8f1e-2d3a-11ef-9a57-0242ac120002";

fn spares(h: &Harness) -> (InstanceRef, InstanceRef) {
    let spares = h.lab.spare_servers();
    let connector = h.lab.connector();
    (
        connector.connect(&spares[0]).expect("reachable"),
        connector.connect(&spares[1]).expect("reachable"),
    )
}

fn executed(server: &InstanceRef) -> GtidSet {
    GtidSet::from_executed(server.as_ref()).expect("readable")
}

#[test]
fn set_algebra_through_the_server() {
    let h = Harness::single(2);
    let (server, _) = spares(&h);
    for _ in 0..5 {
        h.lab.write(&server.address(), "orders").expect("writable");
    }
    let a = executed(&server);
    assert_eq!(a.count().expect("normalized"), 5);

    assert!(a.subtract(&a, server.as_ref()).expect("computed").is_empty());
    assert!(a.contains(&a, server.as_ref()).expect("computed"));

    let uuid = a.sources().into_iter().next().expect("one source").to_string();
    let b = GtidSet::parse(&format!("{uuid}:2-4")).expect("valid");
    let c = GtidSet::parse(&format!("{uuid}:3")).expect("valid");
    assert!(a.contains(&b, server.as_ref()).expect("computed"));
    assert!(b.contains(&c, server.as_ref()).expect("computed"));
    assert!(a.contains(&c, server.as_ref()).expect("computed"));
    assert!(!c.contains(&a, server.as_ref()).expect("computed"));

    let other = GtidSet::parse(&format!("{VIEW_CHANGE_UUID}:1-2")).expect("valid");
    let merged = a.add(&other);
    assert!(!merged.is_normalized());
    let back = merged.subtract(&other, server.as_ref()).expect("computed");
    assert!(back.equals(&a).expect("normalized"));
    let normalized = merged.normalize(server.as_ref()).expect("computed");
    assert_eq!(normalized.count().expect("normalized"), 7);
}

#[test]
fn view_changes_are_not_errant() {
    let h = Harness::single(2);
    let (primary, replica) = spares(&h);
    h.lab.write(&primary.address(), "orders").expect("writable");
    h.lab.write(&primary.address(), "orders").expect("writable");
    replica
        .inject_empty_transaction(&format!("{VIEW_CHANGE_UUID}:1"))
        .expect("writable");
    let foreign = h.lab.write_errant(&replica.address(), "orders").expect("reachable");

    let report = check_transaction_set(
        replica.as_ref(),
        primary.as_ref(),
        &[],
        &[VIEW_CHANGE_UUID.to_string()],
    )
    .expect("compared");
    assert_eq!(report.missing.count().expect("normalized"), 2);
    assert!(report.unrecoverable.is_empty());
    assert_eq!(report.errant.to_string(), foreign);
    assert_eq!(report.missing_view_changes.to_string(), format!("{VIEW_CHANGE_UUID}:1"));
    assert!(!report.is_consistent());

    let report = check_transaction_set(replica.as_ref(), primary.as_ref(), &[], &[]).expect("compared");
    assert_eq!(report.errant.count().expect("normalized"), 2);
    assert!(report.missing_view_changes.is_empty());
}

#[test]
fn purged_missing_transactions_are_unrecoverable() {
    let h = Harness::single(2);
    let (primary, replica) = spares(&h);
    h.lab.write(&primary.address(), "orders").expect("writable");
    h.lab.purge(&primary.address());
    h.lab.write(&primary.address(), "orders").expect("writable");

    let report = check_transaction_set(replica.as_ref(), primary.as_ref(), &[], &[]).expect("compared");
    assert_eq!(report.missing.count().expect("normalized"), 2);
    assert_eq!(report.unrecoverable.count().expect("normalized"), 1);
    assert!(report.is_consistent());
}

#[test]
fn reconciling_view_changes_is_idempotent() {
    let h = Harness::single(2);
    let (primary, _) = spares(&h);
    let gtids = GtidSet::parse(&format!("{VIEW_CHANGE_UUID}:1-3")).expect("valid");
    let before = executed(&primary);

    assert_eq!(reconcile_view_changes(primary.as_ref(), &gtids, true).expect("counted"), 3);
    assert!(executed(&primary).equals(&before).expect("normalized"));

    assert_eq!(reconcile_view_changes(primary.as_ref(), &gtids, false).expect("injected"), 3);
    assert!(executed(&primary).contains(&gtids, primary.as_ref()).expect("computed"));
    assert_eq!(reconcile_view_changes(primary.as_ref(), &gtids, false).expect("nothing left"), 0);
    assert_eq!(reconcile_view_changes(primary.as_ref(), &GtidSet::empty(), false).expect("empty"), 0);
}
