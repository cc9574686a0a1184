use tracing::{info, warn};

use super::account::ReplicationAccount;
use super::cluster::Cluster;
use super::cluster_set::ClusterSet;
use super::sync_transactions;
use crate::config::{DissolveOptions, SyncTimeout};
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::gtid::consistency::reconcile_view_changes;
use crate::gtid::GtidSet;
use crate::instance::InstanceRef;
use crate::lock::LockMode;
use crate::replication;

/// Tear the whole ClusterSet down.
///
/// Every replication account, the metadata and the ClusterSet channels are
/// removed and every member leaves its group. User data stays. There is no
/// undo: once started, every step runs and failures are collected.
///
/// # Errors
///
/// - [`ErrorCode::PrimaryClusterUnavailable`] without a writable global primary.
/// - [`ErrorCode::ClusterUnreachable`] for an unreachable valid replica unless `force`.
/// - [`ErrorCode::GtidSyncTimeout`] if a replica does not catch up, unless `force`.
pub fn dissolve(ctx: &OperationContext, address: &str, options: &DissolveOptions) -> Result<()> {
    let cluster_set = ClusterSet::open(ctx, address)?;
    ctx.info(format!("Dissolving ClusterSet '{}'...", cluster_set.domain_name()));

    let clusters = cluster_set.connect_all()?;
    let Some((primary_cluster, replicas)) = clusters.split_first() else {
        return Err(Error::new(ErrorCode::MetadataInconsistent, "ClusterSet has no members"));
    };
    let global_primary = primary_cluster
        .primary()
        .map_err(|err| {
            Error::with_cause(
                ErrorCode::PrimaryClusterUnavailable,
                format!("The primary cluster '{}' is not available", primary_cluster.name()),
                err,
            )
        })?
        .clone();
    for replica in replicas.iter().filter(|c| !c.is_invalidated()) {
        if let Err(err) = replica.primary() {
            if !options.force {
                return Err(Error::with_cause(
                    ErrorCode::ClusterUnreachable,
                    format!(
                        "Cluster '{}' is not available, use force to dissolve without it",
                        replica.name()
                    ),
                    err,
                ));
            }
            ctx.warn(format!(
                "Cluster '{}' is not available and will not be cleaned up: {err}",
                replica.name()
            ));
        }
    }

    let _locks = cluster_set.acquire_locks(primary_cluster, &[], LockMode::Exclusive)?;
    let timeout = ctx.settings.sync_timeout(options.timeout_secs);
    sync_replicas(ctx, &global_primary, replicas, timeout, options)?;
    if options.dry_run {
        ctx.info("dryRun finished.");
        return Ok(());
    }

    let mut failures: Vec<String> = Vec::new();
    let mut note = |what: String, err: &Error| {
        warn!(%err, "{what}");
        failures.push(format!("{what}: {err}"));
    };

    ctx.info("Dropping replication accounts...");
    for cluster in replicas {
        let account = ReplicationAccount::of(&cluster.record);
        if let Err(err) = account.drop_from(global_primary.as_ref(), false) {
            note(format!("could not drop account '{}'", account.user), &err);
        }
    }

    ctx.info("Dropping metadata...");
    let dropped = cluster_set
        .writer(&global_primary)
        .and_then(|writer| writer.store().drop_schema());
    if let Err(err) = dropped {
        note(String::from("could not drop the metadata schema"), &err);
    }

    // Let the drops reach the replicas before their channels go away.
    for replica in replicas {
        if let Some(primary) = replica.primary_instance() {
            if let Err(err) = sync_transactions(primary.as_ref(), global_primary.as_ref(), timeout, false) {
                note(format!("cluster '{}' did not catch up", replica.name()), &err);
            }
        }
    }

    for cluster in replicas.iter().chain(std::iter::once(primary_cluster)) {
        let Some(cluster_primary) = cluster.primary_instance() else {
            continue;
        };
        ctx.info(format!("Dissolving cluster '{}'...", cluster.name()));
        let primary_uuid = cluster_primary.uuid().unwrap_or_default();
        for server in cluster.reachable_members(ctx) {
            if let Err(err) = replication::remove_replica(server.as_ref(), false, Some(&primary_uuid)) {
                note(format!("could not stop replication on '{}'", server.address()), &err);
            }
        }
        if !cluster.is_primary_cluster() {
            if let Err(err) = reconcile_cluster(cluster, cluster_primary, &global_primary) {
                note(
                    format!("could not reconcile view changes of '{}'", cluster.name()),
                    &err,
                );
            }
        }
        for server in cluster.reachable_members(ctx) {
            if let Err(err) = server.leave_group() {
                note(format!("'{}' could not leave its group", server.address()), &err);
            }
        }
    }

    if failures.is_empty() {
        info!(cluster_set = %cluster_set.domain_name(), "ClusterSet dissolved");
        ctx.success("The ClusterSet has been dissolved, user data was left intact.");
    } else {
        ctx.warn(format!(
            "The ClusterSet was dissolved, but {} step(s) failed:\n  {}",
            failures.len(),
            failures.join("\n  ")
        ));
    }
    Ok(())
}

fn sync_replicas(
    ctx: &OperationContext,
    global_primary: &InstanceRef,
    replicas: &[Cluster],
    timeout: SyncTimeout,
    options: &DissolveOptions,
) -> Result<()> {
    for replica in replicas.iter().filter(|c| !c.is_invalidated()) {
        let Some(primary) = replica.primary_instance() else {
            continue;
        };
        ctx.info(format!("Waiting for cluster '{}' to synchronize...", replica.name()));
        match sync_transactions(primary.as_ref(), global_primary.as_ref(), timeout, options.dry_run) {
            Ok(()) => {}
            Err(err) if options.force => {
                ctx.warn(format!("Cluster '{}' did not synchronize: {err}", replica.name()));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// The view changes of a replica's group are tagged with its own view-change
/// UUID. Copy them to the global primary while they are still attributable.
fn reconcile_cluster(cluster: &Cluster, cluster_primary: &InstanceRef, global_primary: &InstanceRef) -> Result<()> {
    let Some(uuid) = cluster.view_change_uuid() else {
        return Ok(());
    };
    let executed = GtidSet::from_executed(cluster_primary.as_ref())?;
    let view_changes = executed.get_gtids_from(uuid);
    let missing = view_changes.subtract(&GtidSet::from_executed(global_primary.as_ref())?, global_primary.as_ref())?;
    reconcile_view_changes(global_primary.as_ref(), &missing, false).map(|_| ())
}
