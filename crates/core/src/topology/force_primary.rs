use hashbrown::HashSet;
use tracing::{info, warn};

use super::cluster::{Cluster, ClusterAvailability};
use super::cluster_set::ClusterSet;
use super::{apply_received, finish, repoint};
use crate::config::FailoverOptions;
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::gtid::GtidSet;
use crate::instance::{Instance, InstanceRef};
use crate::lock::LockMode;
use crate::metadata::{attr, MemberRecord, Metadata, Value};
use crate::replication;
use crate::undo::UndoTracker;

/// Unplanned failover: declare `cluster_name` the global primary because the
/// current one is gone.
///
/// The current primary must be unreachable. Replica clusters that cannot be
/// reached must be listed in `invalidate_replica_clusters`. Once the
/// metadata names the new primary there is no way back: the remaining
/// replicas are re-pointed best-effort.
///
/// # Errors
///
/// - [`ErrorCode::PrimaryClusterStillAvailable`] or
///   [`ErrorCode::PrimaryClusterNotUnreachable`] when a less destructive
///   repair applies.
/// - [`ErrorCode::BadargInstanceOutdated`] if another reachable cluster has
///   transactions the candidate lacks.
/// - [`ErrorCode::ClusterUnreachable`] for an unlisted unreachable replica.
pub fn force_primary_cluster(
    ctx: &OperationContext,
    address: &str,
    cluster_name: &str,
    options: &FailoverOptions,
) -> Result<()> {
    let mut cluster_set = ClusterSet::open(ctx, address)?;
    let target_member = cluster_set.member_by_name(cluster_name)?;
    if target_member.member.primary_cluster {
        return Err(Error::new(
            ErrorCode::TargetIsPrimary,
            format!("Cluster '{cluster_name}' is already the primary cluster"),
        ));
    }
    if target_member.member.invalidated {
        return Err(Error::new(
            ErrorCode::ClusterInvalidated,
            format!("Cluster '{cluster_name}' is invalidated and cannot be promoted"),
        ));
    }
    ctx.info(format!(
        "Failing over the primary cluster of ClusterSet '{}' to '{cluster_name}'...",
        cluster_set.domain_name()
    ));

    let clusters = cluster_set.connect_all()?;
    let Some((old, replicas)) = clusters.split_first() else {
        return Err(Error::new(ErrorCode::MetadataInconsistent, "ClusterSet has no members"));
    };
    ensure_primary_lost(old)?;
    let Some(target) = replicas.iter().find(|c| c.name() == cluster_name) else {
        return Err(Error::new(
            ErrorCode::MetadataInconsistent,
            format!("Cluster '{cluster_name}' vanished while connecting"),
        ));
    };
    let target_primary = target.primary()?.clone();

    let mut invalidate: HashSet<&str> = HashSet::new();
    for name in &options.invalidate_replica_clusters {
        if name == cluster_name || !replicas.iter().any(|c| c.name() == name) {
            return Err(Error::new(
                ErrorCode::InvalidOption,
                format!("Invalid value '{name}' for invalidate_replica_clusters"),
            ));
        }
        invalidate.insert(name.as_str());
    }
    let survivors: Vec<&Cluster> = replicas
        .iter()
        .filter(|c| c.id() != target.id() && !c.is_invalidated() && !invalidate.contains(c.name()))
        .collect();
    if let Some(lost) = survivors.iter().find(|c| c.primary().is_err()) {
        return Err(Error::new(
            ErrorCode::ClusterUnreachable,
            format!(
                "Cluster '{}' is not available, add it to invalidate_replica_clusters to proceed",
                lost.name()
            ),
        ));
    }

    let lockable: Vec<&Cluster> = std::iter::once(target).chain(survivors.iter().copied()).collect();
    let _locks = cluster_set.acquire_locks(target, &lockable, LockMode::Exclusive)?;

    let timeout = ctx.settings.sync_timeout(options.timeout_secs);
    ctx.info(format!("Waiting for '{cluster_name}' to apply received transactions..."));
    apply_received(target_primary.as_ref(), timeout, options.dry_run)?;
    let view_change_uuids = cluster_set.view_change_uuids()?;
    ensure_most_recent(target, &target_primary, &survivors, &view_change_uuids)?;
    if options.dry_run {
        ctx.info("dryRun finished.");
        return Ok(());
    }

    let members: Vec<MemberRecord> = cluster_set.members()?.into_iter().map(|m| m.member).collect();
    let to_invalidate: Vec<MemberRecord> = members
        .iter()
        .filter(|m| {
            m.cluster_id == old.id()
                || replicas
                    .iter()
                    .any(|c| c.id() == m.cluster_id && invalidate.contains(c.name()))
        })
        .cloned()
        .collect();

    let mut undo = UndoTracker::new();
    let result = promote(
        ctx,
        cluster_set.id(),
        target,
        &target_primary,
        &members,
        &to_invalidate,
        &mut undo,
    );
    finish(ctx, &mut undo, result)?;
    drop(undo);
    cluster_set.set_primary(target.id());

    let new_address = target_primary.address();
    for survivor in &survivors {
        ctx.info(format!("Updating replica cluster '{}'...", survivor.name()));
        if let Err(err) = repoint(
            ctx,
            survivor,
            &new_address,
            &old.record.group_name,
            &target.record.group_name,
        ) {
            warn!(cluster = %survivor.name(), %err, "could not re-point replica cluster");
            ctx.warn(format!(
                "Could not update replica cluster '{}': {err}. Use rejoin to repair it.",
                survivor.name()
            ));
        }
    }
    let target_uuid = target_primary.uuid()?;
    for member in target.reachable_members(ctx) {
        if let Err(err) = replication::remove_replica(member.as_ref(), false, Some(&target_uuid)) {
            warn!(server = %member.address(), %err, "could not drop stale channel");
        }
    }
    ctx.notifier.primary_changed(cluster_set.id());
    ctx.success(format!(
        "Failover finished successfully, cluster '{cluster_name}' was promoted to PRIMARY."
    ));
    Ok(())
}

/// Failover is lossy: only allow it when nothing less destructive will do.
fn ensure_primary_lost(old: &Cluster) -> Result<()> {
    match old.availability {
        ClusterAvailability::Unreachable => Ok(()),
        availability if availability.is_available() => Err(Error::new(
            ErrorCode::PrimaryClusterStillAvailable,
            format!(
                "The primary cluster '{}' is still available, use set-primary for a switchover",
                old.name()
            ),
        )),
        availability => Err(Error::new(
            ErrorCode::PrimaryClusterNotUnreachable,
            format!(
                "The primary cluster '{}' is reachable but {availability}, restore its quorum or reboot it instead of failing over",
                old.name()
            ),
        )),
    }
}

/// Refuse a candidate that lacks transactions another reachable cluster has.
/// View changes do not count.
fn ensure_most_recent(
    target: &Cluster,
    target_primary: &InstanceRef,
    survivors: &[&Cluster],
    view_change_uuids: &[String],
) -> Result<()> {
    let comparator: &dyn Instance = target_primary.as_ref();
    let target_executed = GtidSet::from_executed(comparator)?;
    for survivor in survivors {
        let Some(primary) = survivor.primary_instance() else {
            continue;
        };
        let executed = GtidSet::from_executed(primary.as_ref())?;
        let mut view_changes = GtidSet::empty();
        for uuid in view_change_uuids {
            view_changes = view_changes.add(&executed.get_gtids_from(uuid));
        }
        let filtered = executed.subtract(&view_changes.normalize(comparator)?, comparator)?;
        let ahead = filtered.subtract(&target_executed, comparator)?;
        if !ahead.is_empty() {
            return Err(Error::new(
                ErrorCode::BadargInstanceOutdated,
                format!(
                    "Cluster '{}' is behind cluster '{}', which has transactions {ahead} it lacks; promote the most up to date cluster instead",
                    target.name(),
                    survivor.name()
                ),
            ));
        }
    }
    Ok(())
}

fn promote<'a>(
    ctx: &'a OperationContext,
    cluster_set_id: &str,
    target: &'a Cluster,
    target_primary: &'a InstanceRef,
    members: &[MemberRecord],
    to_invalidate: &[MemberRecord],
    undo: &mut UndoTracker<'a>,
) -> Result<()> {
    ctx.info(format!("Promoting cluster '{}'...", target.name()));
    undo.add("demote promoted cluster", move || {
        replication::fence_writes(target_primary.as_ref(), false)?;
        replication::configure_member_actions(target_primary.as_ref(), false, false)?;
        target_primary.start_replica(replication::CLUSTER_SET_CHANNEL)
    });
    replication::promote_to_primary(
        target_primary.as_ref(),
        &target.secondaries(ctx),
        true,
        false,
        None,
    )?;
    ctx.failure_point("failover.promote")?;

    ctx.info("Updating metadata...");
    let writer = Metadata::new(ctx.connector.metadata_store(target_primary)?);
    let mut txn = writer.transaction()?;
    txn.switch_primary(members, target.id())?;
    for member in to_invalidate {
        txn.set_invalidated(member, true)?;
    }
    txn.set_cluster_set_attribute(
        cluster_set_id,
        attr::LAST_PRIMARY_CHANGE,
        Some(Value::from("FAILOVER")),
    )?;
    txn.set_cluster_set_attribute(
        cluster_set_id,
        attr::LAST_PRIMARY_CHANGE_AT,
        Some(Value::from(chrono::Utc::now().to_rfc3339())),
    )?;
    let log = txn.commit()?;
    undo.add_metadata("revert failover metadata", log, move || {
        Ok(Metadata::new(ctx.connector.metadata_store(target_primary)?))
    });
    ctx.failure_point("failover.metadata")?;
    info!(primary = %target.name(), "failover committed");
    Ok(())
}
