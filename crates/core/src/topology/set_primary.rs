use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashSet;
use tracing::{debug, info, warn};

use super::account::ReplicationAccount;
use super::cluster::Cluster;
use super::cluster_set::ClusterSet;
use super::{apply_received, finish, repoint, sync_transactions};
use crate::config::{SwitchoverOptions, SyncTimeout};
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::gtid::consistency::{check_transaction_set, reconcile_view_changes};
use crate::instance::InstanceRef;
use crate::lock::LockMode;
use crate::metadata::{attr, MemberRecord, Metadata, Value};
use crate::replication::{self, ChannelState, CLUSTER_SET_CHANNEL};
use crate::undo::UndoTracker;

/// Planned switchover: make `cluster_name` the global primary while the
/// current one is healthy, then demote the old primary to a replica.
///
/// # Errors
///
/// - [`ErrorCode::TargetIsPrimary`] or [`ErrorCode::ClusterInvalidated`] for
///   an ineligible target.
/// - [`ErrorCode::PrimaryClusterUnavailable`] when the current primary is not
///   healthy; use [`force_primary_cluster`](super::force_primary_cluster).
/// - [`ErrorCode::ReplicationChannelNotHealthy`] if the target is not
///   replicating.
/// - [`ErrorCode::ClusterUnreachable`] if another replica is unhealthy and
///   was not listed for invalidation.
/// - Data safety errors from the consistency check.
pub fn set_primary_cluster(
    ctx: &OperationContext,
    address: &str,
    cluster_name: &str,
    options: &SwitchoverOptions,
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
            format!("Cluster '{cluster_name}' is invalidated and cannot be promoted, rejoin it first"),
        ));
    }
    ctx.info(format!(
        "Switching the primary cluster of ClusterSet '{}' to '{cluster_name}'...",
        cluster_set.domain_name()
    ));

    let clusters = cluster_set.connect_all()?;
    let Some((old, replicas)) = clusters.split_first() else {
        return Err(Error::new(ErrorCode::MetadataInconsistent, "ClusterSet has no members"));
    };
    let old_primary = old
        .primary()
        .map_err(|err| {
            Error::with_cause(
                ErrorCode::PrimaryClusterUnavailable,
                format!(
                    "The primary cluster '{}' is not available, use force-primary to fail over",
                    old.name()
                ),
                err,
            )
        })?
        .clone();
    let Some(target) = replicas.iter().find(|c| c.name() == cluster_name) else {
        return Err(Error::new(
            ErrorCode::MetadataInconsistent,
            format!("Cluster '{cluster_name}' vanished while connecting"),
        ));
    };
    let target_primary = target.primary()?.clone();
    let old_uuid = old_primary.uuid()?;
    let channel = replication::channel_state(target_primary.as_ref(), Some(&old_uuid));
    if channel != ChannelState::On {
        return Err(Error::new(
            ErrorCode::ReplicationChannelNotHealthy,
            format!("The ClusterSet replication channel of cluster '{cluster_name}' is {channel}"),
        ));
    }

    let invalidate = invalidation_list(&options.invalidate_replica_clusters, replicas, target)?;
    let others: Vec<&Cluster> = replicas
        .iter()
        .filter(|c| c.id() != target.id() && !c.is_invalidated() && !invalidate.contains(c.name()))
        .collect();
    for other in &others {
        let healthy = other.primary().is_ok_and(|p| {
            replication::channel_state(p.as_ref(), Some(&old_uuid)) == ChannelState::On
        });
        if !healthy {
            return Err(Error::new(
                ErrorCode::ClusterUnreachable,
                format!(
                    "Cluster '{}' is not reachable or not replicating, add it to invalidate_replica_clusters to proceed",
                    other.name()
                ),
            ));
        }
    }

    let lockable: Vec<&Cluster> = std::iter::once(old)
        .chain(replicas.iter().filter(|c| c.primary_instance().is_some()))
        .collect();
    let _locks = cluster_set.acquire_locks(old, &lockable, LockMode::Exclusive)?;

    let timeout = ctx.settings.sync_timeout(options.timeout_secs);
    ctx.info(format!("Waiting for '{cluster_name}' to apply received transactions..."));
    apply_received(target_primary.as_ref(), timeout, options.dry_run)?;

    let view_change_uuids = cluster_set.view_change_uuids()?;
    let report = check_transaction_set(
        target_primary.as_ref(),
        old_primary.as_ref(),
        &old.reachable_members(ctx),
        &view_change_uuids,
    )?;
    report.ensure_recoverable(cluster_name, false)?;
    if options.dry_run {
        ctx.info("dryRun finished.");
        return Ok(());
    }
    reconcile_view_changes(old_primary.as_ref(), &report.missing_view_changes, false)?;

    let members: Vec<MemberRecord> = cluster_set.members()?.into_iter().map(|m| m.member).collect();
    let invalidated: Vec<MemberRecord> = members
        .iter()
        .filter(|m| replicas.iter().any(|c| c.id() == m.cluster_id && invalidate.contains(c.name())))
        .cloned()
        .collect();
    let plan = Switchover {
        ctx,
        cluster_set_id: cluster_set.id().to_string(),
        old,
        old_primary: &old_primary,
        target,
        target_primary: &target_primary,
        others: &others,
        members,
        invalidated,
        timeout,
        view_change_uuids,
    };
    let mut undo = UndoTracker::new();
    let result = plan.execute(&cluster_set, &mut undo);
    finish(ctx, &mut undo, result)?;
    drop(undo);

    cluster_set.set_primary(target.id());
    ctx.success(format!(
        "Cluster '{cluster_name}' was promoted to PRIMARY of the clusterset. The PRIMARY instance is '{}'",
        target_primary.address()
    ));
    Ok(())
}

/// The names the caller agreed to invalidate, checked against the members.
fn invalidation_list<'n>(names: &'n [String], replicas: &[Cluster], target: &Cluster) -> Result<HashSet<&'n str>> {
    let mut list = HashSet::new();
    for name in names {
        if name == target.name() || !replicas.iter().any(|c| c.name() == name) {
            return Err(Error::new(
                ErrorCode::InvalidOption,
                format!("Invalid value '{name}' for invalidate_replica_clusters"),
            ));
        }
        list.insert(name.as_str());
    }
    Ok(list)
}

/// Read locks that block user writes on the outgoing primary cluster while
/// the promoted cluster catches up.
struct GlobalReadLocks(Vec<InstanceRef>);

impl GlobalReadLocks {
    fn acquire(ctx: &OperationContext, cluster: &Cluster) -> Result<Self> {
        let mut locks = Self(Vec::new());
        for member in cluster.reachable_members(ctx) {
            let connection = ctx.connect(&member.address())?;
            connection.flush_tables_with_read_lock()?;
            locks.0.push(connection);
        }
        debug!(servers = locks.0.len(), "global read locks acquired");
        Ok(locks)
    }
}

impl Drop for GlobalReadLocks {
    fn drop(&mut self) {
        for connection in self.0.drain(..) {
            if let Err(err) = connection.unlock_tables() {
                warn!(server = %connection.address(), %err, "could not release global read lock");
            }
        }
    }
}

struct Switchover<'a> {
    ctx: &'a OperationContext,
    cluster_set_id: String,
    old: &'a Cluster,
    old_primary: &'a InstanceRef,
    target: &'a Cluster,
    target_primary: &'a InstanceRef,
    others: &'a [&'a Cluster],
    members: Vec<MemberRecord>,
    invalidated: Vec<MemberRecord>,
    timeout: SyncTimeout,
    view_change_uuids: Vec<String>,
}

impl<'a> Switchover<'a> {
    fn execute(&self, cluster_set: &ClusterSet<'_>, undo: &mut UndoTracker<'a>) -> Result<()> {
        let ctx = self.ctx;
        let old_primary = self.old_primary;
        let target_primary = self.target_primary;
        let current_primary = Rc::new(RefCell::new(old_primary.clone()));

        ctx.info(format!("Refreshing replication account of '{}'...", self.old.name()));
        let old_options = cluster_set.channel_options(&self.old.record)?;
        let account = ReplicationAccount::of(&self.old.record);
        let password = account.rotate(
            old_primary.as_ref(),
            old_options.auth_type,
            old_options.cert_issuer.as_deref(),
            false,
        )?;
        ctx.failure_point("switchover.rotate_account")?;

        ctx.info(format!("Synchronizing transaction backlog at '{}'...", target_primary.address()));
        sync_transactions(target_primary.as_ref(), old_primary.as_ref(), self.timeout, false)?;
        let read_locks = GlobalReadLocks::acquire(ctx, self.old)?;
        sync_transactions(target_primary.as_ref(), old_primary.as_ref(), self.timeout, false)?;
        let reverse = check_transaction_set(
            old_primary.as_ref(),
            target_primary.as_ref(),
            &self.target.reachable_members(ctx),
            &self.view_change_uuids,
        )?;
        reverse.ensure_recoverable(self.old.name(), true)?;
        ctx.failure_point("switchover.sync_locks")?;

        ctx.info(format!("Demoting current primary cluster '{}'...", self.old.name()));
        let old_secondaries = self.old.secondaries(ctx);
        {
            let old_secondaries = old_secondaries.clone();
            let old_uuid = old_primary.uuid()?;
            let target_group = self.target.record.group_name.clone();
            undo.add("restore old primary cluster", move || {
                for secondary in &old_secondaries {
                    replication::remove_replica(secondary.as_ref(), false, Some(&old_uuid))?;
                }
                if let Err(err) = old_primary.delete_managed_failover_source(CLUSTER_SET_CHANNEL, &target_group) {
                    debug!(%err, "no managed failover source to delete");
                }
                replication::remove_replica(old_primary.as_ref(), false, None)?;
                replication::configure_member_actions(old_primary.as_ref(), true, false)?;
                replication::unfence_writes(old_primary.as_ref(), false)
            });
        }
        let source = replication::channel_source(
            &target_primary.address(),
            &account.user,
            password.as_deref(),
            &old_options,
        );
        replication::demote_from_primary(
            old_primary.as_ref(),
            &old_secondaries,
            &source,
            Some(&self.target.record.group_name),
            false,
        )?;
        ctx.failure_point("switchover.demote")?;

        ctx.info(format!("Promoting cluster '{}'...", self.target.name()));
        {
            let current_primary = current_primary.clone();
            undo.add("demote promoted cluster", move || {
                *current_primary.borrow_mut() = old_primary.clone();
                replication::fence_writes(target_primary.as_ref(), false)?;
                replication::configure_member_actions(target_primary.as_ref(), false, false)?;
                target_primary.start_replica(CLUSTER_SET_CHANNEL)
            });
        }
        replication::promote_to_primary(
            target_primary.as_ref(),
            &self.target.secondaries(ctx),
            true,
            false,
            Some((ctx.notifier.as_ref(), &self.cluster_set_id)),
        )?;
        *current_primary.borrow_mut() = target_primary.clone();
        drop(read_locks);
        ctx.failure_point("switchover.promote")?;

        ctx.info("Updating metadata...");
        let writer = Metadata::new(ctx.connector.metadata_store(target_primary)?);
        let mut txn = writer.transaction()?;
        txn.switch_primary(&self.members, self.target.id())?;
        for member in &self.invalidated {
            txn.set_invalidated(member, true)?;
        }
        txn.set_cluster_set_attribute(
            &self.cluster_set_id,
            attr::LAST_PRIMARY_CHANGE,
            Some(Value::from("SWITCHOVER")),
        )?;
        txn.set_cluster_set_attribute(
            &self.cluster_set_id,
            attr::LAST_PRIMARY_CHANGE_AT,
            Some(Value::from(chrono::Utc::now().to_rfc3339())),
        )?;
        txn.clear_null_attributes(&self.target.record)?;
        txn.clear_null_attributes(&self.old.record)?;
        let log = txn.commit()?;
        {
            let current_primary = current_primary.clone();
            undo.add_metadata("revert primary switch in metadata", log, move || {
                let server = current_primary.borrow().clone();
                Ok(Metadata::new(ctx.connector.metadata_store(&server)?))
            });
        }
        ctx.failure_point("switchover.metadata")?;

        let new_address = target_primary.address();
        let old_address = old_primary.address();
        for other in self.others {
            ctx.info(format!("Updating replica cluster '{}'...", other.name()));
            let cluster: &'a Cluster = other;
            let old_group = &self.old.record.group_name;
            let new_group = &self.target.record.group_name;
            {
                let old_address = old_address.clone();
                let (old_group, new_group) = (old_group.clone(), new_group.clone());
                undo.add(format!("re-point '{}' back", other.name()), move || {
                    repoint(ctx, cluster, &old_address, &new_group, &old_group)
                });
            }
            repoint(ctx, cluster, &new_address, old_group, new_group)?;
        }
        ctx.failure_point("switchover.repoint")?;

        let target_uuid = target_primary.uuid()?;
        for member in self.target.reachable_members(ctx) {
            replication::remove_replica(member.as_ref(), false, Some(&target_uuid))?;
        }
        info!(primary = %self.target.name(), "switchover complete");
        Ok(())
    }
}
