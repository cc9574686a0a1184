use tracing::info;

use super::account::ReplicationAccount;
use super::cluster_set::ClusterSet;
use super::finish;
use crate::config::RejoinOptions;
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::gtid::consistency::{check_transaction_set, reconcile_view_changes};
use crate::instance::parse_bool;
use crate::lock::LockMode;
use crate::metadata::Metadata;
use crate::replication::{
    self, ChannelState, ACTION_DISABLE_SUPER_READ_ONLY, ACTION_START_FAILOVER_CHANNELS, CLUSTER_SET_CHANNEL,
};
use crate::undo::UndoTracker;

/// Bring an invalidated or no longer replicating replica cluster back into
/// its ClusterSet.
///
/// A cluster that is valid and replicating is left alone.
///
/// # Errors
///
/// - [`ErrorCode::TargetIsPrimary`] for the primary cluster.
/// - [`ErrorCode::PrimaryClusterUnavailable`] without a writable global primary.
/// - Availability errors for the cluster being rejoined.
/// - [`ErrorCode::DataErrantTransactions`] or
///   [`ErrorCode::DataUnrecoverableTransactions`] if it diverged.
pub fn rejoin_cluster(
    ctx: &OperationContext,
    address: &str,
    cluster_name: &str,
    options: &RejoinOptions,
) -> Result<()> {
    let cluster_set = ClusterSet::open(ctx, address)?;
    let member = cluster_set.member_by_name(cluster_name)?;
    if member.member.primary_cluster {
        return Err(Error::new(
            ErrorCode::TargetIsPrimary,
            format!("Cluster '{cluster_name}' is the primary cluster"),
        ));
    }
    let member_record = member.member.clone();

    let primary_cluster = cluster_set.connect_primary()?;
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
    let target = cluster_set.connect_member(member);
    let target_primary = target.primary()?.clone();

    let channel = replication::channel_state(target_primary.as_ref(), Some(&global_primary.uuid()?));
    if !target.is_invalidated() && channel == ChannelState::On {
        ctx.info(format!(
            "Cluster '{cluster_name}' is already part of the ClusterSet and replicating, nothing to do."
        ));
        return Ok(());
    }
    ctx.info(format!(
        "Rejoining cluster '{cluster_name}' to ClusterSet '{}' (channel {channel})...",
        cluster_set.domain_name()
    ));

    let report = check_transaction_set(
        target_primary.as_ref(),
        global_primary.as_ref(),
        &primary_cluster.reachable_members(ctx),
        &cluster_set.view_change_uuids()?,
    )?;
    report.ensure_recoverable(cluster_name, false)?;
    let channel_options = cluster_set.channel_options(&target.record)?;
    if options.dry_run {
        ctx.info("dryRun finished.");
        return Ok(());
    }

    let _locks = cluster_set.acquire_locks(&primary_cluster, &[&primary_cluster, &target], LockMode::Exclusive)?;
    reconcile_view_changes(global_primary.as_ref(), &report.missing_view_changes, false)?;

    let was_fenced = target_primary
        .get_sysvar("super_read_only")?
        .is_some_and(|v| parse_bool(&v));
    let previous_actions = (
        target_primary.member_action_enabled(ACTION_DISABLE_SUPER_READ_ONLY)?,
        target_primary.member_action_enabled(ACTION_START_FAILOVER_CHANNELS)?,
    );
    let secondaries = target.secondaries(ctx);
    let target_uuid = target_primary.uuid()?;
    let source_group = primary_cluster.record.group_name.clone();

    let mut undo = UndoTracker::new();
    let result = (|| -> Result<()> {
        ctx.info("Refreshing replication account...");
        let account = ReplicationAccount::of(&target.record);
        let password = account.rotate(
            global_primary.as_ref(),
            channel_options.auth_type,
            channel_options.cert_issuer.as_deref(),
            false,
        )?;

        ctx.info("Configuring ClusterSet replication channel...");
        {
            let target_primary = &target_primary;
            let secondaries = &secondaries;
            let source_group = &source_group;
            let target_uuid = &target_uuid;
            undo.add("remove rejoined channel", move || {
                for server in secondaries {
                    replication::remove_replica(server.as_ref(), false, Some(target_uuid))?;
                }
                replication::remove_replica(target_primary.as_ref(), false, None)?;
                if let Err(err) = target_primary.delete_managed_failover_source(CLUSTER_SET_CHANNEL, source_group) {
                    tracing::debug!(%err, "no managed failover source to delete");
                }
                target_primary.set_member_action(ACTION_DISABLE_SUPER_READ_ONLY, previous_actions.0)?;
                target_primary.set_member_action(ACTION_START_FAILOVER_CHANNELS, previous_actions.1)?;
                if was_fenced {
                    Ok(())
                } else {
                    replication::unfence_writes(target_primary.as_ref(), false)
                }
            });
        }
        let source = replication::channel_source(
            &global_primary.address(),
            &account.user,
            password.as_deref(),
            &channel_options,
        );
        replication::demote_from_primary(
            target_primary.as_ref(),
            &secondaries,
            &source,
            Some(&source_group),
            false,
        )?;
        ctx.failure_point("rejoin.demote")?;

        ctx.info("Updating metadata...");
        let writer = cluster_set.writer(&global_primary)?;
        let mut txn = writer.transaction()?;
        txn.set_invalidated(&member_record, false)?;
        for (key, value) in account.attributes() {
            if target.record.attribute(key) != Some(&value) {
                txn.set_cluster_attribute(target.id(), key, Some(value))?;
            }
        }
        let log = txn.commit()?;
        {
            let global_primary = &global_primary;
            undo.add_metadata("restore invalidation", log, move || {
                Ok(Metadata::new(ctx.connector.metadata_store(global_primary)?))
            });
        }
        ctx.failure_point("rejoin.metadata")?;
        Ok(())
    })();
    finish(ctx, &mut undo, result)?;

    info!(cluster = %cluster_name, "cluster rejoined");
    ctx.success(format!("Cluster '{cluster_name}' was rejoined to the clusterset"));
    Ok(())
}
