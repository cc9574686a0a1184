use tracing::{info, warn};

use super::account::ReplicationAccount;
use super::cluster::Cluster;
use super::cluster_set::ClusterSet;
use super::{finish, sync_transactions};
use crate::config::{AsyncReplicationOptions, RemoveOptions, SyncTimeout};
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::gtid::GtidSet;
use crate::instance::{Instance, InstanceRef};
use crate::lock::LockMode;
use crate::metadata::{routing, Metadata};
use crate::replication;
use crate::undo::UndoTracker;

/// Detach the replica cluster `cluster_name` from its ClusterSet and dissolve
/// its link to the global primary. Its members leave their group, so the
/// removed servers end up as independent instances.
///
/// # Errors
///
/// - [`ErrorCode::TargetIsPrimary`] for the primary cluster.
/// - [`ErrorCode::RouterTargetConflict`] while a router targets the cluster.
/// - [`ErrorCode::PrimaryClusterUnavailable`] without a writable global primary.
/// - Availability errors for an unreachable target unless `force`.
/// - [`ErrorCode::GtidSyncTimeout`] if the cluster does not catch up, unless `force`.
pub fn remove_cluster(
    ctx: &OperationContext,
    address: &str,
    cluster_name: &str,
    options: &RemoveOptions,
) -> Result<()> {
    let cluster_set = ClusterSet::open(ctx, address)?;
    let member = cluster_set.member_by_name(cluster_name)?;
    if member.member.primary_cluster {
        return Err(Error::new(
            ErrorCode::TargetIsPrimary,
            format!("Cluster '{cluster_name}' is the primary cluster and cannot be removed"),
        ));
    }
    check_router_targets(&cluster_set, cluster_name)?;
    ctx.info(format!(
        "Removing cluster '{cluster_name}' from ClusterSet '{}'...",
        cluster_set.domain_name()
    ));

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
    let target_primary = match target.primary() {
        Ok(primary) => Some(primary.clone()),
        Err(err) if options.force => {
            warn!(cluster = %cluster_name, %err, "removing unavailable cluster");
            ctx.warn(format!(
                "Cluster '{cluster_name}' is not available ({err}), only the ClusterSet side will be cleaned up"
            ));
            None
        }
        Err(err) => return Err(err),
    };
    let channel_options = cluster_set.channel_options(&target.record)?;

    let _locks = cluster_set.acquire_locks(&primary_cluster, &[&primary_cluster, &target], LockMode::Exclusive)?;
    let timeout = if options.force {
        SyncTimeout::Skip
    } else {
        ctx.settings.sync_timeout(options.timeout_secs)
    };
    if options.dry_run {
        if let Some(target_primary) = &target_primary {
            report_lag(ctx, cluster_name, target_primary.as_ref(), global_primary.as_ref())?;
        }
        ctx.info("dryRun finished.");
        return Ok(());
    }
    if let Some(target_primary) = &target_primary {
        ctx.info("Waiting for the cluster to synchronize with the primary...");
        sync_transactions(target_primary.as_ref(), global_primary.as_ref(), timeout, false)?;
    }

    let plan = Removal {
        ctx,
        cluster_set: &cluster_set,
        target: &target,
        target_primary: target_primary.as_ref(),
        global_primary: &global_primary,
        source_group: primary_cluster.record.group_name.clone(),
        channel_options,
        timeout,
    };
    let mut undo = UndoTracker::new();
    let result = plan.execute(&mut undo);
    finish(ctx, &mut undo, result)?;

    if target_primary.is_some() {
        ctx.info(format!("Dissolving the group of cluster '{cluster_name}'..."));
        for server in target.reachable_members(ctx) {
            if let Err(err) = server.leave_group() {
                warn!(server = %server.address(), %err, "member could not leave its group");
                ctx.warn(format!("Instance '{}' could not leave its group: {err}", server.address()));
            }
        }
    }
    ctx.success(format!("The cluster '{cluster_name}' was removed from the ClusterSet."));
    Ok(())
}

/// Warn about transactions of the global primary that `target` has not
/// applied yet, without waiting for them.
fn report_lag(ctx: &OperationContext, cluster_name: &str, target: &dyn Instance, global_primary: &dyn Instance) -> Result<()> {
    let missing = GtidSet::from_executed(global_primary)?.subtract(&GtidSet::from_executed(target)?, global_primary)?;
    if !missing.is_empty() {
        ctx.warn(format!(
            "Cluster '{cluster_name}' has not applied {} transactions of the primary cluster yet",
            missing.count()?
        ));
    }
    Ok(())
}

fn check_router_targets(cluster_set: &ClusterSet<'_>, cluster_name: &str) -> Result<()> {
    let conflict = |owner: String| {
        Error::new(
            ErrorCode::RouterTargetConflict,
            format!(
                "{owner} has cluster '{cluster_name}' as its target_cluster, change it before removing the cluster"
            ),
        )
    };
    let global = cluster_set
        .record()
        .routing_options
        .get(routing::TARGET_CLUSTER)
        .and_then(|v| v.as_str());
    if global == Some(cluster_name) {
        return Err(conflict(String::from("The ClusterSet")));
    }
    for router in cluster_set.metadata().routers_of(cluster_set.id())? {
        if router.option(routing::TARGET_CLUSTER) == Some(cluster_name) {
            return Err(conflict(format!("Router '{}'", router.name)));
        }
    }
    Ok(())
}

struct Removal<'a> {
    ctx: &'a OperationContext,
    cluster_set: &'a ClusterSet<'a>,
    target: &'a Cluster,
    target_primary: Option<&'a InstanceRef>,
    global_primary: &'a InstanceRef,
    source_group: String,
    channel_options: AsyncReplicationOptions,
    timeout: SyncTimeout,
}

impl<'a> Removal<'a> {
    fn execute(&'a self, undo: &mut UndoTracker<'a>) -> Result<()> {
        let ctx = self.ctx;
        let account = ReplicationAccount::of(&self.target.record);

        ctx.info("Removing replication account...");
        account.drop_from(self.global_primary.as_ref(), false)?;
        undo.add("re-add cluster as replica (account)", move || self.readd_as_replica());
        ctx.failure_point("remove.account")?;

        if let Some(target_primary) = self.target_primary {
            if let Err(err) = sync_transactions(
                target_primary.as_ref(),
                self.global_primary.as_ref(),
                self.timeout,
                false,
            ) {
                warn!(%err, "removed cluster did not catch up after dropping its account");
            }
            ctx.info("Stopping ClusterSet replication channel...");
            let primary_uuid = target_primary.uuid()?;
            undo.add("re-add cluster as replica (channel)", move || self.readd_as_replica());
            for server in self.target.reachable_members(ctx) {
                replication::remove_replica(server.as_ref(), false, Some(&primary_uuid))?;
            }
        }
        ctx.failure_point("remove.channel")?;

        ctx.info("Updating metadata...");
        let writer = self.cluster_set.writer(self.global_primary)?;
        let mut txn = writer.transaction()?;
        txn.remove_member(self.target.id())?;
        txn.remove_cluster(self.target.id())?;
        let log = txn.commit()?;
        let global_primary = self.global_primary;
        let connector = &ctx.connector;
        undo.add_metadata("restore cluster metadata", log, move || {
            Ok(Metadata::new(connector.metadata_store(global_primary)?))
        });
        ctx.failure_point("remove.metadata")?;
        info!(cluster = %self.target.name(), "cluster removed from ClusterSet");
        Ok(())
    }

    /// Put the cluster back as a replica: fresh account password, channels on
    /// every member, replica member actions and write fence. Safe to repeat.
    fn readd_as_replica(&self) -> Result<()> {
        let account = ReplicationAccount::of(&self.target.record);
        let password = account.rotate(
            self.global_primary.as_ref(),
            self.channel_options.auth_type,
            self.channel_options.cert_issuer.as_deref(),
            false,
        )?;
        let Some(target_primary) = self.target_primary else {
            return Ok(());
        };
        let source = replication::channel_source(
            &self.global_primary.address(),
            &account.user,
            password.as_deref(),
            &self.channel_options,
        );
        replication::demote_from_primary(
            target_primary.as_ref(),
            &self.target.secondaries(self.ctx),
            &source,
            Some(&self.source_group),
            false,
        )
    }
}
