use tracing::info;

use super::account::{option_attributes, ReplicationAccount};
use super::cluster::Cluster;
use super::cluster_set::ClusterSet;
use super::{finish, sync_transactions, validate_name};
use crate::config::{AsyncReplicationOptions, CreateReplicaOptions};
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::gtid::consistency::{check_transaction_set, reconcile_view_changes};
use crate::gtid::GtidSet;
use crate::instance::{GroupSeed, InstanceRef, VarScope};
use crate::lock::LockMode;
use crate::metadata::{Attributes, ClusterRecord, InstanceRecord};
use crate::replication::{self, CLUSTER_SET_CHANNEL};
use crate::undo::UndoTracker;

/// Build a new single-member replica cluster named `name` from the standalone
/// instance at `instance_address`, and attach it to the ClusterSet that
/// `cluster_set_address` belongs to.
///
/// # Errors
///
/// - [`ErrorCode::PrimaryClusterUnavailable`] if the global primary cannot
///   take writes.
/// - [`ErrorCode::ClusterNameInUse`], [`ErrorCode::InstanceUnreachable`],
///   [`ErrorCode::UnsupportedVersion`], [`ErrorCode::InstanceAlreadyInGroup`]
///   or [`ErrorCode::AsyncChannelsConfigured`] for an unusable target.
/// - [`ErrorCode::DataErrantTransactions`] or
///   [`ErrorCode::DataUnrecoverableTransactions`] if the target cannot
///   replicate from the global primary.
pub fn create_replica_cluster(
    ctx: &OperationContext,
    cluster_set_address: &str,
    instance_address: &str,
    name: &str,
    options: &CreateReplicaOptions,
) -> Result<ClusterRecord> {
    validate_name("cluster", name)?;
    let cluster_set = ClusterSet::open(ctx, cluster_set_address)?;
    ctx.info(format!(
        "Setting up replica '{name}' of ClusterSet '{}' on '{instance_address}'...",
        cluster_set.domain_name()
    ));

    let primary_cluster = cluster_set.connect_primary()?;
    let global_primary = primary_cluster
        .primary()
        .map_err(|err| {
            Error::with_cause(
                ErrorCode::PrimaryClusterUnavailable,
                format!(
                    "The primary cluster '{}' is not available",
                    primary_cluster.name()
                ),
                err,
            )
        })?
        .clone();

    let snapshot = cluster_set.metadata().snapshot()?;
    if snapshot.clusters.values().any(|c| c.name == name) {
        return Err(Error::new(
            ErrorCode::ClusterNameInUse,
            format!("A cluster named '{name}' already exists"),
        ));
    }

    let target = ctx.connect(instance_address).map_err(|err| {
        Error::with_cause(
            ErrorCode::InstanceUnreachable,
            format!("Could not connect to '{instance_address}'"),
            err,
        )
    })?;
    check_target(ctx, &cluster_set, &target)?;

    let report = check_transaction_set(
        target.as_ref(),
        global_primary.as_ref(),
        &primary_cluster.reachable_members(ctx),
        &cluster_set.view_change_uuids()?,
    )?;
    report.ensure_recoverable(name, false)?;

    let record = ClusterRecord {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        group_name: uuid::Uuid::new_v4().to_string(),
        view_change_uuid: Some(uuid::Uuid::new_v4().to_string()),
        instances: vec![InstanceRecord {
            address: instance_address.to_string(),
            uuid: target.uuid()?,
        }],
        attributes: option_attributes(&options.replication)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        routing_options: Attributes::new(),
    };
    let channel_options = cluster_set.channel_options(&record)?;
    if options.dry_run {
        ctx.info("dryRun finished.");
        return Ok(record);
    }

    let _locks = cluster_set.acquire_locks(&primary_cluster, &[&primary_cluster], LockMode::Shared)?;
    let mut undo = UndoTracker::new();
    let result = execute(
        ctx,
        &cluster_set,
        &primary_cluster,
        &global_primary,
        &target,
        record,
        &channel_options,
        options,
        &mut undo,
    );
    let record = finish(ctx, &mut undo, result)?;
    ctx.success(format!("Replica cluster '{name}' successfully created."));
    Ok(record)
}

fn check_target(ctx: &OperationContext, cluster_set: &ClusterSet<'_>, target: &InstanceRef) -> Result<()> {
    let address = target.address();
    let minimum = ctx.settings.minimum_version();
    let version = target.version()?;
    if version < minimum {
        return Err(Error::new(
            ErrorCode::UnsupportedVersion,
            format!("Instance '{address}' runs MySQL {version}, ClusterSet requires {minimum} or newer"),
        ));
    }
    if !target.group_members()?.is_empty() || cluster_set.metadata().cluster_of_instance(&address)?.is_some() {
        return Err(Error::new(
            ErrorCode::InstanceAlreadyInGroup,
            format!("Instance '{address}' is already part of an InnoDB Cluster"),
        ));
    }
    let channels = target.replication_channels()?;
    if !channels.is_empty() {
        let names: Vec<_> = channels.into_iter().map(|c| c.name).collect();
        return Err(Error::new(
            ErrorCode::AsyncChannelsConfigured,
            format!(
                "Instance '{address}' has replication channels configured: {}",
                names.join(", ")
            ),
        ));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn execute<'a>(
    ctx: &'a OperationContext,
    cluster_set: &'a ClusterSet<'a>,
    primary_cluster: &Cluster,
    global_primary: &'a InstanceRef,
    target: &'a InstanceRef,
    mut record: ClusterRecord,
    channel_options: &AsyncReplicationOptions,
    options: &CreateReplicaOptions,
    undo: &mut UndoTracker<'a>,
) -> Result<ClusterRecord> {
    ctx.info("Fencing the new cluster against writes...");
    undo.add("unfence target", move || replication::unfence_writes(target.as_ref(), false));
    replication::fence_writes(target.as_ref(), false)?;
    replication::configure_member_actions(target.as_ref(), false, false)?;
    ctx.failure_point("create_replica.fence")?;

    ctx.info(format!("Creating InnoDB Cluster '{}' on '{}'...", record.name, target.address()));
    let seed = GroupSeed {
        group_name: record.group_name.clone(),
        view_change_uuid: record.view_change_uuid.clone().unwrap_or_default(),
    };
    undo.add("leave group", move || {
        target.leave_group()?;
        replication::configure_member_actions(target.as_ref(), true, false)
    });
    target.bootstrap_group(&seed)?;
    target.set_sysvar("skip_replica_start", "ON", VarScope::Persist)?;
    ctx.failure_point("create_replica.bootstrap")?;

    ctx.info("Creating replication account...");
    let account = ReplicationAccount::for_cluster_id(&record.id);
    let password = account.create(
        global_primary.as_ref(),
        channel_options.auth_type,
        channel_options.cert_issuer.as_deref(),
        false,
    )?;
    {
        let account = account.clone();
        undo.add("drop replication account", move || {
            account.drop_from(global_primary.as_ref(), false)
        });
    }
    ctx.failure_point("create_replica.account")?;

    ctx.info("Configuring ClusterSet replication channel...");
    let mut source = replication::channel_source(
        &global_primary.address(),
        &account.user,
        password.as_deref(),
        channel_options,
    );
    source.auto_failover = true;
    undo.add("remove ClusterSet channel", move || {
        replication::remove_replica(target.as_ref(), false, None)
    });
    target.set_sysvar(replication::TRANSACTION_SIZE_LIMIT, "0", VarScope::Persist)?;
    replication::create_channel(target.as_ref(), &source, true, false)?;
    target.add_managed_failover_source(
        CLUSTER_SET_CHANNEL,
        &primary_cluster.record.group_name,
        &global_primary.address(),
    )?;
    ctx.failure_point("create_replica.channel")?;

    ctx.info("Recording metadata...");
    for (key, value) in account.attributes() {
        record.attributes.insert(key.to_string(), value);
    }
    let writer = cluster_set.writer(global_primary)?;
    let mut txn = writer.transaction()?;
    txn.put_cluster(record.clone())?;
    txn.add_member(cluster_set.id(), &record.id, false)?;
    let log = txn.commit()?;
    undo.add_metadata("revert cluster metadata", log, move || {
        cluster_set.writer(global_primary)
    });
    ctx.failure_point("create_replica.metadata")?;

    let view_changes = GtidSet::from_executed(target.as_ref())?
        .get_gtids_from(record.view_change_uuid.as_deref().unwrap_or_default());
    reconcile_view_changes(global_primary.as_ref(), &view_changes, false)?;

    ctx.info("Waiting for the new cluster to catch up with the primary...");
    sync_transactions(
        target.as_ref(),
        global_primary.as_ref(),
        ctx.settings.sync_timeout(options.timeout_secs),
        false,
    )?;
    ctx.failure_point("create_replica.sync")?;

    info!(cluster = %record.name, "replica cluster created");
    Ok(record)
}
