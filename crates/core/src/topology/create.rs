use tracing::{debug, info};

use super::account::{self, ReplicationAccount};
use super::cluster::Cluster;
use super::{finish, validate_name};
use crate::config::{CreateOptions, SslMode};
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::instance::{parse_bool, InstanceRef, VarScope};
use crate::lock::{self, LockMode, LockScope};
use crate::metadata::{routing, ClusterSetRecord, Metadata, Value, SINGLE_PRIMARY_TREE};
use crate::replication::{self, ACTION_DISABLE_SUPER_READ_ONLY, ACTION_START_FAILOVER_CHANNELS};
use crate::undo::UndoTracker;

/// Turn the cluster that `address` belongs to into the primary of a new
/// ClusterSet named `domain_name`.
///
/// # Errors
///
/// Precondition failures before anything changes; any error of the execute
/// phase after the changes made so far were reverted.
pub fn create_cluster_set(
    ctx: &OperationContext,
    address: &str,
    domain_name: &str,
    options: &CreateOptions,
) -> Result<ClusterSetRecord> {
    validate_name("ClusterSet", domain_name)?;
    ctx.info(format!("Creating ClusterSet '{domain_name}'..."));

    let server = ctx.connect(address).map_err(|err| {
        Error::with_cause(
            ErrorCode::InstanceUnreachable,
            format!("Could not connect to '{address}'"),
            err,
        )
    })?;
    let metadata = Metadata::new(ctx.connector.metadata_store(&server)?);
    metadata.check_version(ctx.settings.minimum_metadata_version())?;
    let record = metadata.cluster_of_instance(address)?.ok_or_else(|| {
        Error::new(
            ErrorCode::ClusterNotFound,
            format!("Instance '{address}' is not part of any InnoDB Cluster"),
        )
    })?;
    if let Some(member) = metadata.member(&record.id)? {
        return Err(Error::new(
            ErrorCode::AlreadyInClusterSet,
            format!(
                "Cluster '{}' is already part of ClusterSet '{}'",
                record.name, member.cluster_set_id
            ),
        ));
    }

    let cluster = Cluster::connect(ctx, record, None);
    let primary = cluster.primary()?.clone();
    let view_change_uuid = check_cluster(ctx, &cluster, &primary)?;
    let ssl_mode = resolve_ssl_mode(&primary, options.replication_ssl_mode)?;

    let cluster_set = ClusterSetRecord {
        id: uuid::Uuid::new_v4().to_string(),
        domain_name: domain_name.to_string(),
        topology_type: SINGLE_PRIMARY_TREE.to_string(),
        attributes: account::cluster_set_attributes(
            ssl_mode,
            options.replication_auth_type,
            options.replication_cert_issuer.as_deref(),
        )
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect(),
        routing_options: routing_defaults(&cluster),
    };
    if options.dry_run {
        ctx.info("dryRun finished.");
        return Ok(cluster_set);
    }

    let lock_connection = ctx.connect(&primary.address())?;
    let _lock = lock::acquire(
        &lock_connection,
        &LockScope::Cluster(cluster.id().to_string()),
        LockMode::Exclusive,
        ctx.settings.lock_timeout(),
    )?;

    let mut undo = UndoTracker::new();
    let result = execute(
        ctx,
        &metadata,
        &cluster,
        &primary,
        &cluster_set,
        &view_change_uuid,
        options,
        &mut undo,
    );
    let created = finish(ctx, &mut undo, result)?;
    ctx.success("ClusterSet successfully created. Use create-replica to add replica clusters to it.");
    Ok(created)
}

/// Checks of the seed cluster. Returns its view-change UUID.
fn check_cluster(ctx: &OperationContext, cluster: &Cluster, primary: &InstanceRef) -> Result<String> {
    let single_primary = primary
        .get_sysvar("group_replication_single_primary_mode")?
        .is_some_and(|v| parse_bool(&v));
    if !single_primary {
        return Err(Error::new(
            ErrorCode::UnsupportedTopologyMode,
            format!("Cluster '{}' is not in single-primary mode", cluster.name()),
        ));
    }

    let minimum = ctx.settings.minimum_version();
    for member in cluster.reachable_members(ctx) {
        let version = member.version()?;
        if version < minimum {
            return Err(Error::new(
                ErrorCode::UnsupportedVersion,
                format!(
                    "Instance '{}' runs MySQL {version}, ClusterSet requires {minimum} or newer",
                    member.address()
                ),
            ));
        }
        let channels = replication::foreign_channels(member.as_ref())?;
        if !channels.is_empty() {
            return Err(Error::new(
                ErrorCode::AsyncChannelsConfigured,
                format!(
                    "Instance '{}' has asynchronous replication channels configured: {}",
                    member.address(),
                    channels.join(", ")
                ),
            ));
        }
    }

    let view_change_uuid = primary
        .get_sysvar("group_replication_view_change_uuid")?
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("AUTOMATIC"))
        .ok_or_else(|| {
            Error::new(
                ErrorCode::ViewChangeUuidMissing,
                format!(
                    "group_replication_view_change_uuid is not configured on cluster '{}', set it and restart the cluster",
                    cluster.name()
                ),
            )
        })?;
    debug!(cluster = %cluster.name(), %view_change_uuid, "seed cluster checks passed");
    Ok(view_change_uuid)
}

fn resolve_ssl_mode(primary: &InstanceRef, requested: SslMode) -> Result<SslMode> {
    if requested != SslMode::Auto {
        return Ok(requested);
    }
    let have_ssl = primary
        .get_sysvar("have_ssl")?
        .is_some_and(|v| v.eq_ignore_ascii_case("YES"));
    Ok(if have_ssl {
        SslMode::Required
    } else {
        SslMode::Disabled
    })
}

fn routing_defaults(cluster: &Cluster) -> crate::metadata::Attributes {
    let mut options = cluster.record.routing_options.clone();
    options
        .entry(routing::TARGET_CLUSTER.to_string())
        .or_insert_with(|| Value::from(routing::TARGET_PRIMARY));
    options
        .entry(routing::INVALIDATED_CLUSTER_POLICY.to_string())
        .or_insert_with(|| Value::from(routing::POLICY_DROP_ALL));
    options
}

#[allow(clippy::too_many_arguments)]
fn execute<'a>(
    ctx: &'a OperationContext,
    metadata: &'a Metadata,
    cluster: &'a Cluster,
    primary: &'a InstanceRef,
    cluster_set: &ClusterSetRecord,
    view_change_uuid: &str,
    options: &CreateOptions,
    undo: &mut UndoTracker<'a>,
) -> Result<ClusterSetRecord> {
    ctx.info(format!("Promoting cluster '{}' to ClusterSet primary...", cluster.name()));
    let previous_actions = (
        primary.member_action_enabled(ACTION_DISABLE_SUPER_READ_ONLY)?,
        primary.member_action_enabled(ACTION_START_FAILOVER_CHANNELS)?,
    );
    replication::configure_member_actions(primary.as_ref(), true, false)?;
    undo.add("restore member actions", move || {
        primary.set_member_action(ACTION_DISABLE_SUPER_READ_ONLY, previous_actions.0)?;
        primary.set_member_action(ACTION_START_FAILOVER_CHANNELS, previous_actions.1)
    });
    ctx.failure_point("create.promote")?;

    let previous_skip: Vec<(String, Option<String>)> = cluster.get_sysvar_all(ctx, "skip_replica_start");
    undo.add("restore skip_replica_start", move || {
        for (address, value) in previous_skip {
            let server = ctx.connect(&address)?;
            server.set_sysvar(
                "skip_replica_start",
                value.as_deref().unwrap_or("OFF"),
                VarScope::Persist,
            )?;
        }
        Ok(())
    });
    cluster.set_sysvar_all(ctx, "skip_replica_start", "ON", VarScope::Persist, &[])?;
    ctx.failure_point("create.skip_replica_start")?;

    ctx.info("Creating replication account...");
    let account = ReplicationAccount::for_cluster_id(cluster.id());
    account.create(
        primary.as_ref(),
        options.replication_auth_type,
        options.replication_cert_issuer.as_deref(),
        false,
    )?;
    {
        let account = account.clone();
        undo.add("drop replication account", move || account.drop_from(primary.as_ref(), false));
    }
    ctx.failure_point("create.account")?;

    ctx.info("Recording metadata...");
    let routers = metadata.routers_of_cluster(cluster.id())?;
    let mut txn = metadata.transaction()?;
    txn.create_cluster_set(cluster_set.clone())?;
    txn.add_member(&cluster_set.id, cluster.id(), true)?;
    if cluster.view_change_uuid() != Some(view_change_uuid) {
        let mut record = cluster.record.clone();
        record.view_change_uuid = Some(view_change_uuid.to_string());
        txn.put_cluster(record)?;
    }
    for (key, value) in account.attributes() {
        txn.set_cluster_attribute(cluster.id(), key, Some(value))?;
    }
    txn.migrate_routers(&routers, cluster.id(), &cluster_set.id)?;
    let log = txn.commit()?;
    undo.add_metadata("revert ClusterSet metadata", log, move || Ok(metadata.clone()));
    ctx.failure_point("create.metadata")?;

    info!(cluster_set = %cluster_set.domain_name, cluster = %cluster.name(), "ClusterSet created");
    Ok(cluster_set.clone())
}
