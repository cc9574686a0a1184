//! The asynchronous channel that links each replica cluster to the global
//! primary, and the Group Replication member actions that go with it.
//!
//! Every mutating function takes `dry_run`: diagnostic reads still happen but
//! nothing is changed.

use std::fmt;

use tracing::{debug, info};

use crate::context::Notifier;
use crate::error::Result;
use crate::instance::{ChannelInfo, Instance, InstanceRef, SourceOptions, ThreadState, VarScope};

/// Name of the ClusterSet channel on every replica cluster member.
pub const CLUSTER_SET_CHANNEL: &str = "clusterset_replication";

/// Turns `super_read_only` off on whoever becomes group primary.
pub const ACTION_DISABLE_SUPER_READ_ONLY: &str = "mysql_disable_super_read_only_if_primary";
/// Starts the failover channels on whoever becomes group primary.
pub const ACTION_START_FAILOVER_CHANNELS: &str = "mysql_start_failover_channels_if_primary";

/// Replica clusters must accept transactions of any size.
pub const TRANSACTION_SIZE_LIMIT: &str = "group_replication_transaction_size_limit";

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Unknown,
    Missing,
    Stopped,
    Connecting,
    On,
    /// Running, but replicating from someone other than the expected source.
    Misconfigured,
    Error,
}

impl ChannelState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Missing => "MISSING",
            Self::Stopped => "STOPPED",
            Self::Connecting => "CONNECTING",
            Self::On => "ON",
            Self::Misconfigured => "MISCONFIGURED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a channel. `expected_source_uuid` is the server UUID the channel
/// should be connected to, when known.
#[must_use]
pub fn classify_channel(info: Option<&ChannelInfo>, expected_source_uuid: Option<&str>) -> ChannelState {
    let Some(info) = info else {
        return ChannelState::Missing;
    };
    if (info.io_error.is_some() && info.io_state != ThreadState::Connecting) || info.sql_error.is_some() {
        return ChannelState::Error;
    }
    match (info.io_state, info.sql_state) {
        (ThreadState::Off, ThreadState::Off) => ChannelState::Stopped,
        (ThreadState::Connecting, _) => ChannelState::Connecting,
        (ThreadState::On, ThreadState::On) => match (expected_source_uuid, info.source_uuid.as_deref()) {
            (Some(expected), Some(actual)) if !expected.eq_ignore_ascii_case(actual) => {
                ChannelState::Misconfigured
            }
            _ => ChannelState::On,
        },
        _ => ChannelState::Error,
    }
}

/// State of the ClusterSet channel on `server`. Unreachable servers are `Unknown`.
#[must_use]
pub fn channel_state(server: &dyn Instance, expected_source_uuid: Option<&str>) -> ChannelState {
    match server.replication_channel(CLUSTER_SET_CHANNEL) {
        Ok(info) => classify_channel(info.as_ref(), expected_source_uuid),
        Err(err) => {
            debug!(server = %server.address(), %err, "channel state unknown");
            ChannelState::Unknown
        }
    }
}

/// Channels other than the ClusterSet and Group Replication ones.
///
/// # Errors
///
/// Server errors.
pub fn foreign_channels(server: &dyn Instance) -> Result<Vec<String>> {
    Ok(server
        .replication_channels()?
        .into_iter()
        .map(|c| c.name)
        .filter(|name| {
            !name.is_empty()
                && name != CLUSTER_SET_CHANNEL
                && !name.starts_with("group_replication_")
        })
        .collect())
}

/// # Errors
///
/// Server errors.
pub fn fence_writes(server: &dyn Instance, dry_run: bool) -> Result<()> {
    debug!(server = %server.address(), "fencing writes");
    if dry_run {
        return Ok(());
    }
    server.set_sysvar("super_read_only", "ON", VarScope::Global)
}

/// # Errors
///
/// Server errors.
pub fn unfence_writes(server: &dyn Instance, dry_run: bool) -> Result<()> {
    debug!(server = %server.address(), "unfencing writes");
    if dry_run {
        return Ok(());
    }
    server.set_sysvar("super_read_only", "OFF", VarScope::Global)
}

/// Member actions of a primary cluster (`as_primary`) or a replica cluster.
///
/// # Errors
///
/// Server errors.
pub fn configure_member_actions(primary: &dyn Instance, as_primary: bool, dry_run: bool) -> Result<()> {
    debug!(server = %primary.address(), as_primary, "configuring member actions");
    if dry_run {
        return Ok(());
    }
    primary.set_member_action(ACTION_DISABLE_SUPER_READ_ONLY, as_primary)?;
    primary.set_member_action(ACTION_START_FAILOVER_CHANNELS, !as_primary)
}

/// Create the ClusterSet channel on `target`, resetting any existing one.
///
/// # Errors
///
/// Server errors.
pub fn create_channel(target: &dyn Instance, source: &SourceOptions, start: bool, dry_run: bool) -> Result<()> {
    info!(
        target = %target.address(),
        source = %format_args!("{}:{}", source.host, source.port),
        start,
        "creating ClusterSet channel"
    );
    if dry_run {
        return Ok(());
    }
    if target.replication_channel(CLUSTER_SET_CHANNEL)?.is_some() {
        target.stop_replica(CLUSTER_SET_CHANNEL)?;
        target.reset_replica_all(CLUSTER_SET_CHANNEL)?;
    }
    target.change_replication_source(CLUSTER_SET_CHANNEL, source)?;
    if start {
        target.start_replica(CLUSTER_SET_CHANNEL)?;
    }
    Ok(())
}

/// Point an existing channel at `source_address`, keeping its credentials and
/// options. Auto-failover and start only when `is_primary`.
///
/// # Errors
///
/// Server errors.
pub fn update_replica(target: &dyn Instance, source_address: &str, is_primary: bool, dry_run: bool) -> Result<()> {
    info!(target = %target.address(), source = source_address, "updating ClusterSet channel source");
    if dry_run {
        return Ok(());
    }
    let mut source = SourceOptions::for_address(source_address);
    source.auto_failover = is_primary;
    target.stop_replica(CLUSTER_SET_CHANNEL)?;
    target.change_replication_source(CLUSTER_SET_CHANNEL, &source)?;
    if is_primary {
        target.start_replica(CLUSTER_SET_CHANNEL)?;
    }
    Ok(())
}

/// Stop and drop the channel. When `instance` is a primary (its UUID matches
/// `primary_uuid`, or always when `primary_uuid` is `None`), hand
/// `super_read_only` management back to Group Replication.
///
/// # Errors
///
/// Server errors.
pub fn remove_replica(instance: &dyn Instance, dry_run: bool, primary_uuid: Option<&str>) -> Result<()> {
    info!(server = %instance.address(), "removing ClusterSet channel");
    if dry_run {
        return Ok(());
    }
    if instance.replication_channel(CLUSTER_SET_CHANNEL)?.is_some() {
        instance.stop_replica(CLUSTER_SET_CHANNEL)?;
        instance.reset_replica_all(CLUSTER_SET_CHANNEL)?;
    }
    let is_primary = match primary_uuid {
        Some(uuid) => instance.uuid()?.eq_ignore_ascii_case(uuid),
        None => true,
    };
    if is_primary {
        instance.set_member_action(ACTION_DISABLE_SUPER_READ_ONLY, true)?;
    }
    Ok(())
}

/// Make a replica cluster the global primary.
///
/// Stops the inbound channel (and drops it everywhere unless
/// `preserve_channel`), lifts the write fence and restores the primary member
/// actions, then tells `notifier`.
///
/// # Errors
///
/// Server errors. Secondaries that cannot be reached are skipped.
pub fn promote_to_primary(
    primary: &dyn Instance,
    secondaries: &[InstanceRef],
    preserve_channel: bool,
    dry_run: bool,
    notify: Option<(&dyn Notifier, &str)>,
) -> Result<()> {
    info!(server = %primary.address(), preserve_channel, "promoting cluster to global primary");
    if dry_run {
        return Ok(());
    }
    if primary.replication_channel(CLUSTER_SET_CHANNEL)?.is_some() {
        primary.stop_replica(CLUSTER_SET_CHANNEL)?;
        if !preserve_channel {
            primary.reset_replica_all(CLUSTER_SET_CHANNEL)?;
        }
    }
    if !preserve_channel {
        for secondary in secondaries {
            if let Err(err) = remove_channel_config(secondary.as_ref()) {
                debug!(server = %secondary.address(), %err, "could not drop channel on secondary");
            }
        }
    }
    unfence_writes(primary, false)?;
    configure_member_actions(primary, true, false)?;
    if let Some((notifier, cluster_set_id)) = notify {
        notifier.primary_changed(cluster_set_id);
    }
    Ok(())
}

fn remove_channel_config(server: &dyn Instance) -> Result<()> {
    if server.replication_channel(CLUSTER_SET_CHANNEL)?.is_some() {
        server.stop_replica(CLUSTER_SET_CHANNEL)?;
        server.reset_replica_all(CLUSTER_SET_CHANNEL)?;
    }
    Ok(())
}

/// Make a cluster replicate from the global primary described by `source`.
///
/// Secondaries are configured first and the primary last, so the channel
/// exists on every member before the primary turns auto-failover on. Every
/// member also lifts its transaction size limit.
///
/// # Errors
///
/// Server errors.
pub fn demote_from_primary(
    primary: &dyn Instance,
    secondaries: &[InstanceRef],
    source: &SourceOptions,
    source_group: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    info!(
        server = %primary.address(),
        source = %format_args!("{}:{}", source.host, source.port),
        "demoting cluster to replica"
    );
    for secondary in secondaries {
        configure_replica_member(secondary.as_ref(), source, false, dry_run)?;
    }
    fence_writes(primary, dry_run)?;
    configure_replica_member(primary, source, true, dry_run)?;
    configure_member_actions(primary, false, dry_run)?;
    if let Some(group) = source_group {
        if !dry_run {
            let address = format!("{}:{}", source.host, source.port);
            primary.add_managed_failover_source(CLUSTER_SET_CHANNEL, group, &address)?;
        }
    }
    Ok(())
}

fn configure_replica_member(server: &dyn Instance, source: &SourceOptions, is_primary: bool, dry_run: bool) -> Result<()> {
    if !dry_run {
        server.set_sysvar(TRANSACTION_SIZE_LIMIT, "0", VarScope::Persist)?;
    }
    let mut source = source.clone();
    source.auto_failover = is_primary;
    create_channel(server, &source, is_primary, dry_run)
}

/// Source of the channel towards `address` with the given account.
#[must_use]
pub fn channel_source(
    address: &str,
    user: &str,
    password: Option<&str>,
    options: &crate::config::AsyncReplicationOptions,
) -> SourceOptions {
    let mut source = SourceOptions::for_address(address);
    source.credentials = Some((user.to_string(), password.map(str::to_string)));
    source.options = options.clone();
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;

    fn info(io: ThreadState, sql: ThreadState) -> ChannelInfo {
        ChannelInfo {
            name: CLUSTER_SET_CHANNEL.into(),
            source_host: "db1".into(),
            source_port: 3306,
            user: "repl".into(),
            source_uuid: Some("AAA".into()),
            io_state: io,
            sql_state: sql,
            io_error: None,
            sql_error: None,
            received_gtid_set: String::new(),
        }
    }

    #[test]
    fn classifies_channels() {
        assert_eq!(classify_channel(None, None), ChannelState::Missing);
        let on = info(ThreadState::On, ThreadState::On);
        assert_eq!(classify_channel(Some(&on), Some("aaa")), ChannelState::On);
        assert_eq!(
            classify_channel(Some(&on), Some("bbb")),
            ChannelState::Misconfigured
        );
        assert_eq!(
            classify_channel(Some(&info(ThreadState::Off, ThreadState::Off)), None),
            ChannelState::Stopped
        );
        let mut connecting = info(ThreadState::Connecting, ThreadState::On);
        connecting.io_error = Some(ServerError::new(2003, "refused"));
        assert_eq!(
            classify_channel(Some(&connecting), None),
            ChannelState::Connecting
        );
        let mut broken = info(ThreadState::Off, ThreadState::On);
        broken.io_error = Some(ServerError::new(1045, "denied"));
        assert_eq!(classify_channel(Some(&broken), None), ChannelState::Error);
    }

    #[test]
    fn dry_run_changes_nothing() {
        let server = crate::instance::tests::RecordingInstance::default();
        let source = channel_source("db1:3306", "repl", Some("pw"), &Default::default());
        demote_from_primary(&server, &[], &source, Some("group"), true).unwrap();
        remove_replica(&server, true, None).unwrap();
        assert!(server.statements().is_empty());
    }

    #[test]
    fn demote_fences_before_configuring_primary() {
        let server = crate::instance::tests::RecordingInstance::default();
        let source = channel_source("db1:3306", "repl", Some("pw"), &Default::default());
        demote_from_primary(&server, &[], &source, None, false).unwrap();
        let statements = server.statements();
        let fence = statements
            .iter()
            .position(|s| s.contains("super_read_only = ON"))
            .unwrap();
        let change = statements
            .iter()
            .position(|s| s.starts_with("CHANGE REPLICATION SOURCE"))
            .unwrap();
        let start = statements
            .iter()
            .position(|s| s.starts_with("START REPLICA"))
            .unwrap();
        assert!(fence < change && change < start);
        assert!(statements
            .iter()
            .any(|s| s.contains("group_replication_enable_member_action('mysql_start_failover_channels_if_primary'")));
    }
}
