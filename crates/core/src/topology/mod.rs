//! Topology operations.
//!
//! Every mutating operation runs in two phases. Prepare validates and reads,
//! failing fast before anything changes. Execute changes the topology one
//! step at a time, registering the compensation of each step with an
//! [`UndoTracker`]; if a later step fails the stack is unwound and the
//! original error is returned.

pub mod account;
pub mod cluster;
pub mod cluster_set;
mod create;
mod create_replica;
mod dissolve;
mod force_primary;
mod rejoin;
mod remove;
pub mod routing;
mod set_primary;
pub mod status;

use std::time::Duration;

use tracing::{debug, info, warn};

pub use self::cluster::{Cluster, ClusterAvailability};
pub use self::cluster_set::{ClusterSet, PrimaryRef};
pub use self::create::create_cluster_set;
pub use self::create_replica::create_replica_cluster;
pub use self::dissolve::dissolve;
pub use self::force_primary::force_primary_cluster;
pub use self::rejoin::rejoin_cluster;
pub use self::remove::remove_cluster;
pub use self::routing::{list_routers, set_routing_option};
pub use self::set_primary::set_primary_cluster;
pub use self::status::{describe, status};
use crate::config::SyncTimeout;
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::instance::Instance;
use crate::replication::{self, CLUSTER_SET_CHANNEL};
use crate::undo::UndoTracker;

/// Close an operation: cancel the undo stack on success, unwind it on failure.
///
/// The original error is returned either way; revert problems only show up
/// as warnings.
pub(crate) fn finish<T>(ctx: &OperationContext, undo: &mut UndoTracker<'_>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            undo.cancel();
            Ok(value)
        }
        Err(err) => {
            if undo.is_empty() {
                return Err(err);
            }
            warn!(%err, steps = undo.len(), "operation failed, reverting");
            ctx.warn(format!("{err}"));
            ctx.info("Reverting changes...");
            let report = undo.execute(ctx.console.as_ref());
            if report.is_clean() {
                ctx.info("Changes successfully reverted.");
            } else {
                ctx.warn(format!(
                    "{} step(s) could not be reverted: {}",
                    report.failed.len(),
                    report.failed.join(", ")
                ));
            }
            Err(err)
        }
    }
}

/// Names of ClusterSets and clusters: 1 to 63 characters out of
/// alphanumerics, `_`, `-` and `.`, not starting with a digit.
///
/// # Errors
///
/// [`ErrorCode::InvalidOption`] otherwise.
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    let starts_ok = name.chars().next().is_some_and(|c| !c.is_ascii_digit());
    if name.is_empty() || name.len() > 63 || !valid_chars || !starts_ok {
        return Err(Error::new(
            ErrorCode::InvalidOption,
            format!("Invalid {what} name '{name}'"),
        ));
    }
    Ok(())
}

/// Wait until `target` has applied everything `source` has executed.
///
/// # Errors
///
/// [`ErrorCode::GtidSyncTimeout`] when `target` does not catch up in time.
pub(crate) fn sync_transactions(
    target: &dyn Instance,
    source: &dyn Instance,
    timeout: SyncTimeout,
    dry_run: bool,
) -> Result<()> {
    if dry_run || timeout == SyncTimeout::Skip {
        return Ok(());
    }
    let gtids = source.gtid_executed()?;
    wait_for_gtids(target, &gtids, timeout)
}

/// Wait until `target` has applied what its channel already received.
///
/// # Errors
///
/// [`ErrorCode::GtidSyncTimeout`] when the applier does not drain in time.
pub(crate) fn apply_received(target: &dyn Instance, timeout: SyncTimeout, dry_run: bool) -> Result<()> {
    if dry_run || timeout == SyncTimeout::Skip {
        return Ok(());
    }
    let received = target.received_gtid_set(CLUSTER_SET_CHANNEL)?;
    wait_for_gtids(target, &received, timeout)
}

fn wait_for_gtids(target: &dyn Instance, gtids: &str, timeout: SyncTimeout) -> Result<()> {
    let duration = match timeout {
        SyncTimeout::Skip => return Ok(()),
        SyncTimeout::Immediate => Duration::ZERO,
        SyncTimeout::Wait(duration) => duration,
    };
    debug!(target = %target.address(), gtids, ?duration, "waiting for transactions");
    if target.wait_for_executed_gtid_set(gtids, duration)? {
        info!(target = %target.address(), "transactions synchronized");
        Ok(())
    } else {
        Err(Error::new(
            ErrorCode::GtidSyncTimeout,
            format!(
                "Timeout reached waiting for transactions to be applied on '{}' ({}s)",
                target.address(),
                duration.as_secs()
            ),
        ))
    }
}

/// Point every member of `cluster` at `source_address`, the primary last, and
/// move its managed failover source from `from_group` to `to_group`.
pub(crate) fn repoint(
    ctx: &OperationContext,
    cluster: &Cluster,
    source_address: &str,
    from_group: &str,
    to_group: &str,
) -> Result<()> {
    let primary = cluster.primary()?;
    for secondary in cluster.secondaries(ctx) {
        replication::update_replica(secondary.as_ref(), source_address, false, false)?;
    }
    replication::update_replica(primary.as_ref(), source_address, true, false)?;
    primary.delete_managed_failover_source(CLUSTER_SET_CHANNEL, from_group)?;
    primary.add_managed_failover_source(CLUSTER_SET_CHANNEL, to_group, source_address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert!(validate_name("cluster", "myCluster_2").is_ok());
        assert!(validate_name("cluster", "dom.example-1").is_ok());
        for bad in ["", "2fast", "has space", "semi;colon", &"x".repeat(64)] {
            let err = validate_name("cluster", bad).unwrap_err();
            assert_eq!(err.code(), Some(ErrorCode::InvalidOption), "{bad}");
        }
    }
}
