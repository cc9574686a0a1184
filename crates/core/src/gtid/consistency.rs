//! Transaction-set comparison between a candidate and the global primary.
//!
//! Given a candidate replica `R` and a primary `P`:
//!
//! - `missing`: executed at `P`, not at `R`. Replication will catch up.
//! - `unrecoverable`: the part of `missing` already purged by some member of
//!   the primary cluster. It can no longer be streamed.
//! - `errant`: executed at `R`, not at `P`, and not a view change of any
//!   ClusterSet member.
//! - `missing_view_changes`: the view-change part of `R - P`. Harmless, and
//!   injected into `P` so that nobody reports it as errant later.

use tracing::{debug, info};

use super::GtidSet;
use crate::error::{Error, ErrorCode, Result};
use crate::instance::{Instance, InstanceRef};

#[derive(Debug, Clone, Default)]
pub struct TransactionSetReport {
    pub missing: GtidSet,
    pub unrecoverable: GtidSet,
    pub errant: GtidSet,
    pub missing_view_changes: GtidSet,
}

impl TransactionSetReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.errant.is_empty()
    }

    /// Turn the report into a failure according to the policy: errant
    /// transactions always abort, unrecoverable ones unless tolerated.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::DataErrantTransactions`] or
    /// [`ErrorCode::DataUnrecoverableTransactions`].
    pub fn ensure_recoverable(&self, cluster: &str, allow_unrecoverable: bool) -> Result<()> {
        if !self.errant.is_empty() {
            return Err(Error::new(
                ErrorCode::DataErrantTransactions,
                format!(
                    "Cluster '{cluster}' has errant transactions that do not exist in the global primary: {}",
                    self.errant
                ),
            ));
        }
        if !allow_unrecoverable && !self.unrecoverable.is_empty() {
            return Err(Error::new(
                ErrorCode::DataUnrecoverableTransactions,
                format!(
                    "Cluster '{cluster}' is missing transactions that were purged from the primary cluster: {}",
                    self.unrecoverable
                ),
            ));
        }
        Ok(())
    }
}

/// Compare `replica` against `primary`.
///
/// `primary_members` are the reachable members of the primary cluster whose
/// purged sets are consulted; unreachable ones are skipped.
/// `view_change_uuids` are the view-change UUIDs of every ClusterSet member.
///
/// # Errors
///
/// Propagates server errors from `replica` or `primary`.
pub fn check_transaction_set(
    replica: &dyn Instance,
    primary: &dyn Instance,
    primary_members: &[InstanceRef],
    view_change_uuids: &[String],
) -> Result<TransactionSetReport> {
    let primary_executed = GtidSet::from_executed(primary)?;
    let replica_executed = GtidSet::from_executed(replica)?;

    let missing = primary_executed.subtract(&replica_executed, primary)?;

    let mut purged = GtidSet::from_purged(primary)?;
    for member in primary_members {
        match GtidSet::from_purged(member.as_ref()) {
            Ok(set) => purged = purged.add(&set),
            Err(err) => debug!(member = %member.address(), %err, "skipping purged set"),
        }
    }
    let purged = purged.normalize(primary)?;
    let unrecoverable = missing.intersect(&purged, primary)?;

    let extra = replica_executed.subtract(&primary_executed, primary)?;
    let mut view_changes = GtidSet::empty();
    for uuid in view_change_uuids {
        view_changes = view_changes.add(&extra.get_gtids_from(uuid));
    }
    let missing_view_changes = view_changes.normalize(primary)?;
    let errant = extra.subtract(&missing_view_changes, primary)?;

    debug!(
        replica = %replica.address(),
        primary = %primary.address(),
        %missing,
        %unrecoverable,
        %errant,
        %missing_view_changes,
        "compared transaction sets"
    );
    Ok(TransactionSetReport {
        missing,
        unrecoverable,
        errant,
        missing_view_changes,
    })
}

/// Inject the view-change transactions of `gtids` that `primary` lacks as
/// empty transactions. Returns how many were injected.
///
/// Injecting a GTID that is already executed is skipped, so calling this
/// twice is harmless.
///
/// # Errors
///
/// Propagates server errors.
pub fn reconcile_view_changes(primary: &dyn Instance, gtids: &GtidSet, dry_run: bool) -> Result<usize> {
    if gtids.is_empty() {
        return Ok(0);
    }
    let executed = GtidSet::from_executed(primary)?;
    let pending = gtids.subtract(&executed, primary)?;
    if pending.is_empty() {
        return Ok(0);
    }
    info!(primary = %primary.address(), gtids = %pending, "reconciling view change transactions");
    let mut injected = 0;
    for gtid in pending.iter_gtids() {
        if !dry_run {
            primary.inject_empty_transaction(&gtid)?;
        }
        injected += 1;
    }
    Ok(injected)
}
