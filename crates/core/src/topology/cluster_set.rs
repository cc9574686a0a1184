//! A ClusterSet as seen from one of its members.

use tracing::{debug, info};

use super::account;
use super::cluster::Cluster;
use crate::config::AsyncReplicationOptions;
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::instance::InstanceRef;
use crate::lock::{self, LockMode, LockScope, LockSet};
use crate::metadata::{ClusterRecord, ClusterSetRecord, MemberCluster, Metadata};

/// Which cluster is the global primary, as last resolved.
///
/// Every change bumps `generation`, so a stale copy is detectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryRef {
    pub cluster_id: String,
    pub generation: u64,
}

pub struct ClusterSet<'c> {
    ctx: &'c OperationContext,
    metadata: Metadata,
    record: ClusterSetRecord,
    primary: PrimaryRef,
}

impl<'c> ClusterSet<'c> {
    /// Open the ClusterSet that the instance at `address` belongs to.
    ///
    /// # Errors
    ///
    /// - [`ErrorCode::InstanceUnreachable`] if `address` does not answer.
    /// - [`ErrorCode::ClusterNotFound`] if it is not part of a managed cluster.
    /// - [`ErrorCode::ClusterSetNotFound`] if its cluster is standalone.
    /// - [`ErrorCode::MetadataInconsistent`] unless exactly one member is primary.
    pub fn open(ctx: &'c OperationContext, address: &str) -> Result<Self> {
        let server = ctx.connect(address).map_err(|err| {
            Error::with_cause(
                ErrorCode::InstanceUnreachable,
                format!("Could not connect to '{address}'"),
                err,
            )
        })?;
        let metadata = Metadata::new(ctx.connector.metadata_store(&server)?);
        metadata.check_version(ctx.settings.minimum_metadata_version())?;
        let cluster = metadata.cluster_of_instance(address)?.ok_or_else(|| {
            Error::new(
                ErrorCode::ClusterNotFound,
                format!("Instance '{address}' is not part of any InnoDB Cluster"),
            )
        })?;
        let member = metadata.member(&cluster.id)?.ok_or_else(|| {
            Error::new(
                ErrorCode::ClusterSetNotFound,
                format!("Cluster '{}' is not part of a ClusterSet", cluster.name),
            )
        })?;
        let record = metadata.cluster_set(&member.cluster_set_id)?;
        let primaries: Vec<_> = metadata
            .members_of(&record.id)?
            .into_iter()
            .filter(|m| m.member.primary_cluster && !m.member.invalidated)
            .collect();
        let [primary] = primaries.as_slice() else {
            return Err(Error::new(
                ErrorCode::MetadataInconsistent,
                format!(
                    "ClusterSet '{}' has {} primary clusters in the metadata",
                    record.domain_name,
                    primaries.len()
                ),
            ));
        };
        debug!(cluster_set = %record.domain_name, primary = %primary.cluster.name, "opened ClusterSet");
        let primary = PrimaryRef {
            cluster_id: primary.cluster.id.clone(),
            generation: 0,
        };
        Ok(Self {
            ctx,
            metadata,
            record,
            primary,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.record.id
    }

    #[must_use]
    pub fn domain_name(&self) -> &str {
        &self.record.domain_name
    }

    #[must_use]
    pub const fn record(&self) -> &ClusterSetRecord {
        &self.record
    }

    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[must_use]
    pub const fn ctx(&self) -> &'c OperationContext {
        self.ctx
    }

    #[must_use]
    pub const fn primary_ref(&self) -> &PrimaryRef {
        &self.primary
    }

    /// Record that `cluster_id` is now the global primary.
    pub fn set_primary(&mut self, cluster_id: &str) {
        self.primary = PrimaryRef {
            cluster_id: cluster_id.to_string(),
            generation: self.primary.generation + 1,
        };
        info!(cluster_id, generation = self.primary.generation, "global primary reference updated");
    }

    /// Current members, primary first.
    ///
    /// # Errors
    ///
    /// Metadata errors.
    pub fn members(&self) -> Result<Vec<MemberCluster>> {
        self.metadata.members_of(&self.record.id)
    }

    /// # Errors
    ///
    /// [`ErrorCode::ClusterNotFound`] if no member has that name.
    pub fn member_by_name(&self, name: &str) -> Result<MemberCluster> {
        self.members()?
            .into_iter()
            .find(|m| m.cluster.name == name)
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::ClusterNotFound,
                    format!(
                        "Cluster '{name}' is not part of ClusterSet '{}'",
                        self.record.domain_name
                    ),
                )
            })
    }

    #[must_use]
    pub fn connect_member(&self, member: MemberCluster) -> Cluster {
        Cluster::connect(self.ctx, member.cluster, Some(member.member))
    }

    /// The cluster [`primary_ref`](Self::primary_ref) points at.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::MetadataInconsistent`] if the metadata no longer knows it.
    pub fn connect_primary(&self) -> Result<Cluster> {
        let member = self
            .members()?
            .into_iter()
            .find(|m| m.cluster.id == self.primary.cluster_id)
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::MetadataInconsistent,
                    format!("Primary cluster '{}' is missing from the metadata", self.primary.cluster_id),
                )
            })?;
        Ok(self.connect_member(member))
    }

    /// Every member, the primary first.
    ///
    /// # Errors
    ///
    /// Metadata errors.
    pub fn connect_all(&self) -> Result<Vec<Cluster>> {
        let mut members = self.members()?;
        members.sort_by_key(|m| m.cluster.id != self.primary.cluster_id);
        Ok(members.into_iter().map(|m| self.connect_member(m)).collect())
    }

    /// View-change UUIDs of every member cluster.
    ///
    /// # Errors
    ///
    /// Metadata errors.
    pub fn view_change_uuids(&self) -> Result<Vec<String>> {
        Ok(self
            .members()?
            .into_iter()
            .filter_map(|m| m.cluster.view_change_uuid)
            .collect())
    }

    /// Channel options for `cluster`: its overrides over the ClusterSet defaults.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidOption`] on an unreadable recorded value.
    pub fn channel_options(&self, cluster: &ClusterRecord) -> Result<AsyncReplicationOptions> {
        account::channel_options(&self.record, cluster)
    }

    /// Metadata access through `server`, for writes after the primary moved.
    ///
    /// # Errors
    ///
    /// Connector errors.
    pub fn writer(&self, server: &InstanceRef) -> Result<Metadata> {
        Ok(Metadata::new(self.ctx.connector.metadata_store(server)?))
    }

    /// Take the ClusterSet lock on `anchor`, then a lock per reachable
    /// cluster in `clusters`, the primary cluster first.
    ///
    /// Every lock uses its own connection, so a lock wait times out on the
    /// client side and never ties up a connection the operation works with.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::LockGetFailed`] when a lock stays busy.
    pub fn acquire_locks(&self, anchor: &Cluster, clusters: &[&Cluster], mode: LockMode) -> Result<LockSet> {
        let timeout = self.ctx.settings.lock_timeout();
        let mut locks = LockSet::default();
        let anchor_primary = anchor.primary()?;
        let connection = self.ctx.connect(&anchor_primary.address())?;
        locks.push(lock::acquire(
            &connection,
            &LockScope::ClusterSet(self.record.id.clone()),
            LockMode::Exclusive,
            timeout,
        )?);

        let mut ordered: Vec<&Cluster> = clusters.to_vec();
        ordered.sort_by_key(|c| (c.id() != self.primary.cluster_id, c.name().to_string()));
        for cluster in ordered {
            let Some(primary) = cluster.primary_instance() else {
                debug!(cluster = %cluster.name(), "not locking cluster without a primary");
                continue;
            };
            let connection = self.ctx.connect(&primary.address())?;
            locks.push(lock::acquire(
                &connection,
                &LockScope::Cluster(cluster.id().to_string()),
                mode,
                timeout,
            )?);
        }
        debug!(locks = locks.len(), "locks acquired");
        Ok(locks)
    }
}
