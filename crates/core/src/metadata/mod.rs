//! ClusterSet membership, primary pointer, attributes and routing options.
//!
//! The [`MetadataStore`] is consumed, not owned: the schema lives on the
//! servers and this crate only reads and edits its rows. [`Metadata`] adds
//! transactions whose edits are recorded as an [`EditLog`] of inverses, so a
//! committed change can still be reverted by a later undo step.

pub mod edit;
pub mod records;
pub mod state;

use std::sync::Arc;

use tracing::{debug, warn};

pub use edit::{EditLog, MetadataEdit};
pub use records::{
    attr, routing, Attributes, ClusterRecord, ClusterSetRecord, InstanceRecord, MemberRecord,
    RouterRecord, Value, METADATA_SCHEMA, SINGLE_PRIMARY_TREE,
};
pub use state::MetadataState;

use crate::error::{Error, ErrorCode, Result};
use crate::instance::Version;

/// Transactional access to the metadata schema of one server.
pub trait MetadataStore: Send + Sync {
    /// `None` when the schema does not exist.
    ///
    /// # Errors
    ///
    /// Server errors.
    fn schema_version(&self) -> Result<Option<Version>>;

    /// # Errors
    ///
    /// [`ErrorCode::TransactionActive`] if a transaction is already open.
    fn begin(&self) -> Result<()>;

    /// # Errors
    ///
    /// Server errors.
    fn commit(&self) -> Result<()>;

    /// # Errors
    ///
    /// Server errors.
    fn rollback(&self) -> Result<()>;

    /// Apply one edit and return its inverse.
    ///
    /// # Errors
    ///
    /// Server errors, or [`ErrorCode::MetadataInconsistent`].
    fn apply(&self, edit: &MetadataEdit) -> Result<MetadataEdit>;

    /// # Errors
    ///
    /// Server errors.
    fn snapshot(&self) -> Result<MetadataState>;

    /// Drop the whole schema.
    ///
    /// # Errors
    ///
    /// Server errors.
    fn drop_schema(&self) -> Result<()>;
}

/// A ClusterSet member cluster with its join record.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberCluster {
    pub cluster: ClusterRecord,
    pub member: MemberRecord,
}

/// Typed access to a [`MetadataStore`].
#[derive(Clone)]
pub struct Metadata {
    store: Arc<dyn MetadataStore>,
}

impl Metadata {
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Check the schema exists and is recent enough.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ClusterNotFound`] without a schema,
    /// [`ErrorCode::MetadataOutdated`] if older than `minimum`.
    pub fn check_version(&self, minimum: Version) -> Result<Version> {
        let version = self.store.schema_version()?.ok_or_else(|| {
            Error::new(
                ErrorCode::ClusterNotFound,
                "The InnoDB Cluster metadata schema was not found on the target instance",
            )
        })?;
        if version < minimum {
            return Err(Error::new(
                ErrorCode::MetadataOutdated,
                format!(
                    "The metadata schema version {version} is older than the required {minimum}, upgrade it first"
                ),
            ));
        }
        Ok(version)
    }

    /// Start a transaction. It rolls back when dropped without
    /// [`commit`](Transaction::commit).
    ///
    /// # Errors
    ///
    /// Propagates [`MetadataStore::begin`] errors.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.store.begin()?;
        Ok(Transaction {
            store: self.store.as_ref(),
            log: EditLog::default(),
            open: true,
        })
    }

    /// Undo a committed transaction by replaying its inverses in one new
    /// transaction.
    ///
    /// # Errors
    ///
    /// Propagates store errors; the revert transaction is rolled back.
    pub fn revert(&self, log: &EditLog) -> Result<()> {
        if log.is_empty() {
            return Ok(());
        }
        let mut txn = self.transaction()?;
        for inverse in log.reverting() {
            txn.apply(inverse.clone())?;
        }
        txn.commit().map(|_| ())
    }

    /// # Errors
    ///
    /// Store errors.
    pub fn snapshot(&self) -> Result<MetadataState> {
        self.store.snapshot()
    }

    /// The cluster that has `address` among its instances.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub fn cluster_of_instance(&self, address: &str) -> Result<Option<ClusterRecord>> {
        Ok(self
            .snapshot()?
            .clusters
            .into_values()
            .find(|c| c.has_instance(address)))
    }

    /// # Errors
    ///
    /// Store errors.
    pub fn member(&self, cluster_id: &str) -> Result<Option<MemberRecord>> {
        Ok(self.snapshot()?.members.remove(cluster_id))
    }

    /// # Errors
    ///
    /// [`ErrorCode::ClusterSetNotFound`] if there is no such ClusterSet.
    pub fn cluster_set(&self, id: &str) -> Result<ClusterSetRecord> {
        self.snapshot()?.cluster_sets.remove(id).ok_or_else(|| {
            Error::new(
                ErrorCode::ClusterSetNotFound,
                format!("ClusterSet '{id}' not found in the metadata"),
            )
        })
    }

    /// Every member of the ClusterSet, primary first.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::MetadataInconsistent`] if a join record has no cluster.
    pub fn members_of(&self, cluster_set_id: &str) -> Result<Vec<MemberCluster>> {
        let mut state = self.snapshot()?;
        let mut members = Vec::new();
        for member in state.members.values() {
            if member.cluster_set_id != cluster_set_id {
                continue;
            }
            let cluster = state.clusters.remove(&member.cluster_id).ok_or_else(|| {
                Error::new(
                    ErrorCode::MetadataInconsistent,
                    format!("ClusterSet member '{}' has no cluster record", member.cluster_id),
                )
            })?;
            members.push(MemberCluster {
                cluster,
                member: member.clone(),
            });
        }
        members.sort_by_key(|m| (!m.member.primary_cluster, m.cluster.name.clone()));
        Ok(members)
    }

    /// Routers of a ClusterSet.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub fn routers_of(&self, cluster_set_id: &str) -> Result<Vec<RouterRecord>> {
        Ok(self
            .snapshot()?
            .routers
            .into_values()
            .filter(|r| r.cluster_set_id.as_deref() == Some(cluster_set_id))
            .collect())
    }

    /// Routers registered against a standalone cluster.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub fn routers_of_cluster(&self, cluster_id: &str) -> Result<Vec<RouterRecord>> {
        Ok(self
            .snapshot()?
            .routers
            .into_values()
            .filter(|r| r.cluster_id.as_deref() == Some(cluster_id))
            .collect())
    }
}

/// An open metadata transaction.
#[must_use = "the transaction is rolled back unless committed"]
pub struct Transaction<'m> {
    store: &'m dyn MetadataStore,
    log: EditLog,
    open: bool,
}

impl Transaction<'_> {
    /// # Errors
    ///
    /// Store errors.
    pub fn apply(&mut self, edit: MetadataEdit) -> Result<()> {
        debug!(?edit, "metadata edit");
        let inverse = self.store.apply(&edit)?;
        self.log.push(inverse);
        Ok(())
    }

    /// Commit and hand back the inverses of everything applied.
    ///
    /// # Errors
    ///
    /// Store errors. The transaction is rolled back.
    pub fn commit(mut self) -> Result<EditLog> {
        self.open = false;
        if let Err(err) = self.store.commit() {
            if let Err(rollback) = self.store.rollback() {
                warn!(%rollback, "metadata rollback after failed commit also failed");
            }
            return Err(err);
        }
        Ok(std::mem::take(&mut self.log))
    }

    pub fn create_cluster_set(&mut self, record: ClusterSetRecord) -> Result<()> {
        self.apply(MetadataEdit::ClusterSet {
            id: record.id.clone(),
            record: Some(record),
        })
    }

    pub fn put_cluster(&mut self, record: ClusterRecord) -> Result<()> {
        self.apply(MetadataEdit::Cluster {
            id: record.id.clone(),
            record: Some(record),
        })
    }

    pub fn remove_cluster(&mut self, cluster_id: &str) -> Result<()> {
        self.apply(MetadataEdit::Cluster {
            id: cluster_id.to_string(),
            record: None,
        })
    }

    pub fn add_member(&mut self, cluster_set_id: &str, cluster_id: &str, primary: bool) -> Result<()> {
        self.apply(MetadataEdit::Member {
            cluster_id: cluster_id.to_string(),
            record: Some(MemberRecord {
                cluster_id: cluster_id.to_string(),
                cluster_set_id: cluster_set_id.to_string(),
                primary_cluster: primary,
                invalidated: false,
            }),
        })
    }

    pub fn remove_member(&mut self, cluster_id: &str) -> Result<()> {
        self.apply(MetadataEdit::Member {
            cluster_id: cluster_id.to_string(),
            record: None,
        })
    }

    /// Make `new_primary` the only primary member. Its `invalidated` flag is cleared.
    pub fn switch_primary(&mut self, members: &[MemberRecord], new_primary: &str) -> Result<()> {
        for member in members {
            let primary = member.cluster_id == new_primary;
            if member.primary_cluster == primary && !(primary && member.invalidated) {
                continue;
            }
            let mut record = member.clone();
            record.primary_cluster = primary;
            if primary {
                record.invalidated = false;
            }
            self.apply(MetadataEdit::Member {
                cluster_id: member.cluster_id.clone(),
                record: Some(record),
            })?;
        }
        Ok(())
    }

    pub fn set_invalidated(&mut self, member: &MemberRecord, invalidated: bool) -> Result<()> {
        let mut record = member.clone();
        record.invalidated = invalidated;
        if invalidated {
            record.primary_cluster = false;
        }
        self.apply(MetadataEdit::Member {
            cluster_id: member.cluster_id.clone(),
            record: Some(record),
        })
    }

    pub fn set_cluster_attribute(&mut self, cluster_id: &str, key: &str, value: Option<Value>) -> Result<()> {
        self.apply(MetadataEdit::ClusterAttribute {
            cluster_id: cluster_id.to_string(),
            key: key.to_string(),
            value,
        })
    }

    pub fn set_cluster_set_attribute(
        &mut self,
        cluster_set_id: &str,
        key: &str,
        value: Option<Value>,
    ) -> Result<()> {
        self.apply(MetadataEdit::ClusterSetAttribute {
            cluster_set_id: cluster_set_id.to_string(),
            key: key.to_string(),
            value,
        })
    }

    pub fn set_routing_option(
        &mut self,
        cluster_set_id: &str,
        router: Option<&str>,
        key: &str,
        value: Option<Value>,
    ) -> Result<()> {
        self.apply(MetadataEdit::RoutingOption {
            cluster_set_id: cluster_set_id.to_string(),
            router: router.map(str::to_string),
            key: key.to_string(),
            value,
        })
    }

    /// Drop the present-but-null attributes of a cluster, once they have been
    /// applied as defaults.
    pub fn clear_null_attributes(&mut self, cluster: &ClusterRecord) -> Result<()> {
        for (key, value) in &cluster.attributes {
            if value.is_null() {
                self.set_cluster_attribute(&cluster.id, key, None)?;
            }
        }
        Ok(())
    }

    /// Re-register the routers of a standalone cluster with its new ClusterSet.
    pub fn migrate_routers(&mut self, routers: &[RouterRecord], cluster_id: &str, cluster_set_id: &str) -> Result<()> {
        for router in routers.iter().filter(|r| r.cluster_id.as_deref() == Some(cluster_id)) {
            let mut record = router.clone();
            record.cluster_id = None;
            record.cluster_set_id = Some(cluster_set_id.to_string());
            self.apply(MetadataEdit::Router {
                name: router.name.clone(),
                record: Some(record),
            })?;
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.open {
            debug!("rolling back metadata transaction");
            if let Err(err) = self.store.rollback() {
                warn!(%err, "metadata rollback failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// A store over a [`MetadataState`] with snapshot transactions.
    #[derive(Default)]
    pub struct MemoryStore {
        pub state: Mutex<MetadataState>,
        pub saved: Mutex<Option<MetadataState>>,
        pub fail_commit: bool,
    }

    impl MetadataStore for MemoryStore {
        fn schema_version(&self) -> Result<Option<Version>> {
            Ok(Some(Version::new(2, 1, 0)))
        }

        fn begin(&self) -> Result<()> {
            let mut saved = self.saved.lock().unwrap();
            if saved.is_some() {
                return Err(Error::new(ErrorCode::TransactionActive, "already open"));
            }
            *saved = Some(self.state.lock().unwrap().clone());
            Ok(())
        }

        fn commit(&self) -> Result<()> {
            if self.fail_commit {
                return Err(Error::new(ErrorCode::MetadataInconsistent, "commit failed"));
            }
            *self.saved.lock().unwrap() = None;
            Ok(())
        }

        fn rollback(&self) -> Result<()> {
            if let Some(saved) = self.saved.lock().unwrap().take() {
                *self.state.lock().unwrap() = saved;
            }
            Ok(())
        }

        fn apply(&self, edit: &MetadataEdit) -> Result<MetadataEdit> {
            self.state.lock().unwrap().apply(edit)
        }

        fn snapshot(&self) -> Result<MetadataState> {
            Ok(self.state.lock().unwrap().clone())
        }

        fn drop_schema(&self) -> Result<()> {
            *self.state.lock().unwrap() = MetadataState::default();
            Ok(())
        }
    }

    fn cluster(id: &str, name: &str) -> ClusterRecord {
        ClusterRecord {
            id: id.into(),
            name: name.into(),
            group_name: format!("group-{id}"),
            view_change_uuid: None,
            instances: vec![InstanceRecord {
                address: format!("{id}:3306"),
                uuid: format!("uuid-{id}"),
            }],
            attributes: Attributes::new(),
            routing_options: Attributes::new(),
        }
    }

    fn seeded() -> Metadata {
        let store = MemoryStore::default();
        {
            let mut state = store.state.lock().unwrap();
            state.clusters.insert("c1".into(), cluster("c1", "one"));
            state.clusters.insert("c2".into(), cluster("c2", "two"));
        }
        Metadata::new(Arc::new(store))
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let metadata = seeded();
        let before = metadata.snapshot().unwrap();
        {
            let mut txn = metadata.transaction().unwrap();
            txn.remove_cluster("c1").unwrap();
        }
        assert_eq!(metadata.snapshot().unwrap(), before);
    }

    #[test]
    fn committed_log_reverts_switch_primary() {
        let metadata = seeded();
        let mut txn = metadata.transaction().unwrap();
        txn.add_member("cs", "c1", true).unwrap();
        txn.add_member("cs", "c2", false).unwrap();
        txn.commit().unwrap();
        let before = metadata.snapshot().unwrap();

        let members: Vec<MemberRecord> = metadata
            .members_of("cs")
            .unwrap()
            .into_iter()
            .map(|m| m.member)
            .collect();
        assert_eq!(members[0].cluster_id, "c1");
        let mut txn = metadata.transaction().unwrap();
        txn.switch_primary(&members, "c2").unwrap();
        let log = txn.commit().unwrap();
        assert_eq!(log.len(), 2);

        let after = metadata.members_of("cs").unwrap();
        assert_eq!(after[0].cluster.id, "c2");
        assert_eq!(after.iter().filter(|m| m.member.primary_cluster).count(), 1);

        metadata.revert(&log).unwrap();
        assert_eq!(metadata.snapshot().unwrap(), before);
    }

    #[test]
    fn null_attributes_are_cleared() {
        let metadata = seeded();
        let mut txn = metadata.transaction().unwrap();
        txn.set_cluster_attribute("c1", attr::CONNECT_RETRY, Some(Value::Null))
            .unwrap();
        txn.set_cluster_attribute("c1", attr::RETRY_COUNT, Some(Value::Int(3)))
            .unwrap();
        txn.commit().unwrap();

        let record = metadata.snapshot().unwrap().clusters["c1"].clone();
        let mut txn = metadata.transaction().unwrap();
        txn.clear_null_attributes(&record).unwrap();
        txn.commit().unwrap();

        let attributes = &metadata.snapshot().unwrap().clusters["c1"].attributes;
        assert!(!attributes.contains_key(attr::CONNECT_RETRY));
        assert_eq!(attributes.get(attr::RETRY_COUNT), Some(&Value::Int(3)));
    }

    #[test]
    fn missing_schema_and_old_schema_are_reported() {
        let metadata = seeded();
        assert!(metadata.check_version(Version::new(2, 1, 0)).is_ok());
        let err = metadata.check_version(Version::new(2, 2, 0)).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MetadataOutdated));
    }

    #[test]
    fn failed_commit_rolls_back() {
        let store = Arc::new(MemoryStore {
            fail_commit: true,
            ..MemoryStore::default()
        });
        let metadata = Metadata::new(store);
        let mut txn = metadata.transaction().unwrap();
        txn.put_cluster(cluster("c3", "three")).unwrap();
        assert!(txn.commit().is_err());
        assert!(metadata.snapshot().unwrap().clusters.is_empty());
    }
}
