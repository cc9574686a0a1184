//! The metadata schema as a simulated server stores it.
//!
//! Reads see the server's committed copy. A transaction works on a private
//! copy and, on commit, becomes one binlogged transaction on the server, so
//! the edits replicate like any other write.

use std::sync::Mutex;

use clusterset_core::instance::Version;
use clusterset_core::metadata::{MetadataEdit, MetadataState, MetadataStore};
use clusterset_core::{Error, ErrorCode, Result};
use tracing::debug;

use crate::world::{no_metadata, Change, World};

#[derive(Debug)]
struct Pending {
    working: MetadataState,
    edits: Vec<MetadataEdit>,
}

/// [`MetadataStore`] bound to one server of a [`World`].
#[derive(Debug)]
pub struct SimMetadataStore {
    world: World,
    address: String,
    pending: Mutex<Option<Pending>>,
}

impl SimMetadataStore {
    #[must_use]
    pub fn new(world: World, address: &str) -> Self {
        Self {
            world,
            address: address.to_string(),
            pending: Mutex::new(None),
        }
    }

    fn committed(&self) -> Result<MetadataState> {
        self.world.read(|s| {
            s.server(&self.address)?
                .data
                .metadata
                .clone()
                .ok_or_else(|| no_metadata().into())
        })
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self, change: Change) -> Result<()> {
        let gtid = self.world.update(|s| s.commit(&self.address, change))?;
        debug!(server = %self.address, %gtid, "metadata committed");
        Ok(())
    }
}

impl MetadataStore for SimMetadataStore {
    fn schema_version(&self) -> Result<Option<Version>> {
        self.world.read(|s| {
            Ok(s.server(&self.address)?
                .data
                .metadata_version
                .as_deref()
                .and_then(Version::parse))
        })
    }

    fn begin(&self) -> Result<()> {
        let mut pending = self.pending();
        if pending.is_some() {
            return Err(Error::new(
                ErrorCode::TransactionActive,
                "A metadata transaction is already open",
            ));
        }
        *pending = Some(Pending {
            working: self.committed()?,
            edits: Vec::new(),
        });
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let Some(Pending { edits, .. }) = self.pending().take() else {
            return Ok(());
        };
        if edits.is_empty() {
            return Ok(());
        }
        self.write(Change::Metadata { edits })
    }

    fn rollback(&self) -> Result<()> {
        self.pending().take();
        Ok(())
    }

    fn apply(&self, edit: &MetadataEdit) -> Result<MetadataEdit> {
        let mut pending = self.pending();
        if let Some(pending) = pending.as_mut() {
            let inverse = pending.working.apply(edit)?;
            pending.edits.push(edit.clone());
            return Ok(inverse);
        }
        drop(pending);
        let inverse = self.committed()?.apply(edit)?;
        self.write(Change::Metadata {
            edits: vec![edit.clone()],
        })?;
        Ok(inverse)
    }

    fn snapshot(&self) -> Result<MetadataState> {
        if let Some(pending) = self.pending().as_ref() {
            return Ok(pending.working.clone());
        }
        self.committed()
    }

    fn drop_schema(&self) -> Result<()> {
        self.pending().take();
        self.write(Change::DropMetadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{Server, WorldState};
    use clusterset_core::metadata::{Attributes, ClusterSetRecord};

    fn record(id: &str) -> ClusterSetRecord {
        ClusterSetRecord {
            id: id.to_string(),
            domain_name: "dom".to_string(),
            topology_type: "SINGLE-PRIMARY".to_string(),
            attributes: Attributes::new(),
            routing_options: Attributes::new(),
        }
    }

    fn world() -> World {
        let mut state = WorldState::default();
        state.servers.insert("h:1".into(), Server::new("h:1", "11111111-1111-4111-8111-111111111111", "8.0.30"));
        state
            .commit(
                "h:1",
                Change::CreateMetadata {
                    version: "2.1.0".into(),
                    state: MetadataState::default(),
                },
            )
            .expect("writable");
        World::new(state)
    }

    #[test]
    fn transaction_is_invisible_until_commit() {
        let world = world();
        let store = SimMetadataStore::new(world.clone(), "h:1");
        let reader = SimMetadataStore::new(world, "h:1");
        store.begin().expect("no open transaction");
        assert!(store.begin().is_err_and(|e| e.code() == Some(ErrorCode::TransactionActive)));
        store
            .apply(&MetadataEdit::ClusterSet {
                id: "cs".into(),
                record: Some(record("cs")),
            })
            .expect("applies");
        assert!(store.snapshot().expect("readable").cluster_sets.contains_key("cs"));
        assert!(reader.snapshot().expect("readable").cluster_sets.is_empty());
        store.commit().expect("writable");
        assert!(reader.snapshot().expect("readable").cluster_sets.contains_key("cs"));
        assert_eq!(store.schema_version().expect("readable"), Some(Version::new(2, 1, 0)));
    }

    #[test]
    fn rollback_discards_and_read_only_refuses() {
        let world = world();
        let store = SimMetadataStore::new(world.clone(), "h:1");
        store.begin().expect("no open transaction");
        store
            .apply(&MetadataEdit::ClusterSet {
                id: "cs".into(),
                record: Some(record("cs")),
            })
            .expect("applies");
        store.rollback().expect("always");
        assert!(store.snapshot().expect("readable").cluster_sets.is_empty());

        world.update(|s| s.servers.get_mut("h:1").map(|s| s.set_super_read_only(true)));
        let err = store
            .apply(&MetadataEdit::ClusterSet {
                id: "cs".into(),
                record: Some(record("cs")),
            })
            .expect_err("fenced");
        assert_eq!(err.server_code(), Some(clusterset_core::ServerError::READ_ONLY));
    }
}
