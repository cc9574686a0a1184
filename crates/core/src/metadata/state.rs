//! In-memory image of the metadata schema.
//!
//! This is the data model a [`MetadataStore`](super::MetadataStore) persists.
//! Stores that keep their tables in memory can embed it directly.

use std::collections::BTreeMap;

use super::edit::{MetadataEdit, PreviousValue};
use super::records::{ClusterRecord, ClusterSetRecord, MemberRecord, RouterRecord, Value};
use crate::error::{Error, ErrorCode, Result};

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataState {
    pub cluster_sets: BTreeMap<String, ClusterSetRecord>,
    pub clusters: BTreeMap<String, ClusterRecord>,
    pub members: BTreeMap<String, MemberRecord>,
    pub routers: BTreeMap<String, RouterRecord>,
}

fn set_slot<T: Clone>(map: &mut BTreeMap<String, T>, key: &str, value: Option<&T>) -> Option<T> {
    match value {
        Some(value) => map.insert(key.into(), value.clone()),
        None => map.remove(key),
    }
}

fn set_value(
    map: &mut BTreeMap<String, Value>,
    key: &str,
    value: Option<&Value>,
) -> Option<PreviousValue> {
    set_slot(map, key, value).map(PreviousValue::Value)
}

fn missing(what: &str, id: &str) -> Error {
    Error::new(
        ErrorCode::MetadataInconsistent,
        format!("{what} '{id}' does not exist in the metadata"),
    )
}

impl MetadataState {
    /// Apply `edit` and return its inverse.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::MetadataInconsistent`] when an attribute edit targets a
    /// record that does not exist. Nothing is changed in that case.
    pub fn apply(&mut self, edit: &MetadataEdit) -> Result<MetadataEdit> {
        let previous = match edit {
            MetadataEdit::ClusterSet { id, record } => {
                set_slot(&mut self.cluster_sets, id, record.as_ref()).map(PreviousValue::ClusterSet)
            }
            MetadataEdit::Cluster { id, record } => {
                set_slot(&mut self.clusters, id, record.as_ref()).map(PreviousValue::Cluster)
            }
            MetadataEdit::Member { cluster_id, record } => {
                set_slot(&mut self.members, cluster_id, record.as_ref()).map(PreviousValue::Member)
            }
            MetadataEdit::Router { name, record } => {
                set_slot(&mut self.routers, name, record.as_ref()).map(PreviousValue::Router)
            }
            MetadataEdit::ClusterSetAttribute {
                cluster_set_id,
                key,
                value,
            } => {
                let record = self
                    .cluster_sets
                    .get_mut(cluster_set_id)
                    .ok_or_else(|| missing("ClusterSet", cluster_set_id))?;
                set_value(&mut record.attributes, key, value.as_ref())
            }
            MetadataEdit::ClusterAttribute {
                cluster_id,
                key,
                value,
            } => {
                let record = self
                    .clusters
                    .get_mut(cluster_id)
                    .ok_or_else(|| missing("Cluster", cluster_id))?;
                set_value(&mut record.attributes, key, value.as_ref())
            }
            MetadataEdit::RoutingOption {
                cluster_set_id,
                router: Some(router),
                key,
                value,
            } => {
                let record = self
                    .routers
                    .get_mut(router)
                    .filter(|r| r.cluster_set_id.as_deref() == Some(cluster_set_id.as_str()))
                    .ok_or_else(|| missing("Router", router))?;
                set_value(&mut record.options, key, value.as_ref())
            }
            MetadataEdit::RoutingOption {
                cluster_set_id,
                router: None,
                key,
                value,
            } => {
                let record = self
                    .cluster_sets
                    .get_mut(cluster_set_id)
                    .ok_or_else(|| missing("ClusterSet", cluster_set_id))?;
                set_value(&mut record.routing_options, key, value.as_ref())
            }
        };
        Ok(edit.with_previous(previous))
    }

    /// Remove everything that belongs to `cluster_set_id`: the ClusterSet,
    /// its member clusters, their membership records and routers.
    pub fn remove_cluster_set(&mut self, cluster_set_id: &str) {
        let cluster_ids: Vec<String> = self
            .members
            .values()
            .filter(|m| m.cluster_set_id == cluster_set_id)
            .map(|m| m.cluster_id.clone())
            .collect();
        for id in &cluster_ids {
            self.members.remove(id);
            self.clusters.remove(id);
        }
        self.routers.retain(|_, r| {
            r.cluster_set_id.as_deref() != Some(cluster_set_id)
                && !r.cluster_id.as_ref().is_some_and(|c| cluster_ids.contains(c))
        });
        self.cluster_sets.remove(cluster_set_id);
    }
}
