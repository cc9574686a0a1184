//! Reversible metadata edits.
//!
//! Every edit sets one slot (a record or an attribute) to a new value, where
//! `None` deletes it. Applying an edit yields the edit that restores the
//! previous value, so a sequence of edits can be undone by replaying the
//! inverses backwards, even after the transaction that made them committed.

use super::records::{ClusterRecord, ClusterSetRecord, MemberRecord, RouterRecord, Value};

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataEdit {
    ClusterSet {
        id: String,
        record: Option<ClusterSetRecord>,
    },
    Cluster {
        id: String,
        record: Option<ClusterRecord>,
    },
    Member {
        cluster_id: String,
        record: Option<MemberRecord>,
    },
    Router {
        name: String,
        record: Option<RouterRecord>,
    },
    ClusterSetAttribute {
        cluster_set_id: String,
        key: String,
        value: Option<Value>,
    },
    ClusterAttribute {
        cluster_id: String,
        key: String,
        value: Option<Value>,
    },
    /// A ClusterSet-wide routing option, or a router's own when `router` is set.
    RoutingOption {
        cluster_set_id: String,
        router: Option<String>,
        key: String,
        value: Option<Value>,
    },
}

impl MetadataEdit {
    /// Same slot, different value.
    #[must_use]
    pub fn with_previous(&self, previous: Option<PreviousValue>) -> Self {
        match (self, previous) {
            (Self::ClusterSet { id, .. }, Some(PreviousValue::ClusterSet(record))) => Self::ClusterSet {
                id: id.clone(),
                record: Some(record),
            },
            (Self::ClusterSet { id, .. }, _) => Self::ClusterSet {
                id: id.clone(),
                record: None,
            },
            (Self::Cluster { id, .. }, Some(PreviousValue::Cluster(record))) => Self::Cluster {
                id: id.clone(),
                record: Some(record),
            },
            (Self::Cluster { id, .. }, _) => Self::Cluster {
                id: id.clone(),
                record: None,
            },
            (Self::Member { cluster_id, .. }, Some(PreviousValue::Member(record))) => Self::Member {
                cluster_id: cluster_id.clone(),
                record: Some(record),
            },
            (Self::Member { cluster_id, .. }, _) => Self::Member {
                cluster_id: cluster_id.clone(),
                record: None,
            },
            (Self::Router { name, .. }, Some(PreviousValue::Router(record))) => Self::Router {
                name: name.clone(),
                record: Some(record),
            },
            (Self::Router { name, .. }, _) => Self::Router {
                name: name.clone(),
                record: None,
            },
            (
                Self::ClusterSetAttribute {
                    cluster_set_id, key, ..
                },
                previous,
            ) => Self::ClusterSetAttribute {
                cluster_set_id: cluster_set_id.clone(),
                key: key.clone(),
                value: previous.and_then(PreviousValue::into_value),
            },
            (Self::ClusterAttribute { cluster_id, key, .. }, previous) => Self::ClusterAttribute {
                cluster_id: cluster_id.clone(),
                key: key.clone(),
                value: previous.and_then(PreviousValue::into_value),
            },
            (
                Self::RoutingOption {
                    cluster_set_id,
                    router,
                    key,
                    ..
                },
                previous,
            ) => Self::RoutingOption {
                cluster_set_id: cluster_set_id.clone(),
                router: router.clone(),
                key: key.clone(),
                value: previous.and_then(PreviousValue::into_value),
            },
        }
    }
}

/// What a slot held before an edit.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviousValue {
    ClusterSet(ClusterSetRecord),
    Cluster(ClusterRecord),
    Member(MemberRecord),
    Router(RouterRecord),
    Value(Value),
}

impl PreviousValue {
    fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Inverses of the edits made by one committed transaction, in apply order.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditLog {
    inverses: Vec<MetadataEdit>,
}

impl EditLog {
    pub fn push(&mut self, inverse: MetadataEdit) {
        self.inverses.push(inverse);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inverses.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inverses.len()
    }

    /// Inverses in the order they must be applied to revert.
    pub fn reverting(&self) -> impl Iterator<Item = &MetadataEdit> {
        self.inverses.iter().rev()
    }

    /// Concatenate another log made after this one.
    pub fn extend(&mut self, later: Self) {
        self.inverses.extend(later.inverses);
    }
}
