//! Read-only views of a ClusterSet: health ([`status`]) and shape ([`describe`]).

use std::fmt;

use tracing::debug;

use super::cluster::{Cluster, ClusterAvailability};
use super::cluster_set::ClusterSet;
use crate::context::OperationContext;
use crate::error::Result;
use crate::gtid::consistency::check_transaction_set;
use crate::instance::{parse_bool, InstanceRef};
use crate::replication::{self, ChannelState};

/// Health of one member cluster within its ClusterSet.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ClusterGlobalStatus {
    Ok,
    OkFencedWrites,
    OkMisconfigured,
    OkNotReplicating,
    OkNotConsistent,
    NotOk,
    Invalidated,
    Unknown,
}

impl ClusterGlobalStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::OkFencedWrites => "OK_FENCED_WRITES",
            Self::OkMisconfigured => "OK_MISCONFIGURED",
            Self::OkNotReplicating => "OK_NOT_REPLICATING",
            Self::OkNotConsistent => "OK_NOT_CONSISTENT",
            Self::NotOk => "NOT_OK",
            Self::Invalidated => "INVALIDATED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Any of the `OK*` states: the cluster serves its role, maybe degraded.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(
            self,
            Self::Ok
                | Self::OkFencedWrites
                | Self::OkMisconfigured
                | Self::OkNotReplicating
                | Self::OkNotConsistent
        )
    }
}

impl fmt::Display for ClusterGlobalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything [`global_status`] looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInputs {
    pub invalidated: bool,
    pub availability: ClusterAvailability,
    pub is_primary: bool,
    /// `super_read_only` on the cluster's primary.
    pub fenced: bool,
    pub channel: ChannelState,
    pub errant: bool,
}

/// Combine local group health, channel state and consistency.
///
/// Invalidation wins, then quorum loss, then channel problems, then
/// consistency.
#[must_use]
pub fn global_status(inputs: &StatusInputs) -> ClusterGlobalStatus {
    if inputs.invalidated {
        return ClusterGlobalStatus::Invalidated;
    }
    match inputs.availability {
        ClusterAvailability::Unreachable => return ClusterGlobalStatus::Unknown,
        ClusterAvailability::NoQuorum | ClusterAvailability::Offline | ClusterAvailability::OnlineNoPrimary => {
            return ClusterGlobalStatus::NotOk;
        }
        ClusterAvailability::Online | ClusterAvailability::SomeUnreachable => {}
    }
    if inputs.is_primary {
        if inputs.fenced {
            return ClusterGlobalStatus::OkFencedWrites;
        }
        if !matches!(inputs.channel, ChannelState::Missing | ChannelState::Unknown) {
            return ClusterGlobalStatus::OkMisconfigured;
        }
        return ClusterGlobalStatus::Ok;
    }
    match inputs.channel {
        ChannelState::On => {}
        ChannelState::Misconfigured => return ClusterGlobalStatus::OkMisconfigured,
        _ => return ClusterGlobalStatus::OkNotReplicating,
    }
    if !inputs.fenced {
        return ClusterGlobalStatus::OkMisconfigured;
    }
    if inputs.errant {
        return ClusterGlobalStatus::OkNotConsistent;
    }
    ClusterGlobalStatus::Ok
}

/// Overall ClusterSet health.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClusterSetHealth {
    /// Every cluster is `OK`.
    Healthy,
    /// The primary cluster serves writes, something else is degraded.
    Available,
    Unavailable,
}

impl ClusterSetHealth {
    #[must_use]
    pub fn of(primary: ClusterGlobalStatus, all: &[ClusterGlobalStatus]) -> Self {
        if all.iter().all(|s| *s == ClusterGlobalStatus::Ok) {
            Self::Healthy
        } else if primary.is_ok() {
            Self::Available
        } else {
            Self::Unavailable
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Available => "AVAILABLE",
            Self::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for ClusterSetHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClusterRole {
    Primary,
    Replica,
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatus {
    pub name: String,
    pub role: ClusterRole,
    pub global_status: ClusterGlobalStatus,
    pub availability: ClusterAvailability,
    pub primary: Option<String>,
    /// State of the inbound ClusterSet channel on the cluster's primary.
    pub channel: ChannelState,
    /// `None` when it could not be checked.
    pub transaction_set_consistent: Option<bool>,
    pub errant: Option<String>,
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSetStatus {
    pub domain_name: String,
    pub primary_cluster: String,
    pub global_primary_instance: Option<String>,
    pub status: ClusterSetHealth,
    pub clusters: Vec<ClusterStatus>,
}

impl ClusterSetStatus {
    #[must_use]
    pub fn cluster(&self, name: &str) -> Option<&ClusterStatus> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescription {
    pub name: String,
    pub role: ClusterRole,
    pub invalidated: bool,
    pub instances: Vec<String>,
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub domain_name: String,
    pub primary_cluster: String,
    pub clusters: Vec<ClusterDescription>,
}

/// Health of the ClusterSet that `address` belongs to.
///
/// Unreachable clusters are reported, never an error.
///
/// # Errors
///
/// Only the errors of [`ClusterSet::open`].
pub fn status(ctx: &OperationContext, address: &str) -> Result<ClusterSetStatus> {
    let cluster_set = ClusterSet::open(ctx, address)?;
    let clusters = cluster_set.connect_all()?;
    let view_change_uuids = cluster_set.view_change_uuids()?;
    let Some((primary_cluster, _)) = clusters.split_first() else {
        return Ok(ClusterSetStatus {
            domain_name: cluster_set.domain_name().to_string(),
            primary_cluster: String::new(),
            global_primary_instance: None,
            status: ClusterSetHealth::Unavailable,
            clusters: Vec::new(),
        });
    };
    let global_primary = primary_cluster.primary().ok().cloned();
    let global_uuid = global_primary.as_ref().and_then(|p| p.uuid().ok());
    let primary_members = primary_cluster.reachable_members(ctx);

    let statuses: Vec<ClusterStatus> = clusters
        .iter()
        .map(|cluster| {
            cluster_status(
                cluster,
                global_primary.as_ref(),
                global_uuid.as_deref(),
                &primary_members,
                &view_change_uuids,
            )
        })
        .collect();
    let all: Vec<ClusterGlobalStatus> = statuses.iter().map(|s| s.global_status).collect();
    let primary_status = all.first().copied().unwrap_or(ClusterGlobalStatus::Unknown);
    let health = ClusterSetHealth::of(primary_status, &all);
    Ok(ClusterSetStatus {
        domain_name: cluster_set.domain_name().to_string(),
        primary_cluster: primary_cluster.name().to_string(),
        global_primary_instance: global_primary.map(|p| p.address()),
        status: health,
        clusters: statuses,
    })
}

fn cluster_status(
    cluster: &Cluster,
    global_primary: Option<&InstanceRef>,
    global_uuid: Option<&str>,
    primary_members: &[InstanceRef],
    view_change_uuids: &[String],
) -> ClusterStatus {
    let is_primary = cluster.is_primary_cluster();
    let role = if is_primary {
        ClusterRole::Primary
    } else {
        ClusterRole::Replica
    };
    let primary = cluster.primary_instance();
    let channel = primary.map_or(ChannelState::Unknown, |p| {
        replication::channel_state(p.as_ref(), if is_primary { None } else { global_uuid })
    });
    let fenced = primary
        .and_then(|p| p.get_sysvar("super_read_only").ok().flatten())
        .is_some_and(|v| parse_bool(&v));

    let mut errant = None;
    if let (false, Some(primary), Some(global)) = (is_primary, primary, global_primary) {
        match check_transaction_set(primary.as_ref(), global.as_ref(), primary_members, view_change_uuids) {
            Ok(report) => errant = Some(report.errant.to_string()),
            Err(err) => debug!(cluster = %cluster.name(), %err, "consistency check skipped"),
        }
    }
    let has_errant = errant.as_deref().is_some_and(|e| !e.is_empty());
    let global_status = global_status(&StatusInputs {
        invalidated: cluster.is_invalidated(),
        availability: cluster.availability,
        is_primary,
        fenced,
        channel,
        errant: has_errant,
    });
    ClusterStatus {
        name: cluster.name().to_string(),
        role,
        global_status,
        availability: cluster.availability,
        primary: primary.map(|p| p.address()),
        channel,
        transaction_set_consistent: if is_primary {
            Some(true)
        } else {
            errant.as_ref().map(|e| e.is_empty())
        },
        errant: errant.filter(|e| !e.is_empty()),
    }
}

/// The recorded topology of the ClusterSet that `address` belongs to.
///
/// # Errors
///
/// Only the errors of [`ClusterSet::open`].
pub fn describe(ctx: &OperationContext, address: &str) -> Result<Description> {
    let cluster_set = ClusterSet::open(ctx, address)?;
    let members = cluster_set.members()?;
    let primary_cluster = members
        .iter()
        .find(|m| m.member.primary_cluster)
        .map(|m| m.cluster.name.clone())
        .unwrap_or_default();
    let clusters = members
        .into_iter()
        .map(|m| ClusterDescription {
            role: if m.member.primary_cluster {
                ClusterRole::Primary
            } else {
                ClusterRole::Replica
            },
            invalidated: m.member.invalidated,
            instances: m.cluster.instances.into_iter().map(|i| i.address).collect(),
            name: m.cluster.name,
        })
        .collect();
    Ok(Description {
        domain_name: cluster_set.domain_name().to_string(),
        primary_cluster,
        clusters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_replica() -> StatusInputs {
        StatusInputs {
            invalidated: false,
            availability: ClusterAvailability::Online,
            is_primary: false,
            fenced: true,
            channel: ChannelState::On,
            errant: false,
        }
    }

    #[test]
    fn healthy_clusters_are_ok() {
        assert_eq!(global_status(&healthy_replica()), ClusterGlobalStatus::Ok);
        let primary = StatusInputs {
            is_primary: true,
            fenced: false,
            channel: ChannelState::Missing,
            ..healthy_replica()
        };
        assert_eq!(global_status(&primary), ClusterGlobalStatus::Ok);
    }

    #[test]
    fn invalidation_dominates_everything() {
        let inputs = StatusInputs {
            invalidated: true,
            availability: ClusterAvailability::NoQuorum,
            errant: true,
            ..healthy_replica()
        };
        assert_eq!(global_status(&inputs), ClusterGlobalStatus::Invalidated);
    }

    #[test]
    fn quorum_loss_dominates_channel_issues() {
        let inputs = StatusInputs {
            availability: ClusterAvailability::NoQuorum,
            channel: ChannelState::Error,
            ..healthy_replica()
        };
        assert_eq!(global_status(&inputs), ClusterGlobalStatus::NotOk);
        let inputs = StatusInputs {
            availability: ClusterAvailability::Unreachable,
            ..healthy_replica()
        };
        assert_eq!(global_status(&inputs), ClusterGlobalStatus::Unknown);
    }

    #[test]
    fn channel_issues_dominate_consistency() {
        let inputs = StatusInputs {
            channel: ChannelState::Stopped,
            errant: true,
            ..healthy_replica()
        };
        assert_eq!(global_status(&inputs), ClusterGlobalStatus::OkNotReplicating);
        let inputs = StatusInputs {
            channel: ChannelState::Misconfigured,
            errant: true,
            ..healthy_replica()
        };
        assert_eq!(global_status(&inputs), ClusterGlobalStatus::OkMisconfigured);
        let inputs = StatusInputs {
            errant: true,
            ..healthy_replica()
        };
        assert_eq!(global_status(&inputs), ClusterGlobalStatus::OkNotConsistent);
    }

    #[test]
    fn primary_write_fence_and_stray_channel() {
        let base = StatusInputs {
            is_primary: true,
            fenced: false,
            channel: ChannelState::Missing,
            ..healthy_replica()
        };
        let fenced = StatusInputs { fenced: true, ..base };
        assert_eq!(global_status(&fenced), ClusterGlobalStatus::OkFencedWrites);
        let replicating = StatusInputs {
            channel: ChannelState::On,
            ..base
        };
        assert_eq!(global_status(&replicating), ClusterGlobalStatus::OkMisconfigured);
    }

    #[test]
    fn cluster_set_health() {
        use ClusterGlobalStatus::{NotOk, Ok, OkNotReplicating};
        assert_eq!(ClusterSetHealth::of(Ok, &[Ok, Ok]), ClusterSetHealth::Healthy);
        assert_eq!(
            ClusterSetHealth::of(Ok, &[Ok, OkNotReplicating]),
            ClusterSetHealth::Available
        );
        assert_eq!(
            ClusterSetHealth::of(NotOk, &[NotOk, Ok]),
            ClusterSetHealth::Unavailable
        );
    }
}
