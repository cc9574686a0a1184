//! A live view of one InnoDB Cluster: which members answer, who the group
//! primary is and whether the group has quorum.

use std::fmt;

use tracing::debug;

use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::instance::{GroupMember, InstanceRef, MemberRole, MemberState, VarScope};
use crate::metadata::{ClusterRecord, MemberRecord};

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClusterAvailability {
    Online,
    /// Quorum and a primary, but some recorded member is not ONLINE.
    SomeUnreachable,
    OnlineNoPrimary,
    NoQuorum,
    /// Reachable, but Group Replication is not running.
    Offline,
    Unreachable,
}

impl ClusterAvailability {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::SomeUnreachable => "SOME_UNREACHABLE",
            Self::OnlineNoPrimary => "ONLINE_NO_PRIMARY",
            Self::NoQuorum => "NO_QUORUM",
            Self::Offline => "OFFLINE",
            Self::Unreachable => "UNREACHABLE",
        }
    }

    /// Has quorum and a writable-capable primary.
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Online | Self::SomeUnreachable)
    }
}

impl fmt::Display for ClusterAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Cluster {
    pub record: ClusterRecord,
    pub member: Option<MemberRecord>,
    pub availability: ClusterAvailability,
    primary: Option<InstanceRef>,
    group: Vec<GroupMember>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.record.name)
            .field("availability", &self.availability)
            .field("primary", &self.primary.as_ref().map(|p| p.address()))
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Connect to the cluster. Never fails: problems show up in
    /// [`availability`](Self::availability).
    pub fn connect(ctx: &OperationContext, record: ClusterRecord, member: Option<MemberRecord>) -> Self {
        let mut cluster = Self {
            record,
            member,
            availability: ClusterAvailability::Unreachable,
            primary: None,
            group: Vec::new(),
        };
        cluster.refresh(ctx);
        cluster
    }

    /// Re-read membership and reconnect to the primary.
    pub fn refresh(&mut self, ctx: &OperationContext) {
        self.primary = None;
        self.group.clear();
        self.availability = ClusterAvailability::Unreachable;

        // The first member that is ONLINE in its own view speaks for the group.
        let mut reached = false;
        let mut view = None;
        for instance in &self.record.instances {
            let probe = match ctx.connect(&instance.address) {
                Ok(probe) => probe,
                Err(err) => {
                    debug!(address = %instance.address, %err, "member unreachable");
                    continue;
                }
            };
            let members = match probe.group_members() {
                Ok(members) => members,
                Err(err) => {
                    debug!(address = %probe.address(), %err, "cannot read group membership");
                    continue;
                }
            };
            reached = true;
            let probe_uuid = probe.uuid().unwrap_or_default();
            if members
                .iter()
                .any(|m| m.uuid == probe_uuid && m.state == MemberState::Online)
            {
                view = Some((probe, members));
                break;
            }
            debug!(address = %probe.address(), "member is not ONLINE in its group");
        }
        let Some((probe, members)) = view else {
            if reached {
                self.availability = ClusterAvailability::Offline;
            }
            return;
        };
        let online = members.iter().filter(|m| m.state == MemberState::Online).count();
        self.group = members;
        if online * 2 <= self.group.len() {
            self.availability = ClusterAvailability::NoQuorum;
            return;
        }
        let primary_address = self
            .group
            .iter()
            .find(|m| m.role == MemberRole::Primary && m.state == MemberState::Online)
            .map(GroupMember::address);
        let primary = primary_address.and_then(|address| {
            if address == probe.address() {
                Some(probe.clone())
            } else {
                ctx.connect(&address).ok()
            }
        });
        let Some(primary) = primary else {
            self.availability = ClusterAvailability::OnlineNoPrimary;
            return;
        };
        self.primary = Some(primary);
        let all_online = self.record.instances.iter().all(|instance| {
            self.group
                .iter()
                .any(|m| m.address() == instance.address && m.state == MemberState::Online)
        });
        self.availability = if all_online {
            ClusterAvailability::Online
        } else {
            ClusterAvailability::SomeUnreachable
        };
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.record.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.record.name
    }

    #[must_use]
    pub fn is_primary_cluster(&self) -> bool {
        self.member.as_ref().is_some_and(|m| m.primary_cluster)
    }

    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.member.as_ref().is_some_and(|m| m.invalidated)
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.availability != ClusterAvailability::Unreachable
    }

    #[must_use]
    pub fn view_change_uuid(&self) -> Option<&str> {
        self.record.view_change_uuid.as_deref()
    }

    #[must_use]
    pub fn group_members(&self) -> &[GroupMember] {
        &self.group
    }

    /// The group primary, if connected.
    #[must_use]
    pub const fn primary_instance(&self) -> Option<&InstanceRef> {
        self.primary.as_ref()
    }

    /// The group primary of an available cluster.
    ///
    /// # Errors
    ///
    /// An availability failure matching why there is no usable primary.
    pub fn primary(&self) -> Result<&InstanceRef> {
        match (&self.primary, self.availability) {
            (Some(primary), availability) if availability.is_available() => Ok(primary),
            (_, ClusterAvailability::Unreachable) => Err(Error::new(
                ErrorCode::ClusterUnreachable,
                format!("Could not connect to any member of cluster '{}'", self.name()),
            )),
            (_, ClusterAvailability::NoQuorum) => Err(Error::new(
                ErrorCode::GroupHasNoQuorum,
                format!(
                    "Cluster '{}' has no quorum, restore it before retrying",
                    self.name()
                ),
            )),
            (_, availability) => Err(Error::new(
                ErrorCode::ClusterOffline,
                format!(
                    "Cluster '{}' is {availability}, reboot it from a complete outage first",
                    self.name()
                ),
            )),
        }
    }

    /// Connections to every ONLINE member, secondaries first and the primary last.
    pub fn reachable_members(&self, ctx: &OperationContext) -> Vec<InstanceRef> {
        let mut members = self.secondaries(ctx);
        if let Some(primary) = &self.primary {
            members.push(primary.clone());
        }
        members
    }

    /// Connections to the ONLINE secondaries.
    pub fn secondaries(&self, ctx: &OperationContext) -> Vec<InstanceRef> {
        self.group
            .iter()
            .filter(|m| m.state == MemberState::Online && m.role == MemberRole::Secondary)
            .filter_map(|m| {
                ctx.connect(&m.address())
                    .inspect_err(|err| debug!(address = %m.address(), %err, "secondary unreachable"))
                    .ok()
            })
            .collect()
    }

    /// Set a system variable on every reachable member, skipping `ignore`d addresses.
    ///
    /// # Errors
    ///
    /// The first server error.
    pub fn set_sysvar_all(
        &self,
        ctx: &OperationContext,
        name: &str,
        value: &str,
        scope: VarScope,
        ignore: &[String],
    ) -> Result<()> {
        for member in self.reachable_members(ctx) {
            if ignore.contains(&member.address()) {
                continue;
            }
            debug!(server = %member.address(), name, value, "setting system variable");
            member.set_sysvar(name, value, scope)?;
        }
        Ok(())
    }

    /// Read a system variable from every reachable member.
    pub fn get_sysvar_all(&self, ctx: &OperationContext, name: &str) -> Vec<(String, Option<String>)> {
        self.reachable_members(ctx)
            .iter()
            .map(|m| (m.address(), m.get_sysvar(name).ok().flatten()))
            .collect()
    }
}
