//! Ready-made topologies: InnoDB Clusters with their metadata, plus spare
//! standalone servers to grow replica clusters from.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use clusterset_core::instance::MemberRole;
use clusterset_core::metadata::{Attributes, ClusterRecord, InstanceRecord, MetadataState, RouterRecord};
use clusterset_core::replication::CLUSTER_SET_CHANNEL;
use derive_more::From;
use serde::{Deserialize, Serialize};
use tracing::info;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::connection::SimConnector;
use crate::world::{Change, Event, Server, World, WorldState};

/// One InnoDB Cluster to seed.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, TypedBuilder)]
pub struct ClusterSpec {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default = 3)]
    pub size: usize,
    #[builder(default = String::from("8.0.30"), setter(into))]
    pub version: String,
    /// Configure `group_replication_view_change_uuid`.
    #[builder(default = true)]
    pub view_change_uuid: bool,
    #[builder(default = true)]
    pub single_primary: bool,
    /// Routers registered with the cluster, as `host::label`.
    #[builder(default)]
    pub routers: Vec<String>,
    #[builder(default = String::from("2.1.0"), setter(into))]
    pub metadata_version: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, TypedBuilder)]
pub struct LabSpec {
    #[builder(default = vec![ClusterSpec::builder().name("cluster1").build()])]
    pub clusters: Vec<ClusterSpec>,
    /// Standalone servers, not in any group and without metadata.
    #[builder(default = 2)]
    pub spare_servers: usize,
    #[builder(default = String::from("8.0.30"), setter(into))]
    pub spare_version: String,
    #[builder(default = String::from("127.0.0.1"), setter(into))]
    pub host: String,
    #[builder(default = 3310)]
    pub base_port: u16,
}

impl Default for LabSpec {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, From)]
pub enum LabError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Server(clusterset_core::Error),
}

impl fmt::Display for LabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "lab file: {err}"),
            Self::Json(err) => write!(f, "lab file is not valid: {err}"),
            Self::Server(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LabError {}

/// Per-server summary, as `lab show` prints it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerSummary {
    pub address: String,
    pub reachable: bool,
    pub group: Option<String>,
    pub primary: bool,
    pub super_read_only: bool,
    pub channel_source: Option<String>,
    pub gtid_executed: String,
}

/// A simulated deployment and the operator actions on it.
#[derive(Debug, Clone)]
pub struct Lab {
    world: World,
}

impl Lab {
    /// Seed the servers, groups and metadata described by `spec`.
    ///
    /// # Errors
    ///
    /// A cluster of size zero, or a seeding step the world refuses.
    pub fn new(spec: &LabSpec) -> Result<Self, LabError> {
        let mut state = WorldState::new(Utc::now());
        let mut port = spec.base_port;
        let mut next_address = || {
            let address = format!("{}:{port}", spec.host);
            port += 1;
            address
        };
        for cluster in &spec.clusters {
            let addresses: Vec<String> = (0..cluster.size).map(|_| next_address()).collect();
            seed_cluster(&mut state, cluster, &addresses)?;
        }
        for _ in 0..spec.spare_servers {
            let address = next_address();
            let server = Server::new(&address, &Uuid::new_v4().to_string(), &spec.spare_version);
            state.servers.insert(address, server);
        }
        info!(
            clusters = spec.clusters.len(),
            spares = spec.spare_servers,
            "lab created"
        );
        Ok(Self::from_world(World::new(state)))
    }

    #[must_use]
    pub const fn from_world(world: World) -> Self {
        Self { world }
    }

    #[must_use]
    pub const fn world(&self) -> &World {
        &self.world
    }

    #[must_use]
    pub fn connector(&self) -> Arc<SimConnector> {
        Arc::new(SimConnector::new(self.world.clone()))
    }

    /// # Errors
    ///
    /// Unreadable or malformed file.
    pub fn load(path: &Path) -> Result<Self, LabError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_world(World::from_json(&text)?))
    }

    /// # Errors
    ///
    /// Unwritable file.
    pub fn save(&self, path: &Path) -> Result<(), LabError> {
        std::fs::write(path, self.world.to_json()?)?;
        Ok(())
    }

    /// Addresses of the instances the metadata records for cluster `name`.
    #[must_use]
    pub fn addresses_of(&self, name: &str) -> Vec<String> {
        self.world.read(|s| {
            s.servers
                .values()
                .filter_map(|server| server.data.metadata.as_ref())
                .flat_map(|metadata| metadata.clusters.values())
                .find(|c| c.name == name)
                .map(|c| c.instances.iter().map(|i| i.address.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// The group primary of cluster `name`, if it has a working group.
    #[must_use]
    pub fn primary_of(&self, name: &str) -> Option<String> {
        let addresses = self.addresses_of(name);
        self.world.read(|s| {
            addresses
                .iter()
                .filter_map(|a| s.servers.get(a)?.group.clone())
                .find_map(|group| s.online_primary(&group).map(str::to_string))
        })
    }

    /// Addresses of servers that belong to no group.
    #[must_use]
    pub fn spare_servers(&self) -> Vec<String> {
        self.world.read(|s| {
            s.servers
                .values()
                .filter(|server| server.group.is_none() && server.data.metadata.is_none())
                .map(|server| server.address.clone())
                .collect()
        })
    }

    pub fn partition(&self, address: &str) {
        info!(address, "partitioning server");
        self.world.update(|s| s.partition(address));
    }

    pub fn heal(&self, address: &str) {
        info!(address, "healing server");
        self.world.update(|s| s.heal(address));
    }

    pub fn partition_cluster(&self, name: &str) {
        let addresses = self.addresses_of(name);
        self.world.update(|s| addresses.iter().for_each(|a| s.partition(a)));
    }

    pub fn heal_cluster(&self, name: &str) {
        let addresses = self.addresses_of(name);
        self.world.update(|s| addresses.iter().for_each(|a| s.heal(a)));
    }

    /// `STOP GROUP_REPLICATION` on one member; the rest of the group
    /// elects a new primary if needed.
    ///
    /// # Errors
    ///
    /// Unreachable server.
    pub fn stop_group_replication(&self, address: &str) -> Result<(), clusterset_core::Error> {
        info!(address, "stopping group replication");
        self.world.update(|s| s.leave_group(address))
    }

    /// A client insert into `table`; returns the GTID.
    ///
    /// # Errors
    ///
    /// Whatever the server refuses the write with.
    pub fn write(&self, address: &str, table: &str) -> Result<String, clusterset_core::Error> {
        self.world.update(|s| {
            s.commit(
                address,
                Change::Insert {
                    table: table.to_string(),
                },
            )
        })
    }

    /// An insert that slips past `super_read_only`, the classic source of
    /// errant transactions.
    ///
    /// # Errors
    ///
    /// Unreachable server.
    pub fn write_errant(&self, address: &str, table: &str) -> Result<String, clusterset_core::Error> {
        self.world.update(|s| {
            s.commit_unchecked(
                address,
                Change::Insert {
                    table: table.to_string(),
                },
            )
        })
    }

    /// `STOP REPLICA` on the ClusterSet channel of `address`.
    pub fn stop_channel(&self, address: &str) {
        self.world.update(|s| {
            if let Some(channel) = s
                .servers
                .get_mut(address)
                .and_then(|server| server.channels.get_mut(CLUSTER_SET_CHANNEL))
            {
                channel.io_running = false;
                channel.sql_running = false;
                channel.connected = false;
                channel.source_uuid = None;
            }
        });
    }

    /// `PURGE BINARY LOGS` up to now.
    pub fn purge(&self, address: &str) {
        self.world.update(|s| s.purge(address));
    }

    /// Snapshot of one server.
    #[must_use]
    pub fn server(&self, address: &str) -> Option<Server> {
        self.world.read(|s| s.servers.get(address).cloned())
    }

    /// The metadata as `address` has it.
    #[must_use]
    pub fn metadata(&self, address: &str) -> Option<MetadataState> {
        self.server(address).and_then(|s| s.data.metadata)
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.world.read(|s| s.journal.clone())
    }

    #[must_use]
    pub fn overview(&self) -> Vec<ServerSummary> {
        self.world.read(|s| {
            s.servers
                .values()
                .map(|server| {
                    let role = server.group.as_ref().and_then(|_| {
                        s.group_view(&server.address)
                            .into_iter()
                            .find(|(a, _, _)| *a == server.address)
                            .map(|(_, _, role)| role)
                    });
                    ServerSummary {
                        address: server.address.clone(),
                        reachable: server.reachable,
                        group: server.group.clone(),
                        primary: role == Some(MemberRole::Primary),
                        super_read_only: server.super_read_only(),
                        channel_source: server
                            .channels
                            .get(CLUSTER_SET_CHANNEL)
                            .map(crate::world::Channel::source_address),
                        gtid_executed: server.executed.to_string(),
                    }
                })
                .collect()
        })
    }
}

fn seed_cluster(state: &mut WorldState, spec: &ClusterSpec, addresses: &[String]) -> Result<(), LabError> {
    let Some(primary) = addresses.first() else {
        return Err(clusterset_core::Error::new(
            clusterset_core::ErrorCode::InvalidOption,
            format!("cluster '{}' needs at least one member", spec.name),
        )
        .into());
    };
    for address in addresses {
        let mut server = Server::new(address, &Uuid::new_v4().to_string(), &spec.version);
        if !spec.single_primary {
            server
                .sysvars
                .insert("group_replication_single_primary_mode".into(), "OFF".into());
        }
        state.servers.insert(address.clone(), server);
    }

    let group_name = Uuid::new_v4().to_string();
    let view_change_uuid = spec.view_change_uuid.then(|| Uuid::new_v4().to_string());
    state.bootstrap_group(primary, &group_name, view_change_uuid.as_deref())?;
    for address in &addresses[1..] {
        state.join_group(address, &group_name)?;
    }

    let cluster_id = Uuid::new_v4().to_string();
    let instances = addresses
        .iter()
        .filter_map(|a| {
            state.servers.get(a).map(|s| InstanceRecord {
                address: a.clone(),
                uuid: s.uuid.clone(),
            })
        })
        .collect();
    let mut metadata = MetadataState::default();
    metadata.clusters.insert(
        cluster_id.clone(),
        ClusterRecord {
            id: cluster_id.clone(),
            name: spec.name.clone(),
            group_name,
            view_change_uuid,
            instances,
            attributes: Attributes::new(),
            routing_options: Attributes::new(),
        },
    );
    for router in &spec.routers {
        metadata.routers.insert(
            router.clone(),
            RouterRecord {
                name: router.clone(),
                cluster_id: Some(cluster_id.clone()),
                cluster_set_id: None,
                options: Attributes::new(),
            },
        );
    }
    state.commit(
        primary,
        Change::CreateMetadata {
            version: spec.metadata_version.clone(),
            state: metadata,
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lab_has_one_cluster_and_spares() {
        let lab = Lab::new(&LabSpec::default()).expect("seedable");
        let members = lab.addresses_of("cluster1");
        assert_eq!(members, ["127.0.0.1:3310", "127.0.0.1:3311", "127.0.0.1:3312"]);
        assert_eq!(lab.primary_of("cluster1").as_deref(), Some("127.0.0.1:3310"));
        assert_eq!(lab.spare_servers(), ["127.0.0.1:3313", "127.0.0.1:3314"]);
        for member in &members {
            let metadata = lab.metadata(member).expect("replicated to every member");
            assert_eq!(metadata.clusters.len(), 1);
        }
        assert!(lab.metadata("127.0.0.1:3313").is_none());
    }

    #[test]
    fn secondaries_refuse_writes() {
        let lab = Lab::new(&LabSpec::default()).expect("seedable");
        lab.write("127.0.0.1:3310", "t").expect("primary is writable");
        let err = lab.write("127.0.0.1:3311", "t").expect_err("secondary is read-only");
        assert_eq!(err.server_code(), Some(clusterset_core::ServerError::READ_ONLY));
        assert_eq!(lab.server("127.0.0.1:3312").map(|s| s.data.tables["t"]), Some(1));
    }

    #[test]
    fn lab_survives_a_round_trip_through_json() {
        let lab = Lab::new(&LabSpec::default()).expect("seedable");
        lab.partition("127.0.0.1:3311");
        let json = lab.world().to_json().expect("serializable");
        let back = Lab::from_world(World::from_json(&json).expect("deserializable"));
        assert_eq!(back.overview(), lab.overview());
        assert!(!back.server("127.0.0.1:3311").expect("known").reachable);
    }
}
