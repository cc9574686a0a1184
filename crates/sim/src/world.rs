//! The simulated world: servers, groups and the transactions moving between them.
//!
//! Every server keeps its own binary log and its own copy of the replicated
//! data (user tables, accounts, the metadata schema). A transaction reaches
//! another server only by being applied there: eagerly between the online
//! members of a group with quorum, and through asynchronous channels between
//! clusters. After every statement the world is [settled](WorldState::settle):
//! elections, group sync and channel pumping run until nothing changes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clusterset_core::instance::{parse_bool, split_address, MemberRole, MemberState};
use clusterset_core::lock::LockMode;
use clusterset_core::metadata::{MetadataEdit, MetadataState};
use clusterset_core::replication::{ACTION_DISABLE_SUPER_READ_ONLY, ACTION_START_FAILOVER_CHANNELS};
use clusterset_core::{Result, ServerError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gtid::Gtids;

/// `ER_ACCESS_DENIED_ERROR`
pub const ACCESS_DENIED_ERROR: u32 = 1045;
/// `ER_SOURCE_FATAL_ERROR_READING_BINLOG`
pub const SOURCE_PURGED_ERROR: u32 = 1236;
/// `ER_CANT_EXECUTE_WITH_GLOBAL_READ_LOCK`
pub const GLOBAL_READ_LOCK_ERROR: u32 = 1223;
/// `ER_RUN_HOOK_ERROR`, a group without quorum refusing a commit.
pub const NO_QUORUM_ERROR: u32 = 3100;
/// `ER_NO_SUCH_TABLE`
pub const NO_SUCH_TABLE: u32 = 1146;

const MAX_SETTLE_ROUNDS: usize = 64;

/// A replication account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub password: Option<String>,
    pub cert_issuer: Option<String>,
}

/// What one transaction changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Empty,
    Insert {
        table: String,
    },
    CreateUser {
        user: String,
        host: String,
        password: Option<String>,
        cert_issuer: Option<String>,
    },
    AlterUser {
        user: String,
        host: String,
        password: String,
    },
    DropUser {
        user: String,
        host: String,
    },
    CreateMetadata {
        version: String,
        state: MetadataState,
    },
    Metadata {
        edits: Vec<MetadataEdit>,
    },
    DropMetadata,
}

/// A binary log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub uuid: String,
    pub number: u64,
    pub change: Change,
}

/// The replicated part of a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Data {
    /// Row count per user table.
    pub tables: BTreeMap<String, u64>,
    /// Keyed by `user@host`.
    pub users: BTreeMap<String, Account>,
    pub metadata: Option<MetadataState>,
    pub metadata_version: Option<String>,
}

impl Data {
    /// Apply `change`. Nothing changes on error.
    fn apply(&mut self, change: &Change) -> Result<()> {
        match change {
            Change::Empty => {}
            Change::Insert { table } => *self.tables.entry(table.clone()).or_default() += 1,
            Change::CreateUser {
                user,
                host,
                password,
                cert_issuer,
            } => {
                self.users.entry(user_key(user, host)).or_insert_with(|| Account {
                    password: password.clone(),
                    cert_issuer: cert_issuer.clone(),
                });
            }
            Change::AlterUser { user, host, password } => {
                let account = self.users.get_mut(&user_key(user, host)).ok_or_else(|| {
                    ServerError::new(1396, format!("Operation ALTER USER failed for '{user}'@'{host}'"))
                })?;
                account.password = Some(password.clone());
            }
            Change::DropUser { user, host } => {
                self.users.remove(&user_key(user, host));
            }
            Change::CreateMetadata { version, state } => {
                self.metadata = Some(state.clone());
                self.metadata_version = Some(version.clone());
            }
            Change::Metadata { edits } => {
                let mut state = self.metadata.clone().ok_or_else(no_metadata)?;
                for edit in edits {
                    state.apply(edit)?;
                }
                self.metadata = Some(state);
            }
            Change::DropMetadata => {
                self.metadata = None;
                self.metadata_version = None;
            }
        }
        Ok(())
    }
}

pub(crate) fn user_key(user: &str, host: &str) -> String {
    format!("{user}@{host}")
}

pub(crate) fn no_metadata() -> ServerError {
    ServerError::new(
        NO_SUCH_TABLE,
        "Table 'mysql_innodb_cluster_metadata.clusters' doesn't exist",
    )
}

/// An asynchronous replication channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub source_host: String,
    pub source_port: u16,
    pub user: String,
    pub password: Option<String>,
    pub auto_failover: bool,
    pub io_running: bool,
    pub sql_running: bool,
    /// The receiver is authenticated with its current source.
    pub connected: bool,
    pub source_uuid: Option<String>,
    pub io_error: Option<ServerError>,
    pub sql_error: Option<ServerError>,
    pub received: Gtids,
}

impl Channel {
    #[must_use]
    pub fn source_address(&self) -> String {
        format!("{}:{}", self.source_host, self.source_port)
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.source_uuid = None;
    }
}

/// One simulated `mysqld`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub address: String,
    pub uuid: String,
    pub version: String,
    pub reachable: bool,
    /// Bumped on every partition; sessions opened before it are gone.
    #[serde(default)]
    pub epoch: u64,
    pub sysvars: BTreeMap<String, String>,
    #[serde(default)]
    pub persisted: BTreeMap<String, String>,
    pub executed: Gtids,
    pub purged: Gtids,
    #[serde(default)]
    pub binlog: Vec<Transaction>,
    #[serde(default)]
    pub data: Data,
    /// Name of the group this server is a member of.
    pub group: Option<String>,
    #[serde(default)]
    pub member_actions: BTreeMap<String, bool>,
    #[serde(default)]
    pub channels: BTreeMap<String, Channel>,
    /// Managed failover sources: channel, then group name to seed address.
    #[serde(default)]
    pub failover_sources: BTreeMap<String, BTreeMap<String, String>>,
    pub lock_service: bool,
}

impl Server {
    #[must_use]
    pub fn new(address: &str, uuid: &str, version: &str) -> Self {
        let (host, port) = split_address(address);
        let port = port.to_string();
        let sysvars = [
            ("super_read_only", "OFF"),
            ("read_only", "OFF"),
            ("have_ssl", "YES"),
            ("skip_replica_start", "OFF"),
            ("group_replication_group_name", ""),
            ("group_replication_single_primary_mode", "ON"),
            ("group_replication_view_change_uuid", "AUTOMATIC"),
            ("group_replication_transaction_size_limit", "150000000"),
            ("report_host", host.as_str()),
            ("port", port.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            address: address.to_string(),
            uuid: uuid.to_string(),
            version: version.to_string(),
            reachable: true,
            epoch: 0,
            sysvars,
            persisted: BTreeMap::new(),
            executed: Gtids::new(),
            purged: Gtids::new(),
            binlog: Vec::new(),
            data: Data::default(),
            group: None,
            member_actions: BTreeMap::new(),
            channels: BTreeMap::new(),
            failover_sources: BTreeMap::new(),
            lock_service: true,
        }
    }

    #[must_use]
    pub fn super_read_only(&self) -> bool {
        self.sysvars.get("super_read_only").is_some_and(|v| parse_bool(v))
    }

    pub(crate) fn set_super_read_only(&mut self, on: bool) {
        let value = if on { "ON" } else { "OFF" };
        self.sysvars.insert("super_read_only".into(), value.into());
        if on {
            self.sysvars.insert("read_only".into(), "ON".into());
        }
    }

    /// A system variable as the server reports it.
    #[must_use]
    pub fn sysvar(&self, name: &str) -> Option<String> {
        match name.to_ascii_lowercase().as_str() {
            "server_uuid" => Some(self.uuid.clone()),
            "version" => Some(self.version.clone()),
            "gtid_executed" => Some(self.executed.to_string()),
            "gtid_purged" => Some(self.purged.to_string()),
            other => self.sysvars.get(other).cloned(),
        }
    }

    /// Member actions default to their Group Replication defaults.
    #[must_use]
    pub fn member_action(&self, action: &str) -> bool {
        self.member_actions
            .get(action)
            .copied()
            .unwrap_or(action == ACTION_DISABLE_SUPER_READ_ONLY)
    }
}

/// A Group Replication group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub view_change_uuid: Option<String>,
    /// Addresses in join order.
    pub members: Vec<String>,
    pub primary: Option<String>,
}

/// Something worth asserting on after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    LockAcquired { namespace: String, name: String },
    LocksReleased { namespace: String },
    ReadLocked,
    ReadUnlocked,
    PrimaryElected { group: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub connection: u64,
    pub server: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Holder {
    connection: u64,
    mode: LockMode,
}

/// Locking service state, per `(server, namespace, name)`.
#[derive(Debug, Default)]
struct LockTable(BTreeMap<(String, String, String), Vec<Holder>>);

impl LockTable {
    fn try_acquire(&mut self, server: &str, namespace: &str, name: &str, connection: u64, mode: LockMode) -> bool {
        let holders = self
            .0
            .entry((server.to_string(), namespace.to_string(), name.to_string()))
            .or_default();
        let compatible = holders.iter().all(|h| {
            h.connection == connection || (mode == LockMode::Shared && h.mode == LockMode::Shared)
        });
        if compatible {
            holders.push(Holder { connection, mode });
        }
        compatible
    }

    fn release(&mut self, server: &str, namespace: Option<&str>, connection: u64) {
        self.0.retain(|(s, ns, _), holders| {
            if s == server && namespace.is_none_or(|n| n == ns) {
                holders.retain(|h| h.connection != connection);
            }
            !holders.is_empty()
        });
    }

    fn release_connection(&mut self, connection: u64) {
        self.0.retain(|_, holders| {
            holders.retain(|h| h.connection != connection);
            !holders.is_empty()
        });
    }

    fn drop_server(&mut self, server: &str) {
        self.0.retain(|(s, _, _), _| s != server);
    }
}

/// Everything the simulation knows. Sessions, locks and the event journal
/// are not persisted.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldState {
    pub created_at: Option<DateTime<Utc>>,
    pub servers: BTreeMap<String, Server>,
    pub groups: BTreeMap<String, Group>,
    #[serde(skip)]
    locks: LockTable,
    #[serde(skip)]
    read_locks: BTreeMap<String, BTreeSet<u64>>,
    #[serde(skip)]
    next_connection: u64,
    #[serde(skip)]
    pub journal: Vec<Event>,
}

fn refused(address: &str) -> ServerError {
    ServerError::new(
        ServerError::CONN_HOST_ERROR,
        format!("Can't connect to MySQL server on '{address}'"),
    )
}

fn lost(address: &str) -> ServerError {
    ServerError::new(
        ServerError::SERVER_LOST,
        format!("Lost connection to MySQL server at '{address}'"),
    )
}

impl WorldState {
    /// An empty world stamped with its creation time.
    #[must_use]
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at: Some(created_at),
            ..Self::default()
        }
    }

    /// A reachable server.
    ///
    /// # Errors
    ///
    /// `CR_SERVER_LOST` if it is down or unknown.
    pub fn server(&self, address: &str) -> Result<&Server> {
        self.servers
            .get(address)
            .filter(|s| s.reachable)
            .ok_or_else(|| lost(address).into())
    }

    /// # Errors
    ///
    /// `CR_SERVER_LOST` if it is down or unknown.
    pub fn server_mut(&mut self, address: &str) -> Result<&mut Server> {
        self.servers
            .get_mut(address)
            .filter(|s| s.reachable)
            .ok_or_else(|| lost(address).into())
    }

    /// The server behind a session opened at `epoch`.
    pub(crate) fn session(&self, address: &str, epoch: u64) -> Result<&Server> {
        let server = self.server(address)?;
        if server.epoch == epoch {
            Ok(server)
        } else {
            Err(lost(address).into())
        }
    }

    pub(crate) fn session_mut(&mut self, address: &str, epoch: u64) -> Result<&mut Server> {
        let server = self.server_mut(address)?;
        if server.epoch == epoch {
            Ok(server)
        } else {
            Err(lost(address).into())
        }
    }

    /// Open a session: `(connection id, server epoch)`.
    pub(crate) fn open_connection(&mut self, address: &str) -> Result<(u64, u64)> {
        let epoch = self
            .servers
            .get(address)
            .filter(|s| s.reachable)
            .map(|s| s.epoch)
            .ok_or_else(|| refused(address))?;
        self.next_connection += 1;
        Ok((self.next_connection, epoch))
    }

    /// A session ended: its locks and read lock go with it.
    pub(crate) fn close_connection(&mut self, address: &str, connection: u64) {
        self.locks.release_connection(connection);
        if let Some(holders) = self.read_locks.get_mut(address) {
            holders.remove(&connection);
        }
    }

    pub(crate) fn record(&mut self, connection: u64, server: &str, kind: EventKind) {
        self.journal.push(Event {
            at: Utc::now(),
            connection,
            server: server.to_string(),
            kind,
        });
    }

    /// Cut a server off. Its sessions die with their locks.
    pub fn partition(&mut self, address: &str) {
        if let Some(server) = self.servers.get_mut(address) {
            server.reachable = false;
            server.epoch += 1;
            for channel in server.channels.values_mut() {
                channel.disconnect();
            }
        }
        self.locks.drop_server(address);
        self.read_locks.remove(address);
    }

    pub fn heal(&mut self, address: &str) {
        if let Some(server) = self.servers.get_mut(address) {
            server.reachable = true;
        }
    }

    // -- group replication ---------------------------------------------------

    /// State of `address` as seen by the members of `group`.
    #[must_use]
    pub fn member_state(&self, group: &str, address: &str) -> Option<MemberState> {
        let server = self.servers.get(address)?;
        if server.group.as_deref() != Some(group) {
            return None;
        }
        Some(if server.reachable {
            MemberState::Online
        } else {
            MemberState::Unreachable
        })
    }

    fn online_members(&self, group: &str) -> Vec<String> {
        self.groups.get(group).map_or_else(Vec::new, |g| {
            g.members
                .iter()
                .filter(|m| self.member_state(group, m) == Some(MemberState::Online))
                .cloned()
                .collect()
        })
    }

    #[must_use]
    pub fn has_quorum(&self, group: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|g| self.online_members(group).len() * 2 > g.members.len())
    }

    /// The primary of a group that can take writes.
    #[must_use]
    pub fn online_primary(&self, group: &str) -> Option<&str> {
        let primary = self.groups.get(group)?.primary.as_deref()?;
        (self.has_quorum(group) && self.member_state(group, primary) == Some(MemberState::Online)).then_some(primary)
    }

    /// Members of `address`'s group with their state and role, as
    /// `replication_group_members` shows them.
    #[must_use]
    pub fn group_view(&self, address: &str) -> Vec<(String, MemberState, MemberRole)> {
        let Some(group) = self.servers.get(address).and_then(|s| s.group.as_deref()) else {
            return Vec::new();
        };
        let Some(g) = self.groups.get(group) else {
            return Vec::new();
        };
        g.members
            .iter()
            .filter_map(|m| {
                let state = self.member_state(group, m)?;
                let role = if g.primary.as_deref() == Some(m.as_str()) {
                    MemberRole::Primary
                } else {
                    MemberRole::Secondary
                };
                Some((m.clone(), state, role))
            })
            .collect()
    }

    /// Start a new group with `address` as its only member and primary.
    ///
    /// # Errors
    ///
    /// `ER_GROUP_REPLICATION_RUNNING` if the server already is a member.
    pub fn bootstrap_group(&mut self, address: &str, name: &str, view_change_uuid: Option<&str>) -> Result<()> {
        let server = self.server_mut(address)?;
        if server.group.is_some() {
            return Err(ServerError::new(3093, "The START GROUP_REPLICATION command failed since the group is already running.").into());
        }
        server.group = Some(name.to_string());
        server.set_super_read_only(true);
        server
            .sysvars
            .insert("group_replication_group_name".into(), name.to_string());
        server.sysvars.insert(
            "group_replication_view_change_uuid".into(),
            view_change_uuid.unwrap_or("AUTOMATIC").to_string(),
        );
        self.groups.insert(
            name.to_string(),
            Group {
                name: name.to_string(),
                view_change_uuid: view_change_uuid.map(str::to_string),
                members: vec![address.to_string()],
                primary: Some(address.to_string()),
            },
        );
        self.take_primary_role(address);
        self.log_view_change(name, address)
    }

    /// Add `address` to an existing group as a secondary.
    ///
    /// # Errors
    ///
    /// Unreachable server or unknown group.
    pub fn join_group(&mut self, address: &str, name: &str) -> Result<()> {
        let view_change_uuid = self
            .groups
            .get(name)
            .ok_or_else(|| ServerError::new(3092, format!("Group '{name}' does not exist")))?
            .view_change_uuid
            .clone();
        let server = self.server_mut(address)?;
        server.group = Some(name.to_string());
        server.set_super_read_only(true);
        server
            .sysvars
            .insert("group_replication_group_name".into(), name.to_string());
        server.sysvars.insert(
            "group_replication_view_change_uuid".into(),
            view_change_uuid.unwrap_or_else(|| "AUTOMATIC".into()),
        );
        if let Some(group) = self.groups.get_mut(name) {
            group.members.push(address.to_string());
        }
        self.settle();
        let primary = self.online_primary(name).map(str::to_string);
        match primary {
            Some(primary) => self.log_view_change(name, &primary),
            None => Ok(()),
        }
    }

    /// `STOP GROUP_REPLICATION`: the server stays read-only.
    ///
    /// # Errors
    ///
    /// Unreachable server.
    pub fn leave_group(&mut self, address: &str) -> Result<()> {
        let server = self.server_mut(address)?;
        let Some(name) = server.group.take() else {
            return Ok(());
        };
        server.set_super_read_only(true);
        let mut remaining = Vec::new();
        if let Some(group) = self.groups.get_mut(&name) {
            group.members.retain(|m| m != address);
            if group.primary.as_deref() == Some(address) {
                group.primary = None;
            }
            remaining.clone_from(&group.members);
        }
        if remaining.is_empty() {
            self.groups.remove(&name);
            return Ok(());
        }
        self.settle();
        let primary = self.online_primary(&name).map(str::to_string);
        match primary {
            Some(primary) => self.log_view_change(&name, &primary),
            None => Ok(()),
        }
    }

    /// A view change event, logged under the view-change UUID when the group
    /// has one.
    fn log_view_change(&mut self, group: &str, primary: &str) -> Result<()> {
        let uuid = self
            .groups
            .get(group)
            .and_then(|g| g.view_change_uuid.clone())
            .unwrap_or_else(|| group.to_string());
        let number = self.server(primary)?.executed.next(&uuid);
        self.commit_as(primary, &uuid, number, Change::Empty)?;
        self.settle();
        Ok(())
    }

    /// The member actions of a freshly elected primary.
    fn take_primary_role(&mut self, address: &str) {
        let Some(server) = self.servers.get_mut(address) else {
            return;
        };
        if server.member_action(ACTION_DISABLE_SUPER_READ_ONLY) {
            server.set_super_read_only(false);
        }
        if server.member_action(ACTION_START_FAILOVER_CHANNELS) {
            for channel in server.channels.values_mut().filter(|c| c.auto_failover) {
                channel.io_running = true;
                channel.sql_running = true;
            }
        }
    }

    // -- writes --------------------------------------------------------------

    /// Whether a client statement may write on `address`.
    ///
    /// # Errors
    ///
    /// The error the server would return.
    pub fn check_writable(&self, address: &str) -> Result<()> {
        let server = self.server(address)?;
        if let Some(group) = &server.group {
            if !self.has_quorum(group) {
                return Err(ServerError::new(
                    NO_QUORUM_ERROR,
                    "Error on observer while running replication hook 'before_commit'.",
                )
                .into());
            }
        }
        if server.super_read_only() {
            return Err(ServerError::new(
                ServerError::READ_ONLY,
                "The MySQL server is running with the --super-read-only option so it cannot execute this statement",
            )
            .into());
        }
        if self.read_locks.get(address).is_some_and(|h| !h.is_empty()) {
            return Err(ServerError::new(
                GLOBAL_READ_LOCK_ERROR,
                "Can't execute the query because you have a conflicting read lock",
            )
            .into());
        }
        Ok(())
    }

    /// Commit a client transaction on `address` and return its GTID.
    ///
    /// # Errors
    ///
    /// Not writable, or the change does not apply.
    pub fn commit(&mut self, address: &str, change: Change) -> Result<String> {
        self.check_writable(address)?;
        self.commit_unchecked(address, change)
    }

    /// Commit ignoring `super_read_only`, as with `SET sql_log_bin` tricks or
    /// an operator who turned the fence off for a moment.
    ///
    /// # Errors
    ///
    /// The change does not apply.
    pub fn commit_unchecked(&mut self, address: &str, change: Change) -> Result<String> {
        let server = self.server(address)?;
        let uuid = server.group.clone().unwrap_or_else(|| server.uuid.clone());
        let number = server.executed.next(&uuid);
        self.commit_as(address, &uuid, number, change)?;
        self.settle();
        Ok(format!("{uuid}:{number}"))
    }

    /// Commit with an explicit GTID. Already executed GTIDs are skipped.
    pub(crate) fn commit_as(&mut self, address: &str, uuid: &str, number: u64, change: Change) -> Result<()> {
        let server = self.server_mut(address)?;
        if server.executed.contains(uuid, number) {
            return Ok(());
        }
        server.data.apply(&change)?;
        server.executed.insert(uuid, number);
        server.binlog.push(Transaction {
            uuid: uuid.to_ascii_lowercase(),
            number,
            change,
        });
        Ok(())
    }

    /// Apply a transaction that arrived through replication.
    fn apply_replicated(&mut self, address: &str, trx: &Transaction) -> Result<bool> {
        let server = self.server_mut(address)?;
        if server.executed.contains(&trx.uuid, trx.number) {
            return Ok(false);
        }
        server.data.apply(&trx.change)?;
        server.executed.insert(&trx.uuid, trx.number);
        server.binlog.push(trx.clone());
        Ok(true)
    }

    /// Forget the binary log: everything executed becomes purged.
    pub fn purge(&mut self, address: &str) {
        if let Some(server) = self.servers.get_mut(address) {
            server.purged = server.executed.clone();
            server.binlog.clear();
        }
    }

    // -- locking -------------------------------------------------------------

    pub(crate) fn try_lock(&mut self, address: &str, connection: u64, namespace: &str, name: &str, mode: LockMode) -> bool {
        let acquired = self.locks.try_acquire(address, namespace, name, connection, mode);
        if acquired {
            self.record(
                connection,
                address,
                EventKind::LockAcquired {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                },
            );
        }
        acquired
    }

    pub(crate) fn release_locks(&mut self, address: &str, connection: u64, namespace: &str) {
        self.locks.release(address, Some(namespace), connection);
        self.record(
            connection,
            address,
            EventKind::LocksReleased {
                namespace: namespace.to_string(),
            },
        );
    }

    pub(crate) fn read_lock(&mut self, address: &str, connection: u64) {
        self.read_locks.entry(address.to_string()).or_default().insert(connection);
        self.record(connection, address, EventKind::ReadLocked);
    }

    pub(crate) fn read_unlock(&mut self, address: &str, connection: u64) {
        let held = self
            .read_locks
            .get_mut(address)
            .is_some_and(|holders| holders.remove(&connection));
        if held {
            self.record(connection, address, EventKind::ReadUnlocked);
        }
    }

    // -- settling ------------------------------------------------------------

    /// Run elections, group sync and channels until nothing moves.
    pub fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let elected = self.run_elections();
            let synced = self.sync_groups();
            let pumped = self.pump_channels();
            if !(elected || synced || pumped) {
                return;
            }
        }
        warn!("replication did not settle");
    }

    fn run_elections(&mut self) -> bool {
        let mut changed = false;
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for name in names {
            if !self.has_quorum(&name) {
                continue;
            }
            let online = self.online_members(&name);
            let current = self.groups.get(&name).and_then(|g| g.primary.clone());
            let primary = match current.filter(|p| online.contains(p)) {
                Some(primary) => primary,
                None => {
                    let Some(elected) = online.first().cloned() else {
                        continue;
                    };
                    debug!(group = %name, primary = %elected, "primary elected");
                    if let Some(group) = self.groups.get_mut(&name) {
                        group.primary = Some(elected.clone());
                    }
                    self.take_primary_role(&elected);
                    self.record(0, &elected, EventKind::PrimaryElected { group: name.clone() });
                    changed = true;
                    elected
                }
            };
            // Group Replication keeps every secondary read-only.
            for member in online.iter().filter(|m| **m != primary) {
                if let Some(server) = self.servers.get_mut(member) {
                    if !server.super_read_only() {
                        server.set_super_read_only(true);
                        for channel in server.channels.values_mut().filter(|c| c.auto_failover) {
                            channel.io_running = false;
                            channel.sql_running = false;
                            channel.disconnect();
                        }
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    fn sync_groups(&mut self) -> bool {
        let mut changed = false;
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for name in names {
            if !self.has_quorum(&name) {
                continue;
            }
            let online = self.online_members(&name);
            if let Some(primary) = self.online_primary(&name).map(str::to_string) {
                let (actions, sources) = match self.servers.get(&primary) {
                    Some(p) => (p.member_actions.clone(), p.failover_sources.clone()),
                    None => continue,
                };
                for member in online.iter().filter(|m| **m != primary) {
                    if let Some(server) = self.servers.get_mut(member) {
                        if server.member_actions != actions || server.failover_sources != sources {
                            server.member_actions.clone_from(&actions);
                            server.failover_sources.clone_from(&sources);
                            changed = true;
                        }
                    }
                }
            }
            for receiver in &online {
                for donor in online.iter().filter(|d| *d != receiver) {
                    changed |= self.copy_missing(donor, receiver, &name);
                }
            }
        }
        changed
    }

    /// Distributed recovery: apply what `donor` has and `receiver` lacks.
    /// When the donor purged some of it, the receiver is cloned from the donor.
    fn copy_missing(&mut self, donor: &str, receiver: &str, group: &str) -> bool {
        let (Some(d), Some(r)) = (self.servers.get(donor), self.servers.get(receiver)) else {
            return false;
        };
        if !d.purged.subtract(&r.executed).is_empty() {
            debug!(group, donor, receiver, "provisioning member by cloning the donor");
            let (executed, purged, data) = (d.executed.clone(), d.purged.clone(), d.data.clone());
            if let Some(r) = self.servers.get_mut(receiver) {
                r.executed = r.executed.union(&executed);
                r.purged = r.purged.union(&purged);
                r.data = data;
            }
            return true;
        }
        let missing: Vec<Transaction> = d
            .binlog
            .iter()
            .filter(|t| !r.executed.contains(&t.uuid, t.number))
            .cloned()
            .collect();
        let mut changed = false;
        for trx in &missing {
            match self.apply_replicated(receiver, trx) {
                Ok(applied) => changed |= applied,
                Err(err) => warn!(group, receiver, %err, "group member could not apply a transaction"),
            }
        }
        changed
    }

    fn pump_channels(&mut self) -> bool {
        let targets: Vec<(String, String)> = self
            .servers
            .values()
            .filter(|s| s.reachable)
            .flat_map(|s| {
                s.channels
                    .iter()
                    .filter(|(_, c)| c.io_running)
                    .map(|(name, _)| (s.address.clone(), name.clone()))
            })
            .collect();
        let mut changed = false;
        for (address, channel) in targets {
            changed |= self.pump(&address, &channel);
        }
        changed
    }

    /// Where a managed auto-failover channel should move, if anywhere: only
    /// when its source is gone or no longer the primary of its group.
    fn failover_target(&self, address: &str, channel: &str, current: &str) -> Option<String> {
        let sources = self.servers.get(address)?.failover_sources.get(channel)?;
        let current_server = self.servers.get(current).filter(|s| s.reachable);
        for group in sources.keys() {
            let Some(primary) = self.online_primary(group) else {
                continue;
            };
            if primary == current || primary == address {
                return None;
            }
            let stale = match current_server {
                None => true,
                Some(s) => s.group.as_deref() == Some(group.as_str()),
            };
            return stale.then(|| primary.to_string());
        }
        None
    }

    fn pump(&mut self, address: &str, name: &str) -> bool {
        let Some(mut channel) = self.servers.get(address).and_then(|s| s.channels.get(name)).cloned() else {
            return false;
        };
        let before = channel.clone();

        if channel.auto_failover {
            if let Some(target) = self.failover_target(address, name, &channel.source_address()) {
                debug!(replica = address, source = %target, "channel failing over");
                let (host, port) = split_address(&target);
                channel.source_host = host;
                channel.source_port = port;
                channel.disconnect();
            }
        }

        let source_address = channel.source_address();
        let transactions = match self.receive(&mut channel, address, &source_address) {
            Some(trx) => trx,
            None => {
                return self.store_channel(address, name, channel, &before);
            }
        };
        let mut changed = self.store_channel(address, name, channel, &before);
        if transactions.is_empty() {
            return changed;
        }
        let sql_running = self
            .servers
            .get(address)
            .and_then(|s| s.channels.get(name))
            .is_some_and(|c| c.sql_running);
        if !sql_running {
            return changed;
        }
        for trx in &transactions {
            match self.apply_replicated(address, trx) {
                Ok(applied) => changed |= applied,
                Err(err) => {
                    warn!(replica = address, %err, "applier stopped");
                    if let Some(c) = self.servers.get_mut(address).and_then(|s| s.channels.get_mut(name)) {
                        c.sql_running = false;
                        c.sql_error = Some(ServerError::new(1032, err.to_string()));
                    }
                    return true;
                }
            }
        }
        changed
    }

    /// Connect the receiver if needed and fetch what the replica lacks.
    /// `None` when nothing can be received.
    fn receive(&self, channel: &mut Channel, address: &str, source_address: &str) -> Option<Vec<Transaction>> {
        let Some(source) = self.servers.get(source_address).filter(|s| s.reachable) else {
            channel.disconnect();
            channel.io_error = Some(ServerError::new(
                ServerError::CONN_HOST_ERROR,
                format!("error connecting to source '{}@{source_address}'", channel.user),
            ));
            return None;
        };
        if !channel.connected {
            if let Err(err) = authenticate(source, channel) {
                channel.io_error = Some(err);
                channel.io_running = false;
                return None;
            }
            channel.connected = true;
            channel.source_uuid = Some(source.uuid.clone());
            channel.io_error = None;
        }
        let replica = self.servers.get(address)?;
        let missing = source.executed.subtract(&replica.executed);
        if !missing.intersect(&source.purged).is_empty() {
            channel.disconnect();
            channel.io_running = false;
            channel.io_error = Some(ServerError::new(
                SOURCE_PURGED_ERROR,
                "Cannot replicate because the source purged required binary logs.",
            ));
            return None;
        }
        channel.received = channel.received.union(&missing);
        Some(
            source
                .binlog
                .iter()
                .filter(|t| missing.contains(&t.uuid, t.number))
                .cloned()
                .collect(),
        )
    }

    fn store_channel(&mut self, address: &str, name: &str, channel: Channel, before: &Channel) -> bool {
        if channel == *before {
            return false;
        }
        if let Some(slot) = self.servers.get_mut(address).and_then(|s| s.channels.get_mut(name)) {
            *slot = channel;
        }
        true
    }
}

fn authenticate(source: &Server, channel: &Channel) -> core::result::Result<(), ServerError> {
    let denied = || {
        ServerError::new(
            ACCESS_DENIED_ERROR,
            format!("Access denied for user '{}' (using password: {})", channel.user, if channel.password.is_some() { "YES" } else { "NO" }),
        )
    };
    let account = source
        .data
        .users
        .iter()
        .find(|(key, _)| key.rsplit_once('@').is_some_and(|(user, _)| user == channel.user))
        .map(|(_, account)| account)
        .ok_or_else(denied)?;
    match &account.password {
        Some(password) if channel.password.as_ref() != Some(password) => Err(denied()),
        _ => Ok(()),
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<WorldState>,
    changed: Condvar,
}

/// Shared handle to the world. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct World {
    shared: Arc<Shared>,
}

impl World {
    #[must_use]
    pub fn new(mut state: WorldState) -> Self {
        state.settle();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read<T>(&self, f: impl FnOnce(&WorldState) -> T) -> T {
        f(&*self.lock())
    }

    /// Change the world, settle it and wake every waiter.
    pub fn update<T>(&self, f: impl FnOnce(&mut WorldState) -> T) -> T {
        let mut state = self.lock();
        let out = f(&mut *state);
        state.settle();
        drop(state);
        self.shared.changed.notify_all();
        out
    }

    /// Re-run `check` whenever the world changes, until it yields or
    /// `timeout` passes.
    pub fn wait_until<T>(&self, timeout: Duration, mut check: impl FnMut(&mut WorldState) -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(out) = check(&mut *state) {
                return Some(out);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.shared.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// # Errors
    ///
    /// Serialization errors.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.lock())
    }

    /// # Errors
    ///
    /// Malformed JSON.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::from_str(text)?))
    }
}
