//! Client sessions against the simulated servers.

use std::sync::Arc;
use std::time::Duration;

use clusterset_core::instance::{
    parse_bool, split_address, ChannelInfo, GroupMember, GroupSeed, Row, SourceOptions, ThreadState, VarScope, Version,
};
use clusterset_core::lock::LockMode;
use clusterset_core::{Connector, Error, Instance, InstanceRef, MetadataStore, Result, ServerError};
use tracing::trace;

use crate::gtid::Gtids;
use crate::metadata::SimMetadataStore;
use crate::world::{Change, Channel, EventKind, World, WorldState};

/// `ER_UNKNOWN_SYSTEM_VARIABLE`
const UNKNOWN_VARIABLE: u32 = 1193;
/// `ER_INCORRECT_GLOBAL_LOCAL_VAR`
const READ_ONLY_VARIABLE: u32 = 1238;
/// `ER_MALFORMED_GTID_SET_SPECIFICATION`
const MALFORMED_GTID_SET: u32 = 1772;
/// `ER_REPLICA_CHANNEL_DOES_NOT_EXIST`
const NO_SUCH_CHANNEL: u32 = 3074;
/// `ER_REPLICA_CHANNEL_OPERATION_NOT_ALLOWED`
const CHANNEL_RUNNING: u32 = 3081;
/// `ER_SP_DOES_NOT_EXIST`
const NO_SUCH_FUNCTION: u32 = 1305;

fn malformed(err: &Error) -> Error {
    ServerError::new(MALFORMED_GTID_SET, format!("Malformed GTID set specification: {err}")).into()
}

fn parse_gtids(text: &str) -> Result<Gtids> {
    Gtids::parse(text).map_err(|err| malformed(&err))
}

/// Opens [`SimInstance`] sessions and metadata stores on a [`World`].
#[derive(Debug, Clone)]
pub struct SimConnector {
    world: World,
}

impl SimConnector {
    #[must_use]
    pub const fn new(world: World) -> Self {
        Self { world }
    }

    /// A concrete session, for callers that need more than [`Instance`].
    ///
    /// # Errors
    ///
    /// `CR_CONN_HOST_ERROR` if the server is down or unknown.
    pub fn open(&self, address: &str) -> Result<SimInstance> {
        let (connection, epoch) = self.world.update(|s| s.open_connection(address))?;
        trace!(address, connection, "session opened");
        Ok(SimInstance {
            world: self.world.clone(),
            address: address.to_string(),
            connection,
            epoch,
        })
    }
}

impl Connector for SimConnector {
    fn connect(&self, address: &str) -> Result<InstanceRef> {
        Ok(Arc::new(self.open(address)?))
    }

    fn metadata_store(&self, server: &InstanceRef) -> Result<Arc<dyn MetadataStore>> {
        Ok(Arc::new(SimMetadataStore::new(self.world.clone(), &server.address())))
    }
}

/// One session on one simulated server. Dropping it ends the session and
/// releases whatever it held.
#[derive(Debug)]
pub struct SimInstance {
    world: World,
    address: String,
    connection: u64,
    epoch: u64,
}

impl Drop for SimInstance {
    fn drop(&mut self) {
        let (address, connection) = (&self.address, self.connection);
        self.world.update(|s| s.close_connection(address, connection));
    }
}

impl SimInstance {
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection
    }

    fn read<T>(&self, f: impl FnOnce(&WorldState) -> Result<T>) -> Result<T> {
        self.world.read(|s| {
            s.session(&self.address, self.epoch)?;
            f(s)
        })
    }

    fn update<T>(&self, f: impl FnOnce(&mut WorldState) -> Result<T>) -> Result<T> {
        self.world.update(|s| {
            s.session(&self.address, self.epoch)?;
            f(s)
        })
    }

    fn channel_mut<'a>(&self, state: &'a mut WorldState, channel: &str) -> Result<&'a mut Channel> {
        state
            .session_mut(&self.address, self.epoch)?
            .channels
            .get_mut(channel)
            .ok_or_else(|| no_channel(channel))
    }

    fn insert(&self, table: &str) -> Result<()> {
        let table = table.trim_matches('`').to_string();
        self.update(|s| s.commit(&self.address, Change::Insert { table }).map(|_| ()))
    }
}

fn no_channel(channel: &str) -> Error {
    ServerError::new(NO_SUCH_CHANNEL, format!("Replication channel '{channel}' does not exist.")).into()
}

fn syntax_error(sql: &str) -> Error {
    ServerError::new(
        ServerError::PARSE_ERROR,
        format!("You have an error in your SQL syntax near '{sql}'"),
    )
    .into()
}

fn channel_info(name: &str, channel: &Channel) -> ChannelInfo {
    let io_state = match (channel.io_running, channel.connected) {
        (true, true) => ThreadState::On,
        (true, false) => ThreadState::Connecting,
        (false, _) => ThreadState::Off,
    };
    ChannelInfo {
        name: name.to_string(),
        source_host: channel.source_host.clone(),
        source_port: channel.source_port,
        user: channel.user.clone(),
        source_uuid: channel.source_uuid.clone(),
        io_state,
        sql_state: if channel.sql_running {
            ThreadState::On
        } else {
            ThreadState::Off
        },
        io_error: channel.io_error.clone(),
        sql_error: channel.sql_error.clone(),
        received_gtid_set: channel.received.to_string(),
    }
}

/// `name = value` of a `SET` statement.
fn assignment(rest: &str) -> Option<(String, String)> {
    let (name, value) = rest.split_once('=')?;
    let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
    Some((name.trim().to_ascii_lowercase(), value.to_string()))
}

impl Instance for SimInstance {
    fn address(&self) -> String {
        self.address.clone()
    }

    /// Understands user inserts, `SET GLOBAL|PERSIST` and the global read
    /// lock; anything else is a syntax error.
    fn execute(&self, sql: &str) -> Result<()> {
        let statement = sql.trim().trim_end_matches(';').trim();
        let upper = statement.to_ascii_uppercase();
        if upper == "FLUSH TABLES WITH READ LOCK" {
            return self.flush_tables_with_read_lock();
        }
        if upper == "UNLOCK TABLES" {
            return self.unlock_tables();
        }
        if upper.starts_with("INSERT INTO ") {
            let table = statement["INSERT INTO ".len()..]
                .split(|c: char| c.is_whitespace() || c == '(')
                .next()
                .unwrap_or_default();
            return self.insert(table);
        }
        for (keyword, scope) in [
            ("SET GLOBAL ", VarScope::Global),
            ("SET PERSIST ", VarScope::Persist),
            ("SET PERSIST_ONLY ", VarScope::PersistOnly),
        ] {
            if upper.starts_with(keyword) {
                let (name, value) = assignment(&statement[keyword.len()..]).ok_or_else(|| syntax_error(statement))?;
                return self.set_sysvar(&name, &value, scope);
            }
        }
        Err(syntax_error(statement))
    }

    /// Understands `SELECT @@[GLOBAL.]variable`.
    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let statement = sql.trim().trim_end_matches(';').trim();
        let upper = statement.to_ascii_uppercase();
        let Some(variable) = upper
            .strip_prefix("SELECT @@GLOBAL.")
            .or_else(|| upper.strip_prefix("SELECT @@"))
        else {
            return Err(syntax_error(statement));
        };
        let value = self.get_sysvar(&variable.to_ascii_lowercase())?;
        Ok(vec![Row(vec![value])])
    }

    fn get_sysvar(&self, name: &str) -> Result<Option<String>> {
        self.read(|s| {
            let server = s.session(&self.address, self.epoch)?;
            server
                .sysvar(name)
                .map(Some)
                .ok_or_else(|| ServerError::new(UNKNOWN_VARIABLE, format!("Unknown system variable '{name}'")).into())
        })
    }

    fn set_sysvar(&self, name: &str, value: &str, scope: VarScope) -> Result<()> {
        let name = name.to_ascii_lowercase();
        if matches!(name.as_str(), "server_uuid" | "version" | "gtid_executed" | "gtid_purged") {
            return Err(ServerError::new(READ_ONLY_VARIABLE, format!("Variable '{name}' is a read only variable")).into());
        }
        self.update(|s| {
            let server = s.session_mut(&self.address, self.epoch)?;
            if scope != VarScope::Global {
                server.persisted.insert(name.clone(), value.to_string());
            }
            if scope == VarScope::PersistOnly {
                return Ok(());
            }
            match name.as_str() {
                "super_read_only" => server.set_super_read_only(parse_bool(value)),
                "read_only" if !parse_bool(value) => {
                    server.set_super_read_only(false);
                    server.sysvars.insert(name, "OFF".into());
                }
                _ => {
                    server.sysvars.insert(name, value.to_string());
                }
            }
            Ok(())
        })
    }

    fn uuid(&self) -> Result<String> {
        self.read(|s| Ok(s.session(&self.address, self.epoch)?.uuid.clone()))
    }

    fn version(&self) -> Result<Version> {
        self.read(|s| {
            let text = &s.session(&self.address, self.epoch)?.version;
            Version::parse(text).ok_or_else(|| ServerError::new(UNKNOWN_VARIABLE, format!("unparsable version '{text}'")).into())
        })
    }

    fn gtid_executed(&self) -> Result<String> {
        self.read(|s| Ok(s.session(&self.address, self.epoch)?.executed.to_string()))
    }

    fn gtid_purged(&self) -> Result<String> {
        self.read(|s| Ok(s.session(&self.address, self.epoch)?.purged.to_string()))
    }

    fn received_gtid_set(&self, channel: &str) -> Result<String> {
        self.read(|s| {
            Ok(s.session(&self.address, self.epoch)?
                .channels
                .get(channel)
                .map(|c| c.received.to_string())
                .unwrap_or_default())
        })
    }

    fn gtid_subtract(&self, a: &str, b: &str) -> Result<String> {
        self.read(|_| Ok(parse_gtids(a)?.subtract(&parse_gtids(b)?).to_string()))
    }

    fn gtid_is_subset(&self, a: &str, b: &str) -> Result<bool> {
        self.read(|_| Ok(parse_gtids(a)?.is_subset(&parse_gtids(b)?)))
    }

    fn wait_for_executed_gtid_set(&self, gtid_set: &str, timeout: Duration) -> Result<bool> {
        let wanted = parse_gtids(gtid_set)?;
        let reached = self.world.wait_until(timeout, |s| match s.session(&self.address, self.epoch) {
            Ok(server) => wanted.is_subset(&server.executed).then_some(Ok(())),
            Err(err) => Some(Err(err)),
        });
        match reached {
            Some(Ok(())) => Ok(true),
            Some(Err(err)) => Err(err),
            None => Ok(false),
        }
    }

    fn inject_empty_transaction(&self, gtid: &str) -> Result<()> {
        let (uuid, number) = gtid
            .trim()
            .rsplit_once(':')
            .and_then(|(uuid, n)| Some((uuid.to_string(), n.parse::<u64>().ok()?)))
            .ok_or_else(|| {
                Error::from(ServerError::new(
                    MALFORMED_GTID_SET,
                    format!("Malformed GTID specification '{gtid}'"),
                ))
            })?;
        self.update(|s| {
            s.check_writable(&self.address)?;
            s.commit_as(&self.address, &uuid, number, Change::Empty)
        })
    }

    fn has_lock_service(&self) -> Result<bool> {
        self.read(|s| Ok(s.session(&self.address, self.epoch)?.lock_service))
    }

    fn install_lock_service(&self) -> Result<()> {
        self.update(|s| {
            let server = s.session_mut(&self.address, self.epoch)?;
            if server.super_read_only() {
                return Err(ServerError::new(
                    ServerError::READ_ONLY,
                    "The MySQL server is running with the --super-read-only option so it cannot execute this statement",
                )
                .into());
            }
            server.lock_service = true;
            Ok(())
        })
    }

    fn get_lock(&self, namespace: &str, name: &str, mode: LockMode, timeout: Duration) -> Result<()> {
        let acquired = self.world.wait_until(timeout, |s| {
            let server = match s.session(&self.address, self.epoch) {
                Ok(server) => server,
                Err(err) => return Some(Err(err)),
            };
            if !server.lock_service {
                return Some(Err(ServerError::new(
                    NO_SUCH_FUNCTION,
                    "FUNCTION service_get_write_locks does not exist",
                )
                .into()));
            }
            s.try_lock(&self.address, self.connection, namespace, name, mode)
                .then_some(Ok(()))
        });
        acquired.unwrap_or_else(|| {
            Err(ServerError::new(ServerError::LOCK_TIMEOUT, "Service lock wait timeout exceeded.").into())
        })
    }

    fn release_locks(&self, namespace: &str) -> Result<()> {
        self.update(|s| {
            s.release_locks(&self.address, self.connection, namespace);
            Ok(())
        })
    }

    fn replication_channels(&self) -> Result<Vec<ChannelInfo>> {
        self.read(|s| {
            Ok(s.session(&self.address, self.epoch)?
                .channels
                .iter()
                .map(|(name, channel)| channel_info(name, channel))
                .collect())
        })
    }

    fn replication_channel(&self, channel: &str) -> Result<Option<ChannelInfo>> {
        self.read(|s| {
            Ok(s.session(&self.address, self.epoch)?
                .channels
                .get(channel)
                .map(|c| channel_info(channel, c)))
        })
    }

    fn change_replication_source(&self, channel: &str, source: &SourceOptions) -> Result<()> {
        self.update(|s| {
            let server = s.session_mut(&self.address, self.epoch)?;
            if let Some(existing) = server.channels.get_mut(channel) {
                if existing.io_running || existing.sql_running {
                    return Err(ServerError::new(
                        CHANNEL_RUNNING,
                        "This operation cannot be performed with running replication threads; run STOP REPLICA first",
                    )
                    .into());
                }
                existing.source_host.clone_from(&source.host);
                existing.source_port = source.port;
                existing.auto_failover = source.auto_failover;
                existing.source_uuid = None;
                existing.connected = false;
                if let Some((user, password)) = &source.credentials {
                    existing.user.clone_from(user);
                    existing.password.clone_from(password);
                }
                return Ok(());
            }
            let (user, password) = source.credentials.clone().unwrap_or_default();
            server.channels.insert(
                channel.to_string(),
                Channel {
                    source_host: source.host.clone(),
                    source_port: source.port,
                    user,
                    password,
                    auto_failover: source.auto_failover,
                    io_running: false,
                    sql_running: false,
                    connected: false,
                    source_uuid: None,
                    io_error: None,
                    sql_error: None,
                    received: Gtids::new(),
                },
            );
            Ok(())
        })
    }

    fn start_replica(&self, channel: &str) -> Result<()> {
        self.update(|s| {
            let c = self.channel_mut(s, channel)?;
            c.io_running = true;
            c.sql_running = true;
            c.io_error = None;
            c.sql_error = None;
            Ok(())
        })
    }

    fn stop_replica(&self, channel: &str) -> Result<()> {
        self.update(|s| {
            let c = self.channel_mut(s, channel)?;
            c.io_running = false;
            c.sql_running = false;
            c.connected = false;
            c.source_uuid = None;
            Ok(())
        })
    }

    fn reset_replica_all(&self, channel: &str) -> Result<()> {
        self.update(|s| {
            let server = s.session_mut(&self.address, self.epoch)?;
            match server.channels.get(channel) {
                None => Ok(()),
                Some(c) if c.io_running || c.sql_running => Err(ServerError::new(
                    CHANNEL_RUNNING,
                    "This operation cannot be performed with running replication threads; run STOP REPLICA first",
                )
                .into()),
                Some(_) => {
                    server.channels.remove(channel);
                    server.failover_sources.remove(channel);
                    Ok(())
                }
            }
        })
    }

    fn group_members(&self) -> Result<Vec<GroupMember>> {
        self.read(|s| {
            s.session(&self.address, self.epoch)?;
            Ok(s.group_view(&self.address)
                .into_iter()
                .filter_map(|(address, state, role)| {
                    let server = s.servers.get(&address)?;
                    let (host, port) = split_address(&address);
                    Some(GroupMember {
                        uuid: server.uuid.clone(),
                        host,
                        port,
                        state,
                        role,
                        version: Version::parse(&server.version),
                    })
                })
                .collect())
        })
    }

    fn set_member_action(&self, action: &str, enabled: bool) -> Result<()> {
        self.update(|s| {
            s.session_mut(&self.address, self.epoch)?
                .member_actions
                .insert(action.to_string(), enabled);
            Ok(())
        })
    }

    fn member_action_enabled(&self, action: &str) -> Result<bool> {
        self.read(|s| Ok(s.session(&self.address, self.epoch)?.member_action(action)))
    }

    fn bootstrap_group(&self, seed: &GroupSeed) -> Result<()> {
        self.update(|s| s.bootstrap_group(&self.address, &seed.group_name, Some(&seed.view_change_uuid)))
    }

    fn leave_group(&self) -> Result<()> {
        self.update(|s| s.leave_group(&self.address))
    }

    fn create_replication_user(
        &self,
        user: &str,
        host: &str,
        password: Option<&str>,
        cert_issuer: Option<&str>,
    ) -> Result<()> {
        let change = Change::CreateUser {
            user: user.to_string(),
            host: host.to_string(),
            password: password.map(str::to_string),
            cert_issuer: cert_issuer.map(str::to_string),
        };
        self.update(|s| s.commit(&self.address, change).map(|_| ()))
    }

    fn set_user_password(&self, user: &str, host: &str, password: &str) -> Result<()> {
        let change = Change::AlterUser {
            user: user.to_string(),
            host: host.to_string(),
            password: password.to_string(),
        };
        self.update(|s| s.commit(&self.address, change).map(|_| ()))
    }

    fn drop_user(&self, user: &str, host: &str) -> Result<()> {
        let change = Change::DropUser {
            user: user.to_string(),
            host: host.to_string(),
        };
        self.update(|s| s.commit(&self.address, change).map(|_| ()))
    }

    fn add_managed_failover_source(&self, channel: &str, group_name: &str, address: &str) -> Result<()> {
        self.update(|s| {
            s.session_mut(&self.address, self.epoch)?
                .failover_sources
                .entry(channel.to_string())
                .or_default()
                .insert(group_name.to_string(), address.to_string());
            Ok(())
        })
    }

    fn delete_managed_failover_source(&self, channel: &str, group_name: &str) -> Result<()> {
        self.update(|s| {
            let server = s.session_mut(&self.address, self.epoch)?;
            if let Some(sources) = server.failover_sources.get_mut(channel) {
                sources.remove(group_name);
                if sources.is_empty() {
                    server.failover_sources.remove(channel);
                }
            }
            Ok(())
        })
    }

    fn flush_tables_with_read_lock(&self) -> Result<()> {
        self.update(|s| {
            s.read_lock(&self.address, self.connection);
            Ok(())
        })
    }

    fn unlock_tables(&self) -> Result<()> {
        self.update(|s| {
            s.read_unlock(&self.address, self.connection);
            Ok(())
        })
    }
}

impl SimInstance {
    /// Journal entries of this session.
    #[must_use]
    pub fn events(&self) -> Vec<EventKind> {
        self.world.read(|s| {
            s.journal
                .iter()
                .filter(|e| e.connection == self.connection)
                .map(|e| e.kind.clone())
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::Server;

    fn world() -> World {
        let mut state = WorldState::default();
        state.servers.insert("h:1".into(), Server::new("h:1", "11111111-1111-4111-8111-111111111111", "8.0.30"));
        state.servers.insert("h:2".into(), Server::new("h:2", "22222222-2222-4222-8222-222222222222", "8.0.30"));
        World::new(state)
    }

    #[test]
    fn raw_statements() {
        let connector = SimConnector::new(world());
        let server = connector.open("h:1").expect("reachable");
        server.execute("INSERT INTO t1 VALUES (1)").expect("writable");
        server.execute("SET PERSIST skip_replica_start = ON").expect("settable");
        assert_eq!(server.query_scalar("SELECT @@GLOBAL.skip_replica_start").expect("known").as_deref(), Some("ON"));
        assert_eq!(
            server.gtid_executed().expect("readable"),
            "11111111-1111-4111-8111-111111111111:1"
        );
        let err = server.execute("DROP DATABASE x").expect_err("not understood");
        assert_eq!(err.server_code(), Some(ServerError::PARSE_ERROR));
        assert!(server.get_sysvar("no_such_variable").is_err());
    }

    #[test]
    fn partition_kills_sessions() {
        let world = world();
        let connector = SimConnector::new(world.clone());
        let server = connector.open("h:1").expect("reachable");
        world.update(|s| s.partition("h:1"));
        assert!(connector.connect("h:1").is_err_and(|e| e.is_network()));
        world.update(|s| s.heal("h:1"));
        assert!(server.uuid().is_err_and(|e| e.is_network()));
        assert!(connector.connect("h:1").is_ok());
    }

    #[test]
    fn read_lock_blocks_other_writers_until_the_session_ends() {
        let connector = SimConnector::new(world());
        let holder = connector.open("h:1").expect("reachable");
        let writer = connector.open("h:1").expect("reachable");
        holder.flush_tables_with_read_lock().expect("lockable");
        assert!(writer.execute("INSERT INTO t VALUES (1)").is_err());
        drop(holder);
        writer.execute("INSERT INTO t VALUES (1)").expect("unlocked");
    }

    #[test]
    fn channel_replicates_with_valid_credentials() {
        let connector = SimConnector::new(world());
        let source = connector.open("h:1").expect("reachable");
        let replica = connector.open("h:2").expect("reachable");
        source.create_replication_user("repl", "%", Some("secret"), None).expect("writable");
        source.execute("INSERT INTO t VALUES (1)").expect("writable");

        let mut options = SourceOptions::for_address("h:1");
        options.credentials = Some(("repl".into(), Some("wrong".into())));
        replica.change_replication_source("ch", &options).expect("configurable");
        replica.start_replica("ch").expect("startable");
        let info = replica.replication_channel("ch").expect("readable").expect("exists");
        assert_eq!(info.io_state, ThreadState::Off);
        assert_eq!(info.io_error.map(|e| e.code), Some(crate::world::ACCESS_DENIED_ERROR));

        options.credentials = Some(("repl".into(), Some("secret".into())));
        replica.change_replication_source("ch", &options).expect("configurable");
        replica.start_replica("ch").expect("startable");
        let info = replica.replication_channel("ch").expect("readable").expect("exists");
        assert_eq!(info.io_state, ThreadState::On);
        assert_eq!(info.source_uuid.as_deref(), Some("11111111-1111-4111-8111-111111111111"));
        assert_eq!(replica.gtid_executed().expect("readable"), source.gtid_executed().expect("readable"));
    }
}
