//! The server capability set consumed by the orchestration core.
//!
//! An [`Instance`] is one exclusive connection to one MySQL server. Only
//! [`address`](Instance::address), [`execute`](Instance::execute) and
//! [`query`](Instance::query) are required: every other capability has a
//! provided implementation that issues the corresponding SQL, so a real
//! client only has to run statements. Simulated servers override the
//! provided methods with native behaviour.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AsyncReplicationOptions, SslMode};
use crate::error::{Error, Result, ServerError};
use crate::lock::LockMode;

/// Shared handle to a connection.
pub type InstanceRef = Arc<dyn Instance>;

/// A `major.minor.patch` server version.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `8.0.30`, `8.0.30-log` or `8.4`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let core = text.split(|c: char| c == '-' || c.is_whitespace()).next()?;
        let mut parts = core.split('.').map(u32::from_str);
        let major = parts.next()?.ok()?;
        let minor = parts.next().unwrap_or(Ok(0)).ok()?;
        let patch = parts.next().unwrap_or(Ok(0)).ok()?;
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Where a `SET` lands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VarScope {
    Global,
    Persist,
    PersistOnly,
}

impl VarScope {
    const fn keyword(self) -> &'static str {
        match self {
            Self::Global => "GLOBAL",
            Self::Persist => "PERSIST",
            Self::PersistOnly => "PERSIST_ONLY",
        }
    }
}

/// One result row; `None` is SQL `NULL`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row(pub Vec<Option<String>>);

impl Row {
    #[must_use]
    pub fn get(&self, column: usize) -> Option<&str> {
        self.0.get(column).and_then(Option::as_deref)
    }

    #[must_use]
    pub fn get_u64(&self, column: usize) -> Option<u64> {
        self.get(column).and_then(|v| v.trim().parse().ok())
    }

    #[must_use]
    pub fn get_bool(&self, column: usize) -> bool {
        self.get(column).is_some_and(parse_bool)
    }
}

/// Interpret a server boolean (`ON`, `1`, `YES`, `TRUE`).
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_uppercase().as_str(),
        "1" | "ON" | "YES" | "TRUE"
    )
}

/// `MEMBER_STATE` of a Group Replication member.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemberState {
    Online,
    Recovering,
    Offline,
    Error,
    Unreachable,
}

impl MemberState {
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.to_ascii_uppercase().as_str() {
            "ONLINE" => Self::Online,
            "RECOVERING" => Self::Recovering,
            "ERROR" => Self::Error,
            "UNREACHABLE" => Self::Unreachable,
            _ => Self::Offline,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Recovering => "RECOVERING",
            Self::Offline => "OFFLINE",
            Self::Error => "ERROR",
            Self::Unreachable => "UNREACHABLE",
        }
    }
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemberRole {
    Primary,
    Secondary,
}

/// A row of `performance_schema.replication_group_members`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub uuid: String,
    pub host: String,
    pub port: u16,
    pub state: MemberState,
    pub role: MemberRole,
    pub version: Option<Version>,
}

impl GroupMember {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `SERVICE_STATE` of a replication thread.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    On,
    Off,
    Connecting,
}

impl ThreadState {
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.to_ascii_uppercase().as_str() {
            "ON" => Self::On,
            "CONNECTING" => Self::Connecting,
            _ => Self::Off,
        }
    }
}

/// Configuration and status of one replication channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub source_host: String,
    pub source_port: u16,
    pub user: String,
    /// UUID of the server the receiver is connected to, if any.
    pub source_uuid: Option<String>,
    pub io_state: ThreadState,
    pub sql_state: ThreadState,
    pub io_error: Option<ServerError>,
    pub sql_error: Option<ServerError>,
    pub received_gtid_set: String,
}

impl ChannelInfo {
    #[must_use]
    pub fn source_address(&self) -> String {
        format!("{}:{}", self.source_host, self.source_port)
    }
}

/// Arguments of `CHANGE REPLICATION SOURCE`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOptions {
    pub host: String,
    pub port: u16,
    /// `None` keeps the credentials already configured on the channel.
    pub credentials: Option<(String, Option<String>)>,
    pub auto_failover: bool,
    pub options: AsyncReplicationOptions,
}

impl SourceOptions {
    /// Split `host:port`, defaulting the port to 3306.
    #[must_use]
    pub fn for_address(address: &str) -> Self {
        let (host, port) = split_address(address);
        Self {
            host,
            port,
            credentials: None,
            auto_failover: false,
            options: AsyncReplicationOptions::default(),
        }
    }

    /// The full statement for `channel`.
    #[must_use]
    pub fn change_source_sql(&self, channel: &str) -> String {
        let mut clauses = vec![
            format!("SOURCE_HOST={}", quote(&self.host)),
            format!("SOURCE_PORT={}", self.port),
        ];
        if let Some((user, password)) = &self.credentials {
            clauses.push(format!("SOURCE_USER={}", quote(user)));
            if let Some(password) = password {
                clauses.push(format!("SOURCE_PASSWORD={}", quote(password)));
            }
        }
        clauses.push("SOURCE_AUTO_POSITION=1".to_string());
        clauses.push(format!(
            "SOURCE_CONNECTION_AUTO_FAILOVER={}",
            u8::from(self.auto_failover)
        ));
        let opts = &self.options;
        if let Some(v) = opts.connect_retry {
            clauses.push(format!("SOURCE_CONNECT_RETRY={v}"));
        }
        if let Some(v) = opts.retry_count {
            clauses.push(format!("SOURCE_RETRY_COUNT={v}"));
        }
        if let Some(v) = opts.heartbeat_period {
            clauses.push(format!("SOURCE_HEARTBEAT_PERIOD={v}"));
        }
        if let Some(v) = &opts.compression_algorithms {
            clauses.push(format!("SOURCE_COMPRESSION_ALGORITHMS={}", quote(v)));
        }
        if let Some(v) = opts.zstd_compression_level {
            clauses.push(format!("SOURCE_ZSTD_COMPRESSION_LEVEL={v}"));
        }
        match opts.ssl_mode {
            SslMode::Disabled => clauses.push("SOURCE_SSL=0".to_string()),
            SslMode::Auto | SslMode::Required => clauses.push("SOURCE_SSL=1".to_string()),
            SslMode::VerifyCa => {
                clauses.push("SOURCE_SSL=1".to_string());
                clauses.push("SOURCE_SSL_VERIFY_SERVER_CERT=0".to_string());
            }
            SslMode::VerifyIdentity => {
                clauses.push("SOURCE_SSL=1".to_string());
                clauses.push("SOURCE_SSL_VERIFY_SERVER_CERT=1".to_string());
            }
        }
        format!(
            "CHANGE REPLICATION SOURCE TO {} FOR CHANNEL {}",
            clauses.join(", "),
            quote(channel)
        )
    }
}

/// What a freshly bootstrapped group is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSeed {
    pub group_name: String,
    pub view_change_uuid: String,
}

/// Split `host:port`, defaulting the port to 3306.
#[must_use]
pub fn split_address(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(3306)),
        None => (address.to_string(), 3306),
    }
}

/// Quote a string literal for SQL.
#[must_use]
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Quote a value for `SET`: numbers and `ON`/`OFF` stay bare.
#[must_use]
pub fn sql_value(value: &str) -> String {
    let bare = value.parse::<i64>().is_ok()
        || matches!(value.to_ascii_uppercase().as_str(), "ON" | "OFF");
    if bare {
        value.to_string()
    } else {
        quote(value)
    }
}

fn user_at_host(user: &str, host: &str) -> String {
    format!("{}@{}", quote(user), quote(host))
}

fn channel_status_sql(filter: Option<&str>) -> String {
    let mut sql = String::from(
        "SELECT c.channel_name, c.host, c.port, c.user, s.source_uuid, s.service_state, \
         a.service_state, s.last_error_number, s.last_error_message, \
         w.last_error_number, w.last_error_message, s.received_transaction_set \
         FROM performance_schema.replication_connection_configuration c \
         LEFT JOIN performance_schema.replication_connection_status s USING (channel_name) \
         LEFT JOIN performance_schema.replication_applier_status a USING (channel_name) \
         LEFT JOIN performance_schema.replication_applier_status_by_worker w USING (channel_name)",
    );
    if let Some(channel) = filter {
        sql.push_str(" WHERE c.channel_name = ");
        sql.push_str(&quote(channel));
    }
    sql
}

fn row_error(row: &Row, code_col: usize, msg_col: usize) -> Option<ServerError> {
    match row.get_u64(code_col) {
        Some(0) | None => None,
        Some(code) => Some(ServerError::new(
            u32::try_from(code).unwrap_or(u32::MAX),
            row.get(msg_col).unwrap_or_default(),
        )),
    }
}

fn channel_from_row(row: &Row) -> ChannelInfo {
    ChannelInfo {
        name: row.get(0).unwrap_or_default().to_string(),
        source_host: row.get(1).unwrap_or_default().to_string(),
        source_port: row
            .get_u64(2)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(3306),
        user: row.get(3).unwrap_or_default().to_string(),
        source_uuid: row.get(4).filter(|u| !u.is_empty()).map(str::to_string),
        io_state: ThreadState::parse(row.get(5).unwrap_or("OFF")),
        sql_state: ThreadState::parse(row.get(6).unwrap_or("OFF")),
        io_error: row_error(row, 7, 8),
        sql_error: row_error(row, 9, 10),
        received_gtid_set: row.get(11).unwrap_or_default().to_string(),
    }
}

fn member_from_row(row: &Row) -> GroupMember {
    GroupMember {
        uuid: row.get(0).unwrap_or_default().to_string(),
        host: row.get(1).unwrap_or_default().to_string(),
        port: row
            .get_u64(2)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(3306),
        state: MemberState::parse(row.get(3).unwrap_or("OFFLINE")),
        role: if row.get(4) == Some("PRIMARY") {
            MemberRole::Primary
        } else {
            MemberRole::Secondary
        },
        version: row.get(5).and_then(Version::parse),
    }
}

const LOCKING_UDFS: [&str; 3] = [
    "service_get_read_locks",
    "service_get_write_locks",
    "service_release_locks",
];

/// One exclusive connection to a MySQL server.
pub trait Instance: Send + Sync {
    /// `host:port` of the server.
    fn address(&self) -> String;

    /// Run a statement that returns no rows.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn execute(&self, sql: &str) -> Result<()>;

    /// Run a statement and collect its rows.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// First column of the first row.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn query_scalar(&self, sql: &str) -> Result<Option<String>> {
        Ok(self
            .query(sql)?
            .first()
            .and_then(|row| row.get(0))
            .map(str::to_string))
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn get_sysvar(&self, name: &str) -> Result<Option<String>> {
        self.query_scalar(&format!("SELECT @@GLOBAL.{name}"))
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn set_sysvar(&self, name: &str, value: &str, scope: VarScope) -> Result<()> {
        self.execute(&format!(
            "SET {} {name} = {}",
            scope.keyword(),
            sql_value(value)
        ))
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn uuid(&self) -> Result<String> {
        Ok(self.get_sysvar("server_uuid")?.unwrap_or_default())
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn version(&self) -> Result<Version> {
        let text = self.get_sysvar("version")?.unwrap_or_default();
        Version::parse(&text).ok_or_else(|| {
            Error::from(ServerError::new(
                ServerError::PARSE_ERROR,
                format!("unrecognized server version '{text}'"),
            ))
        })
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn gtid_executed(&self) -> Result<String> {
        Ok(self.get_sysvar("gtid_executed")?.unwrap_or_default())
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn gtid_purged(&self) -> Result<String> {
        Ok(self.get_sysvar("gtid_purged")?.unwrap_or_default())
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn received_gtid_set(&self, channel: &str) -> Result<String> {
        Ok(self
            .query_scalar(&format!(
                "SELECT received_transaction_set FROM \
                 performance_schema.replication_connection_status WHERE channel_name = {}",
                quote(channel)
            ))?
            .unwrap_or_default())
    }

    /// `GTID_SUBTRACT(a, b)`
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn gtid_subtract(&self, a: &str, b: &str) -> Result<String> {
        Ok(self
            .query_scalar(&format!("SELECT GTID_SUBTRACT({}, {})", quote(a), quote(b)))?
            .unwrap_or_default())
    }

    /// `GTID_SUBSET(a, b)`: every transaction of `a` is in `b`.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn gtid_is_subset(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self
            .query_scalar(&format!("SELECT GTID_SUBSET({}, {})", quote(a), quote(b)))?
            .is_some_and(|v| parse_bool(&v)))
    }

    /// Block until `gtid_set` is executed. Returns `false` on timeout.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn wait_for_executed_gtid_set(&self, gtid_set: &str, timeout: Duration) -> Result<bool> {
        let result = self.query_scalar(&format!(
            "SELECT WAIT_FOR_EXECUTED_GTID_SET({}, {})",
            quote(gtid_set),
            timeout.as_secs()
        ))?;
        Ok(result.as_deref().map(str::trim) == Some("0"))
    }

    /// Commit an empty transaction with the given GTID.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn inject_empty_transaction(&self, gtid: &str) -> Result<()> {
        self.execute(&format!("SET GTID_NEXT = {}", quote(gtid)))?;
        let committed = self
            .execute("START TRANSACTION")
            .and_then(|()| self.execute("COMMIT"));
        let reset = self.execute("SET GTID_NEXT = 'AUTOMATIC'");
        committed.and(reset)
    }

    /// Whether the locking service UDFs are installed.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn has_lock_service(&self) -> Result<bool> {
        let names = LOCKING_UDFS.map(quote).join(", ");
        let count = self
            .query_scalar(&format!(
                "SELECT COUNT(*) FROM mysql.func WHERE dl = 'locking_service.so' \
                 AND name IN ({names})"
            ))?
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        Ok(count == LOCKING_UDFS.len())
    }

    /// Install the locking service UDFs without writing them to the binary log.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn install_lock_service(&self) -> Result<()> {
        self.execute("SET SESSION sql_log_bin = 0")?;
        let mut result = Ok(());
        for udf in LOCKING_UDFS {
            result = self.execute(&format!(
                "CREATE FUNCTION IF NOT EXISTS {udf} RETURNS INT SONAME 'locking_service.so'"
            ));
            if result.is_err() {
                break;
            }
        }
        let restored = self.execute("SET SESSION sql_log_bin = 1");
        result.and(restored)
    }

    /// # Errors
    ///
    /// Returns the server error, `ER_LOCKING_SERVICE_TIMEOUT` on timeout.
    fn get_lock(&self, namespace: &str, name: &str, mode: LockMode, timeout: Duration) -> Result<()> {
        let function = match mode {
            LockMode::Shared => "service_get_read_locks",
            LockMode::Exclusive => "service_get_write_locks",
        };
        self.query(&format!(
            "SELECT {function}({}, {}, {})",
            quote(namespace),
            quote(name),
            timeout.as_secs()
        ))
        .map(|_| ())
    }

    /// Release every lock this connection holds in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn release_locks(&self, namespace: &str) -> Result<()> {
        self.query(&format!("SELECT service_release_locks({})", quote(namespace)))
            .map(|_| ())
    }

    /// Every configured replication channel.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn replication_channels(&self) -> Result<Vec<ChannelInfo>> {
        Ok(self
            .query(&channel_status_sql(None))?
            .iter()
            .map(channel_from_row)
            .collect())
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn replication_channel(&self, channel: &str) -> Result<Option<ChannelInfo>> {
        Ok(self
            .query(&channel_status_sql(Some(channel)))?
            .first()
            .map(channel_from_row))
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn change_replication_source(&self, channel: &str, source: &SourceOptions) -> Result<()> {
        self.execute(&source.change_source_sql(channel))
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn start_replica(&self, channel: &str) -> Result<()> {
        self.execute(&format!("START REPLICA FOR CHANNEL {}", quote(channel)))
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn stop_replica(&self, channel: &str) -> Result<()> {
        self.execute(&format!("STOP REPLICA FOR CHANNEL {}", quote(channel)))
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn reset_replica_all(&self, channel: &str) -> Result<()> {
        self.execute(&format!("RESET REPLICA ALL FOR CHANNEL {}", quote(channel)))
    }

    /// Group membership as seen by this member.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn group_members(&self) -> Result<Vec<GroupMember>> {
        Ok(self
            .query(
                "SELECT member_id, member_host, member_port, member_state, member_role, \
                 member_version FROM performance_schema.replication_group_members",
            )?
            .iter()
            .map(member_from_row)
            .filter(|m| !m.uuid.is_empty())
            .collect())
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn set_member_action(&self, action: &str, enabled: bool) -> Result<()> {
        let function = if enabled {
            "group_replication_enable_member_action"
        } else {
            "group_replication_disable_member_action"
        };
        self.query(&format!(
            "SELECT {function}({}, 'AFTER_PRIMARY_ELECTION')",
            quote(action)
        ))
        .map(|_| ())
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn member_action_enabled(&self, action: &str) -> Result<bool> {
        Ok(self
            .query_scalar(&format!(
                "SELECT enabled FROM performance_schema.replication_group_member_actions \
                 WHERE name = {}",
                quote(action)
            ))?
            .is_some_and(|v| parse_bool(&v)))
    }

    /// Start a new single-primary group with this server as its only member.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn bootstrap_group(&self, seed: &GroupSeed) -> Result<()> {
        self.set_sysvar("group_replication_group_name", &seed.group_name, VarScope::Persist)?;
        self.set_sysvar(
            "group_replication_view_change_uuid",
            &seed.view_change_uuid,
            VarScope::Persist,
        )?;
        self.set_sysvar("group_replication_single_primary_mode", "ON", VarScope::Persist)?;
        self.set_sysvar("group_replication_bootstrap_group", "ON", VarScope::Global)?;
        let started = self.execute("START GROUP_REPLICATION");
        let reset = self.set_sysvar("group_replication_bootstrap_group", "OFF", VarScope::Global);
        started.and(reset)?;
        self.set_sysvar("group_replication_start_on_boot", "ON", VarScope::Persist)
    }

    /// Leave the group for good.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn leave_group(&self) -> Result<()> {
        self.execute("STOP GROUP_REPLICATION")?;
        self.set_sysvar("group_replication_start_on_boot", "OFF", VarScope::Persist)
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn create_replication_user(
        &self,
        user: &str,
        host: &str,
        password: Option<&str>,
        cert_issuer: Option<&str>,
    ) -> Result<()> {
        let mut sql = format!("CREATE USER IF NOT EXISTS {}", user_at_host(user, host));
        if let Some(password) = password {
            sql.push_str(&format!(" IDENTIFIED BY {}", quote(password)));
        }
        if let Some(issuer) = cert_issuer {
            sql.push_str(&format!(" REQUIRE ISSUER {}", quote(issuer)));
        }
        self.execute(&sql)?;
        self.execute(&format!(
            "GRANT REPLICATION SLAVE ON *.* TO {}",
            user_at_host(user, host)
        ))
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn set_user_password(&self, user: &str, host: &str, password: &str) -> Result<()> {
        self.execute(&format!(
            "ALTER USER {} IDENTIFIED BY {}",
            user_at_host(user, host),
            quote(password)
        ))
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn drop_user(&self, user: &str, host: &str) -> Result<()> {
        self.execute(&format!("DROP USER IF EXISTS {}", user_at_host(user, host)))
    }

    /// Register a group as a managed source of `channel`.
    ///
    /// # Errors
    ///
    /// Returns the server error.
    fn add_managed_failover_source(
        &self,
        channel: &str,
        group_name: &str,
        address: &str,
    ) -> Result<()> {
        let (host, port) = split_address(address);
        self.query(&format!(
            "SELECT asynchronous_connection_failover_add_managed({}, 'GroupReplication', {}, {}, {port}, '', 80, 60)",
            quote(channel),
            quote(group_name),
            quote(&host)
        ))
        .map(|_| ())
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn delete_managed_failover_source(&self, channel: &str, group_name: &str) -> Result<()> {
        self.query(&format!(
            "SELECT asynchronous_connection_failover_delete_managed({}, {})",
            quote(channel),
            quote(group_name)
        ))
        .map(|_| ())
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn flush_tables_with_read_lock(&self) -> Result<()> {
        self.execute("FLUSH TABLES WITH READ LOCK")
    }

    /// # Errors
    ///
    /// Returns the server error.
    fn unlock_tables(&self) -> Result<()> {
        self.execute("UNLOCK TABLES")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Records every statement and answers queries from a script.
    #[derive(Default)]
    pub struct RecordingInstance {
        pub statements: Mutex<Vec<String>>,
        pub answers: Mutex<VecDeque<Vec<Row>>>,
    }

    impl RecordingInstance {
        pub fn answer(&self, rows: Vec<Vec<Option<&str>>>) {
            let rows = rows
                .into_iter()
                .map(|r| Row(r.into_iter().map(|c| c.map(str::to_string)).collect()))
                .collect();
            self.answers.lock().unwrap().push_back(rows);
        }

        pub fn statements(&self) -> Vec<String> {
            self.statements.lock().unwrap().clone()
        }
    }

    impl Instance for RecordingInstance {
        fn address(&self) -> String {
            "recorder:3306".to_string()
        }

        fn execute(&self, sql: &str) -> Result<()> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(())
        }

        fn query(&self, sql: &str) -> Result<Vec<Row>> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(self.answers.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    #[test]
    fn version_parsing() {
        assert_eq!(Version::parse("8.0.30-log"), Some(Version::new(8, 0, 30)));
        assert_eq!(Version::parse("8.4"), Some(Version::new(8, 4, 0)));
        assert_eq!(Version::parse("garbage"), None);
        assert!(Version::new(8, 0, 27) < Version::new(8, 0, 30));
    }

    #[test]
    fn quoting_escapes_quotes() {
        assert_eq!(quote("it's"), "'it''s'");
        assert_eq!(sql_value("1"), "1");
        assert_eq!(sql_value("on"), "on");
        assert_eq!(sql_value("abc"), "'abc'");
    }

    #[test]
    fn change_source_statement() {
        let mut source = SourceOptions::for_address("db1:3310");
        source.credentials = Some(("repl".to_string(), Some("secret".to_string())));
        source.auto_failover = true;
        source.options.connect_retry = Some(3);
        let sql = source.change_source_sql("clusterset_replication");
        assert_eq!(
            sql,
            "CHANGE REPLICATION SOURCE TO SOURCE_HOST='db1', SOURCE_PORT=3310, \
             SOURCE_USER='repl', SOURCE_PASSWORD='secret', SOURCE_AUTO_POSITION=1, \
             SOURCE_CONNECTION_AUTO_FAILOVER=1, SOURCE_CONNECT_RETRY=3, SOURCE_SSL=1 \
             FOR CHANNEL 'clusterset_replication'"
        );
    }

    #[test]
    fn lock_service_install_suppresses_binlog() {
        let server = RecordingInstance::default();
        server.install_lock_service().unwrap();
        let statements = server.statements();
        assert_eq!(statements.first().unwrap(), "SET SESSION sql_log_bin = 0");
        assert_eq!(statements.last().unwrap(), "SET SESSION sql_log_bin = 1");
        assert_eq!(statements.len(), 5);
    }

    #[test]
    fn wait_for_gtids_reads_function_result() {
        let server = RecordingInstance::default();
        server.answer(vec![vec![Some("0")]]);
        server.answer(vec![vec![Some("1")]]);
        assert!(server
            .wait_for_executed_gtid_set("u:1", Duration::from_secs(2))
            .unwrap());
        assert!(!server
            .wait_for_executed_gtid_set("u:1", Duration::from_secs(2))
            .unwrap());
        assert_eq!(
            server.statements()[0],
            "SELECT WAIT_FOR_EXECUTED_GTID_SET('u:1', 2)"
        );
    }

    #[test]
    fn group_members_are_parsed() {
        let server = RecordingInstance::default();
        server.answer(vec![
            vec![
                Some("u1"),
                Some("h1"),
                Some("3310"),
                Some("ONLINE"),
                Some("PRIMARY"),
                Some("8.0.30"),
            ],
            vec![Some(""), Some(""), Some("3306"), Some("OFFLINE"), Some(""), None],
        ]);
        let members = server.group_members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].address(), "h1:3310");
        assert_eq!(members[0].role, MemberRole::Primary);
        assert_eq!(members[0].version, Some(Version::new(8, 0, 30)));
    }

    #[test]
    fn channel_rows_are_parsed() {
        let server = RecordingInstance::default();
        server.answer(vec![vec![
            Some("clusterset_replication"),
            Some("db1"),
            Some("3310"),
            Some("repl"),
            Some("uuid-1"),
            Some("ON"),
            Some("ON"),
            Some("0"),
            Some(""),
            Some("1045"),
            Some("denied"),
            Some("u:1-3"),
        ]]);
        let channel = server
            .replication_channel("clusterset_replication")
            .unwrap()
            .unwrap();
        assert_eq!(channel.source_address(), "db1:3310");
        assert_eq!(channel.io_state, ThreadState::On);
        assert!(channel.io_error.is_none());
        assert_eq!(channel.sql_error.as_ref().map(|e| e.code), Some(1045));
        assert_eq!(channel.received_gtid_set, "u:1-3");
    }
}
