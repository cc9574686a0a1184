//! Replication accounts and channel options of member clusters.

use tracing::info;

use crate::config::{AsyncReplicationOptions, AuthType, SslMode};
use crate::context::generate_password;
use crate::error::{Error, ErrorCode, Result};
use crate::instance::Instance;
use crate::metadata::{attr, ClusterRecord, ClusterSetRecord, Value};

/// The account a replica cluster's primary uses to pull from the global primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationAccount {
    pub user: String,
    pub host: String,
}

impl ReplicationAccount {
    /// Derived from the cluster id. Stable across rotations.
    #[must_use]
    pub fn for_cluster_id(cluster_id: &str) -> Self {
        let suffix: String = cluster_id
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(12)
            .collect();
        Self {
            user: format!("mysql_innodb_cs_{suffix}"),
            host: "%".to_string(),
        }
    }

    /// The account recorded for `cluster`, or the derived one.
    #[must_use]
    pub fn of(cluster: &ClusterRecord) -> Self {
        match (
            cluster.text_attribute(attr::REPLICATION_ACCOUNT_USER),
            cluster.text_attribute(attr::REPLICATION_ACCOUNT_HOST),
        ) {
            (Some(user), Some(host)) => Self {
                user: user.to_string(),
                host: host.to_string(),
            },
            _ => Self::for_cluster_id(&cluster.id),
        }
    }

    /// Metadata attributes that record the account.
    #[must_use]
    pub fn attributes(&self) -> [(&'static str, Value); 2] {
        [
            (attr::REPLICATION_ACCOUNT_USER, Value::from(self.user.as_str())),
            (attr::REPLICATION_ACCOUNT_HOST, Value::from(self.host.as_str())),
        ]
    }

    /// Create the account on `primary` and return its password, if it has one.
    ///
    /// # Errors
    ///
    /// Server errors.
    pub fn create(
        &self,
        primary: &dyn Instance,
        auth: AuthType,
        cert_issuer: Option<&str>,
        dry_run: bool,
    ) -> Result<Option<String>> {
        let password = auth.uses_password().then(generate_password);
        info!(user = %self.user, host = %self.host, server = %primary.address(), "creating replication account");
        if !dry_run {
            primary.create_replication_user(&self.user, &self.host, password.as_deref(), cert_issuer)?;
        }
        Ok(password)
    }

    /// Give the account a fresh password, creating it if it is gone.
    ///
    /// # Errors
    ///
    /// Server errors.
    pub fn rotate(
        &self,
        primary: &dyn Instance,
        auth: AuthType,
        cert_issuer: Option<&str>,
        dry_run: bool,
    ) -> Result<Option<String>> {
        info!(user = %self.user, server = %primary.address(), "rotating replication account password");
        let password = auth.uses_password().then(generate_password);
        if !dry_run {
            primary.create_replication_user(&self.user, &self.host, password.as_deref(), cert_issuer)?;
            if let Some(password) = &password {
                primary.set_user_password(&self.user, &self.host, password)?;
            }
        }
        Ok(password)
    }

    /// # Errors
    ///
    /// Server errors.
    pub fn drop_from(&self, primary: &dyn Instance, dry_run: bool) -> Result<()> {
        info!(user = %self.user, server = %primary.address(), "dropping replication account");
        if dry_run {
            return Ok(());
        }
        primary.drop_user(&self.user, &self.host)
    }
}

/// ClusterSet-wide channel settings recorded at creation.
#[must_use]
pub fn cluster_set_attributes(ssl_mode: SslMode, auth: AuthType, cert_issuer: Option<&str>) -> Vec<(&'static str, Value)> {
    let mut attributes = vec![
        (attr::REPLICATION_SSL_MODE, Value::from(ssl_mode.as_str())),
        (attr::REPLICATION_AUTH_TYPE, Value::from(auth.as_str())),
    ];
    if let Some(issuer) = cert_issuer {
        attributes.push((attr::REPLICATION_CERT_ISSUER, Value::from(issuer)));
    }
    attributes
}

/// Per-cluster overrides to record for `options`.
#[must_use]
pub fn option_attributes(options: &AsyncReplicationOptions) -> Vec<(&'static str, Value)> {
    let mut attributes = Vec::new();
    if let Some(v) = options.connect_retry {
        attributes.push((attr::CONNECT_RETRY, Value::Int(i64::from(v))));
    }
    if let Some(v) = options.retry_count {
        attributes.push((attr::RETRY_COUNT, Value::Int(i64::from(v))));
    }
    if let Some(v) = options.heartbeat_period {
        attributes.push((attr::HEARTBEAT_PERIOD, Value::Float(v)));
    }
    if let Some(v) = &options.compression_algorithms {
        attributes.push((attr::COMPRESSION_ALGORITHMS, Value::from(v.as_str())));
    }
    if let Some(v) = options.zstd_compression_level {
        attributes.push((attr::ZSTD_COMPRESSION_LEVEL, Value::Int(i64::from(v))));
    }
    attributes
}

fn lookup<'a>(cluster_set: &'a ClusterSetRecord, cluster: &'a ClusterRecord, key: &str) -> Option<&'a Value> {
    // A present-but-null override resets to the server default.
    match cluster.attributes.get(key) {
        Some(Value::Null) => None,
        Some(value) => Some(value),
        None => cluster_set.attributes.get(key).filter(|v| !v.is_null()),
    }
}

fn lookup_u32(cluster_set: &ClusterSetRecord, cluster: &ClusterRecord, key: &str) -> Option<u32> {
    lookup(cluster_set, cluster, key)
        .and_then(Value::as_int)
        .and_then(|v| u32::try_from(v).ok())
}

/// Channel options of `cluster`: its own overrides over the ClusterSet defaults.
///
/// # Errors
///
/// [`ErrorCode::InvalidOption`] if a recorded SSL mode or auth type is unknown.
pub fn channel_options(cluster_set: &ClusterSetRecord, cluster: &ClusterRecord) -> Result<AsyncReplicationOptions> {
    let ssl_mode = match cluster_set.text_attribute(attr::REPLICATION_SSL_MODE) {
        Some(text) => SslMode::parse(text).ok_or_else(|| invalid(attr::REPLICATION_SSL_MODE, text))?,
        None => SslMode::default(),
    };
    let auth_type = match cluster_set.text_attribute(attr::REPLICATION_AUTH_TYPE) {
        Some(text) => AuthType::parse(text).ok_or_else(|| invalid(attr::REPLICATION_AUTH_TYPE, text))?,
        None => AuthType::default(),
    };
    Ok(AsyncReplicationOptions {
        connect_retry: lookup_u32(cluster_set, cluster, attr::CONNECT_RETRY),
        retry_count: lookup_u32(cluster_set, cluster, attr::RETRY_COUNT),
        heartbeat_period: lookup(cluster_set, cluster, attr::HEARTBEAT_PERIOD).and_then(Value::as_float),
        compression_algorithms: lookup(cluster_set, cluster, attr::COMPRESSION_ALGORITHMS)
            .and_then(Value::as_str)
            .map(str::to_string),
        zstd_compression_level: lookup_u32(cluster_set, cluster, attr::ZSTD_COMPRESSION_LEVEL),
        ssl_mode,
        auth_type,
        cert_issuer: cluster_set
            .text_attribute(attr::REPLICATION_CERT_ISSUER)
            .map(str::to_string),
    })
}

fn invalid(key: &str, value: &str) -> Error {
    Error::new(
        ErrorCode::InvalidOption,
        format!("Invalid value '{value}' recorded for '{key}'"),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::metadata::{Attributes, SINGLE_PRIMARY_TREE};

    fn records() -> (ClusterSetRecord, ClusterRecord) {
        let mut cs_attributes = BTreeMap::new();
        for (key, value) in cluster_set_attributes(SslMode::Required, AuthType::Password, None) {
            cs_attributes.insert(key.to_string(), value);
        }
        cs_attributes.insert(attr::CONNECT_RETRY.to_string(), Value::Int(10));
        cs_attributes.insert(attr::RETRY_COUNT.to_string(), Value::Int(5));
        let cluster_set = ClusterSetRecord {
            id: "cs".into(),
            domain_name: "dom".into(),
            topology_type: SINGLE_PRIMARY_TREE.into(),
            attributes: cs_attributes,
            routing_options: Attributes::new(),
        };
        let cluster = ClusterRecord {
            id: "0f3c8a12-aaaa-bbbb".into(),
            name: "c2".into(),
            group_name: "g".into(),
            view_change_uuid: None,
            instances: Vec::new(),
            attributes: Attributes::new(),
            routing_options: Attributes::new(),
        };
        (cluster_set, cluster)
    }

    #[test]
    fn cluster_overrides_and_null_resets() {
        let (cluster_set, mut cluster) = records();
        cluster.attributes.insert(attr::CONNECT_RETRY.into(), Value::Int(3));
        cluster.attributes.insert(attr::RETRY_COUNT.into(), Value::Null);
        let options = channel_options(&cluster_set, &cluster).unwrap();
        assert_eq!(options.connect_retry, Some(3));
        assert_eq!(options.retry_count, None);
        assert_eq!(options.ssl_mode, SslMode::Required);
    }

    #[test]
    fn account_name_is_derived_from_cluster_id() {
        let (_, mut cluster) = records();
        let account = ReplicationAccount::of(&cluster);
        assert_eq!(account.user, "mysql_innodb_cs_0f3c8a12aaaa");
        cluster
            .attributes
            .insert(attr::REPLICATION_ACCOUNT_USER.into(), Value::from("custom"));
        cluster
            .attributes
            .insert(attr::REPLICATION_ACCOUNT_HOST.into(), Value::from("10.%"));
        assert_eq!(ReplicationAccount::of(&cluster).user, "custom");
    }

    #[test]
    fn option_overrides_round_into_attributes() {
        let options = AsyncReplicationOptions::builder()
            .connect_retry(7)
            .heartbeat_period(2.5)
            .build();
        let attributes = option_attributes(&options);
        assert_eq!(
            attributes,
            vec![
                (attr::CONNECT_RETRY, Value::Int(7)),
                (attr::HEARTBEAT_PERIOD, Value::Float(2.5))
            ]
        );
    }
}
