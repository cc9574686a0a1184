use std::collections::BTreeMap;
use std::fmt;

/// Schema that holds the ClusterSet metadata on every member.
pub const METADATA_SCHEMA: &str = "mysql_innodb_cluster_metadata";

/// The only topology a ClusterSet supports.
pub const SINGLE_PRIMARY_TREE: &str = "SINGLE-PRIMARY-TREE";

/// Attribute keys.
pub mod attr {
    pub const REPLICATION_ACCOUNT_USER: &str = "replicationAccountUser";
    pub const REPLICATION_ACCOUNT_HOST: &str = "replicationAccountHost";
    pub const REPLICATION_SSL_MODE: &str = "replicationSslMode";
    pub const REPLICATION_AUTH_TYPE: &str = "replicationAuthType";
    pub const REPLICATION_CERT_ISSUER: &str = "replicationCertIssuer";
    pub const LAST_PRIMARY_CHANGE: &str = "lastPrimaryChange";
    pub const LAST_PRIMARY_CHANGE_AT: &str = "lastPrimaryChangeAt";

    /// Prefix of the per-cluster and ClusterSet-wide channel options.
    pub const CHANNEL_OPTION_PREFIX: &str = "opt_";
    pub const CONNECT_RETRY: &str = "opt_connectRetry";
    pub const RETRY_COUNT: &str = "opt_retryCount";
    pub const HEARTBEAT_PERIOD: &str = "opt_heartbeatPeriod";
    pub const COMPRESSION_ALGORITHMS: &str = "opt_compressionAlgorithms";
    pub const ZSTD_COMPRESSION_LEVEL: &str = "opt_zstdCompressionLevel";
}

/// Routing option names and defaults.
pub mod routing {
    pub const TARGET_CLUSTER: &str = "target_cluster";
    pub const INVALIDATED_CLUSTER_POLICY: &str = "invalidated_cluster_policy";

    pub const TARGET_PRIMARY: &str = "primary";
    pub const POLICY_DROP_ALL: &str = "drop_all";
    pub const POLICY_ACCEPT_RO: &str = "accept_ro";
}

/// An attribute value. `Null` is present-but-null: the setting must be reset
/// to its default the next time it is applied.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

pub type Attributes = BTreeMap<String, Value>;

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub address: String,
    pub uuid: String,
}

/// An InnoDB Cluster known to the metadata.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRecord {
    pub id: String,
    pub name: String,
    /// `group_replication_group_name` of the underlying group.
    pub group_name: String,
    pub view_change_uuid: Option<String>,
    pub instances: Vec<InstanceRecord>,
    pub attributes: Attributes,
    /// Routing defaults of a standalone cluster, moved to the ClusterSet on creation.
    pub routing_options: Attributes,
}

impl ClusterRecord {
    #[must_use]
    pub fn has_instance(&self, address: &str) -> bool {
        self.instances.iter().any(|i| i.address == address)
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    #[must_use]
    pub fn text_attribute(&self, key: &str) -> Option<&str> {
        self.attribute(key).and_then(Value::as_str)
    }
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSetRecord {
    pub id: String,
    pub domain_name: String,
    pub topology_type: String,
    pub attributes: Attributes,
    pub routing_options: Attributes,
}

impl ClusterSetRecord {
    #[must_use]
    pub fn text_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// Join record between a cluster and its ClusterSet.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub cluster_id: String,
    pub cluster_set_id: String,
    pub primary_cluster: bool,
    pub invalidated: bool,
}

/// A registered router. It targets either a standalone cluster or a ClusterSet.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct RouterRecord {
    /// `host::label`
    pub name: String,
    pub cluster_id: Option<String>,
    pub cluster_set_id: Option<String>,
    pub options: Attributes,
}

impl RouterRecord {
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}
