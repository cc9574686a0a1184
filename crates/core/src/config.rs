//! Settings and per-operation options.
//!
//! Everything here is plain data: built with [`TypedBuilder`], defaulted, and
//! (with the `serde` feature) loadable from JSON.

use std::fmt;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::instance::Version;

/// Crate-wide tunables.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[cfg_attr(feature = "schemars", derive(::schemars::JsonSchema))]
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct Settings {
    /// Seconds to wait for a ClusterSet or Cluster lock.
    #[builder(default = 60)]
    pub lock_timeout_secs: u64,
    /// Oldest server version allowed in a ClusterSet, as `major.minor.patch`.
    #[builder(default = String::from("8.0.27"))]
    pub minimum_version: String,
    /// Oldest metadata schema version the operations understand.
    #[builder(default = String::from("2.1.0"))]
    pub minimum_metadata_version: String,
    /// Seconds to wait for GTID catch-up when an operation does not say.
    #[builder(default = 30)]
    pub default_sync_timeout_secs: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Settings {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// The minimum server version, falling back to 8.0.27 if unparsable.
    #[must_use]
    pub fn minimum_version(&self) -> Version {
        Version::parse(&self.minimum_version).unwrap_or(Version::new(8, 0, 27))
    }

    #[must_use]
    pub fn minimum_metadata_version(&self) -> Version {
        Version::parse(&self.minimum_metadata_version).unwrap_or(Version::new(2, 1, 0))
    }

    /// Resolve an operation's timeout, `None` meaning the default.
    #[must_use]
    pub fn sync_timeout(&self, secs: Option<i64>) -> SyncTimeout {
        SyncTimeout::from_secs(secs.unwrap_or(self.default_sync_timeout_secs))
    }
}

/// How long to wait for a GTID set to be applied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncTimeout {
    /// Do not wait at all.
    Skip,
    /// Check once and fail if not already caught up.
    Immediate,
    /// Wait up to the given duration.
    Wait(Duration),
}

impl SyncTimeout {
    /// Negative seconds skip the wait, zero checks once.
    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            s if s < 0 => Self::Skip,
            0 => Self::Immediate,
            s => Self::Wait(Duration::from_secs(s.unsigned_abs())),
        }
    }

    #[must_use]
    pub const fn as_secs(self) -> u64 {
        match self {
            Self::Skip | Self::Immediate => 0,
            Self::Wait(d) => d.as_secs(),
        }
    }
}

/// `SOURCE_SSL` handling for the ClusterSet channel.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "schemars", derive(::schemars::JsonSchema))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Resolved to `Required` when the primary supports TLS, else `Disabled`.
    #[default]
    Auto,
    Disabled,
    Required,
    VerifyCa,
    VerifyIdentity,
}

impl SslMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Disabled => "DISABLED",
            Self::Required => "REQUIRED",
            Self::VerifyCa => "VERIFY_CA",
            Self::VerifyIdentity => "VERIFY_IDENTITY",
        }
    }

    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "AUTO" => Some(Self::Auto),
            "DISABLED" => Some(Self::Disabled),
            "REQUIRED" => Some(Self::Required),
            "VERIFY_CA" => Some(Self::VerifyCa),
            "VERIFY_IDENTITY" => Some(Self::VerifyIdentity),
            _ => None,
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How replication accounts authenticate.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "schemars", derive(::schemars::JsonSchema))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    Password,
    CertIssuer,
    CertIssuerPassword,
}

impl AuthType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Password => "PASSWORD",
            Self::CertIssuer => "CERT_ISSUER",
            Self::CertIssuerPassword => "CERT_ISSUER_PASSWORD",
        }
    }

    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "PASSWORD" => Some(Self::Password),
            "CERT_ISSUER" => Some(Self::CertIssuer),
            "CERT_ISSUER_PASSWORD" => Some(Self::CertIssuerPassword),
            _ => None,
        }
    }

    #[must_use]
    pub const fn uses_password(self) -> bool {
        matches!(self, Self::Password | Self::CertIssuerPassword)
    }
}

/// Options of the asynchronous ClusterSet channel.
///
/// `None` leaves the server default in place.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[cfg_attr(feature = "schemars", derive(::schemars::JsonSchema))]
#[derive(Debug, Clone, PartialEq, Default, TypedBuilder)]
pub struct AsyncReplicationOptions {
    #[builder(default, setter(strip_option))]
    pub connect_retry: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub retry_count: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_period: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub compression_algorithms: Option<String>,
    #[builder(default, setter(strip_option))]
    pub zstd_compression_level: Option<u32>,
    #[builder(default)]
    pub ssl_mode: SslMode,
    #[builder(default)]
    pub auth_type: AuthType,
    #[builder(default, setter(strip_option))]
    pub cert_issuer: Option<String>,
}

/// Options of [`create_cluster_set`](crate::topology::create_cluster_set).
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct CreateOptions {
    #[builder(default)]
    pub dry_run: bool,
    #[builder(default)]
    pub replication_ssl_mode: SslMode,
    #[builder(default)]
    pub replication_auth_type: AuthType,
    #[builder(default, setter(strip_option))]
    pub replication_cert_issuer: Option<String>,
}

/// Options of [`create_replica_cluster`](crate::topology::create_replica_cluster).
#[derive(Debug, Clone, TypedBuilder)]
pub struct CreateReplicaOptions {
    #[builder(default)]
    pub dry_run: bool,
    /// Seconds to wait for the new cluster to catch up.
    #[builder(default, setter(strip_option))]
    pub timeout_secs: Option<i64>,
    /// Per-cluster overrides of the ClusterSet channel options.
    #[builder(default)]
    pub replication: AsyncReplicationOptions,
}

impl Default for CreateReplicaOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Options of [`set_primary_cluster`](crate::topology::set_primary_cluster).
#[derive(Debug, Clone, TypedBuilder)]
pub struct SwitchoverOptions {
    #[builder(default)]
    pub dry_run: bool,
    /// Seconds to wait for the promoted cluster to catch up.
    #[builder(default, setter(strip_option))]
    pub timeout_secs: Option<i64>,
    /// Replica clusters the caller agrees to invalidate.
    #[builder(default)]
    pub invalidate_replica_clusters: Vec<String>,
}

impl Default for SwitchoverOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Options of [`force_primary_cluster`](crate::topology::force_primary_cluster).
#[derive(Debug, Clone, TypedBuilder)]
pub struct FailoverOptions {
    #[builder(default)]
    pub dry_run: bool,
    /// Seconds to wait for received transactions to be applied.
    #[builder(default, setter(strip_option))]
    pub timeout_secs: Option<i64>,
    #[builder(default)]
    pub invalidate_replica_clusters: Vec<String>,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Options of [`remove_cluster`](crate::topology::remove_cluster).
#[derive(Debug, Clone, TypedBuilder)]
pub struct RemoveOptions {
    #[builder(default)]
    pub dry_run: bool,
    /// Skip transaction synchronization and tolerate an unreachable cluster.
    #[builder(default)]
    pub force: bool,
    #[builder(default, setter(strip_option))]
    pub timeout_secs: Option<i64>,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Options of [`rejoin_cluster`](crate::topology::rejoin_cluster).
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct RejoinOptions {
    #[builder(default)]
    pub dry_run: bool,
}

/// Options of [`dissolve`](crate::topology::dissolve).
#[derive(Debug, Clone, TypedBuilder)]
pub struct DissolveOptions {
    #[builder(default)]
    pub dry_run: bool,
    /// Continue past unreachable clusters and failed synchronization.
    #[builder(default)]
    pub force: bool,
    #[builder(default, setter(strip_option))]
    pub timeout_secs: Option<i64>,
}

impl Default for DissolveOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_timeout_from_secs() {
        assert_eq!(SyncTimeout::from_secs(-1), SyncTimeout::Skip);
        assert_eq!(SyncTimeout::from_secs(0), SyncTimeout::Immediate);
        assert_eq!(
            SyncTimeout::from_secs(5),
            SyncTimeout::Wait(Duration::from_secs(5))
        );
    }

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.lock_timeout(), Duration::from_secs(60));
        assert_eq!(settings.minimum_version(), Version::new(8, 0, 27));
        assert_eq!(settings.minimum_metadata_version(), Version::new(2, 1, 0));
        assert_eq!(
            settings.sync_timeout(None),
            SyncTimeout::Wait(Duration::from_secs(30))
        );
        assert_eq!(settings.sync_timeout(Some(-1)), SyncTimeout::Skip);
    }

    #[test]
    fn ssl_mode_round_trip_through_text() {
        for mode in [
            SslMode::Auto,
            SslMode::Disabled,
            SslMode::Required,
            SslMode::VerifyCa,
            SslMode::VerifyIdentity,
        ] {
            assert_eq!(SslMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(SslMode::parse("bogus"), None);
    }
}
