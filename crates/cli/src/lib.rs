//! clusterset CLI -- run ClusterSet operations against a simulated lab.

use std::fmt;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clusterset_core::{
    AsyncReplicationOptions, AuthType, CreateOptions, CreateReplicaOptions, DissolveOptions, FailoverOptions,
    RejoinOptions, RemoveOptions, SslMode, SwitchoverOptions,
};
use clusterset_sim::{ClusterSpec, LabError, LabSpec};
use derive_more::From;

#[derive(Debug, Parser)]
#[command(
    name = "clusterset",
    about = "Control-plane operations for MySQL InnoDB ClusterSet"
)]
pub struct App {
    /// Lab file holding the simulated servers
    #[arg(long, global = true, default_value = "clusterset-lab.json")]
    pub lab: PathBuf,
    /// JSON file with `Settings` overrides
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create, inspect and disturb the simulated servers
    #[command(subcommand)]
    Lab(LabCommand),
    /// Turn an InnoDB Cluster into the primary cluster of a new ClusterSet
    Create(CreateArgs),
    /// Grow a replica cluster from a standalone server
    CreateReplica(CreateReplicaArgs),
    /// Switch the primary role to a healthy replica cluster
    SetPrimary(PrimaryChangeArgs),
    /// Promote a replica cluster after the primary cluster is lost
    ForcePrimary(PrimaryChangeArgs),
    /// Remove a replica cluster from the ClusterSet
    Remove(RemoveArgs),
    /// Bring an invalidated or stopped replica cluster back
    Rejoin(RejoinArgs),
    /// Dissolve the ClusterSet into independent servers
    Dissolve(DissolveArgs),
    /// Health of every cluster in the ClusterSet
    Status(StatusArgs),
    /// Recorded topology of the ClusterSet
    Describe(Target),
    /// Routers and their routing options
    Routers(Target),
    /// Set or reset a routing option
    SetRoutingOption(RoutingOptionArgs),
    /// Print the JSON Schema of the settings file to stdout
    Schema,
}

#[derive(Debug, Subcommand)]
pub enum LabCommand {
    /// Seed a new lab file
    New(NewLabArgs),
    /// Print every server of the lab
    Show(ShowArgs),
    /// Cut servers off the network
    Partition(Servers),
    /// Reconnect partitioned servers
    Heal(Servers),
    /// Commit a client write
    Write(WriteArgs),
    /// Stop the ClusterSet channel of a server
    StopChannel(ServerArg),
    /// Purge the binary log of a server
    Purge(ServerArg),
}

#[derive(Debug, Parser)]
pub struct NewLabArgs {
    /// Names of the InnoDB Clusters to seed
    #[arg(long = "cluster", default_values_t = vec![String::from("cluster1")])]
    pub clusters: Vec<String>,
    /// Members per cluster
    #[arg(long, default_value_t = 3)]
    pub size: usize,
    /// Standalone servers to grow replica clusters from
    #[arg(long, default_value_t = 2)]
    pub spares: usize,
    /// Server version of every seeded server
    #[arg(long, default_value = "8.0.30")]
    pub version: String,
    /// Router registered with the first cluster, as `host::label`
    #[arg(long = "router")]
    pub routers: Vec<String>,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 3310)]
    pub base_port: u16,
    /// Replace an existing lab file
    #[arg(long)]
    pub force: bool,
}

impl From<&NewLabArgs> for LabSpec {
    fn from(args: &NewLabArgs) -> Self {
        let clusters = args
            .clusters
            .iter()
            .enumerate()
            .map(|(i, name)| {
                ClusterSpec::builder()
                    .name(name.as_str())
                    .size(args.size)
                    .version(args.version.as_str())
                    .routers(if i == 0 { args.routers.clone() } else { Vec::new() })
                    .build()
            })
            .collect();
        Self::builder()
            .clusters(clusters)
            .spare_servers(args.spares)
            .spare_version(args.version.as_str())
            .host(args.host.as_str())
            .base_port(args.base_port)
            .build()
    }
}

#[derive(Debug, Parser)]
pub struct ShowArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct Servers {
    /// Server addresses, or cluster names with `--cluster`
    #[arg(required = true)]
    pub targets: Vec<String>,
    /// Treat the targets as cluster names
    #[arg(long)]
    pub cluster: bool,
}

#[derive(Debug, Parser)]
pub struct ServerArg {
    pub address: String,
}

#[derive(Debug, Parser)]
pub struct WriteArgs {
    pub address: String,
    #[arg(long, default_value = "app")]
    pub table: String,
    /// Bypass `super_read_only`, creating an errant transaction
    #[arg(long)]
    pub errant: bool,
}

/// The server an operation connects to first.
#[derive(Debug, Args)]
pub struct Target {
    /// Address of any reachable ClusterSet member
    #[arg(long, short)]
    pub instance: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SslModeArg {
    Auto,
    Disabled,
    Required,
    VerifyCa,
    VerifyIdentity,
}

impl From<SslModeArg> for SslMode {
    fn from(mode: SslModeArg) -> Self {
        match mode {
            SslModeArg::Auto => Self::Auto,
            SslModeArg::Disabled => Self::Disabled,
            SslModeArg::Required => Self::Required,
            SslModeArg::VerifyCa => Self::VerifyCa,
            SslModeArg::VerifyIdentity => Self::VerifyIdentity,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AuthTypeArg {
    Password,
    CertIssuer,
    CertIssuerPassword,
}

impl From<AuthTypeArg> for AuthType {
    fn from(auth: AuthTypeArg) -> Self {
        match auth {
            AuthTypeArg::Password => Self::Password,
            AuthTypeArg::CertIssuer => Self::CertIssuer,
            AuthTypeArg::CertIssuerPassword => Self::CertIssuerPassword,
        }
    }
}

#[derive(Debug, Parser)]
pub struct CreateArgs {
    #[command(flatten)]
    pub target: Target,
    /// Domain name of the new ClusterSet
    pub domain: String,
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long, value_enum, default_value_t = SslModeArg::Auto)]
    pub ssl_mode: SslModeArg,
    #[arg(long, value_enum, default_value_t = AuthTypeArg::Password)]
    pub auth_type: AuthTypeArg,
    #[arg(long)]
    pub cert_issuer: Option<String>,
}

impl From<&CreateArgs> for CreateOptions {
    fn from(args: &CreateArgs) -> Self {
        Self {
            dry_run: args.dry_run,
            replication_ssl_mode: args.ssl_mode.into(),
            replication_auth_type: args.auth_type.into(),
            replication_cert_issuer: args.cert_issuer.clone(),
        }
    }
}

#[derive(Debug, Parser)]
pub struct CreateReplicaArgs {
    #[command(flatten)]
    pub target: Target,
    /// Standalone server that seeds the new cluster
    pub new_instance: String,
    /// Name of the new replica cluster
    pub name: String,
    #[arg(long)]
    pub dry_run: bool,
    /// Seconds to wait for catch-up; negative skips, zero checks once
    #[arg(long, allow_negative_numbers = true)]
    pub timeout: Option<i64>,
    #[arg(long)]
    pub connect_retry: Option<u32>,
    #[arg(long)]
    pub retry_count: Option<u32>,
    #[arg(long)]
    pub heartbeat_period: Option<f64>,
    #[arg(long)]
    pub compression_algorithms: Option<String>,
    #[arg(long)]
    pub zstd_compression_level: Option<u32>,
}

impl From<&CreateReplicaArgs> for CreateReplicaOptions {
    fn from(args: &CreateReplicaArgs) -> Self {
        Self {
            dry_run: args.dry_run,
            timeout_secs: args.timeout,
            replication: AsyncReplicationOptions {
                connect_retry: args.connect_retry,
                retry_count: args.retry_count,
                heartbeat_period: args.heartbeat_period,
                compression_algorithms: args.compression_algorithms.clone(),
                zstd_compression_level: args.zstd_compression_level,
                ..AsyncReplicationOptions::default()
            },
        }
    }
}

#[derive(Debug, Parser)]
pub struct PrimaryChangeArgs {
    #[command(flatten)]
    pub target: Target,
    /// Replica cluster to promote
    pub cluster: String,
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long, allow_negative_numbers = true)]
    pub timeout: Option<i64>,
    /// Unreachable replica cluster to invalidate instead of refusing
    #[arg(long = "invalidate")]
    pub invalidate_replica_clusters: Vec<String>,
}

impl From<&PrimaryChangeArgs> for SwitchoverOptions {
    fn from(args: &PrimaryChangeArgs) -> Self {
        Self {
            dry_run: args.dry_run,
            timeout_secs: args.timeout,
            invalidate_replica_clusters: args.invalidate_replica_clusters.clone(),
        }
    }
}

impl From<&PrimaryChangeArgs> for FailoverOptions {
    fn from(args: &PrimaryChangeArgs) -> Self {
        Self {
            dry_run: args.dry_run,
            timeout_secs: args.timeout,
            invalidate_replica_clusters: args.invalidate_replica_clusters.clone(),
        }
    }
}

#[derive(Debug, Parser)]
pub struct RemoveArgs {
    #[command(flatten)]
    pub target: Target,
    pub cluster: String,
    #[arg(long)]
    pub dry_run: bool,
    /// Remove even if the cluster is unreachable or cannot sync
    #[arg(long)]
    pub force: bool,
    #[arg(long, allow_negative_numbers = true)]
    pub timeout: Option<i64>,
}

impl From<&RemoveArgs> for RemoveOptions {
    fn from(args: &RemoveArgs) -> Self {
        Self {
            dry_run: args.dry_run,
            force: args.force,
            timeout_secs: args.timeout,
        }
    }
}

#[derive(Debug, Parser)]
pub struct RejoinArgs {
    #[command(flatten)]
    pub target: Target,
    pub cluster: String,
    #[arg(long)]
    pub dry_run: bool,
}

impl From<&RejoinArgs> for RejoinOptions {
    fn from(args: &RejoinArgs) -> Self {
        Self { dry_run: args.dry_run }
    }
}

#[derive(Debug, Parser)]
pub struct DissolveArgs {
    #[command(flatten)]
    pub target: Target,
    #[arg(long)]
    pub dry_run: bool,
    /// Carry on past unreachable clusters
    #[arg(long)]
    pub force: bool,
    #[arg(long, allow_negative_numbers = true)]
    pub timeout: Option<i64>,
}

impl From<&DissolveArgs> for DissolveOptions {
    fn from(args: &DissolveArgs) -> Self {
        Self {
            dry_run: args.dry_run,
            force: args.force,
            timeout_secs: args.timeout,
        }
    }
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    #[command(flatten)]
    pub target: Target,
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct RoutingOptionArgs {
    #[command(flatten)]
    pub target: Target,
    /// Router to override, as `host::label`; the ClusterSet default otherwise
    #[arg(long)]
    pub router: Option<String>,
    /// `target_cluster` or `invalidated_cluster_policy`
    pub option: String,
    /// New value; omitted to reset
    pub value: Option<String>,
}

/// Everything that can stop a command.
#[derive(Debug, From)]
pub enum CliError {
    Lab(LabError),
    Operation(clusterset_core::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
    #[from(ignore)]
    Usage(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lab(err) => write!(f, "{err}"),
            Self::Operation(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "settings file is not valid: {err}"),
            Self::Usage(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for CliError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operations_with_global_flags() {
        let app = App::parse_from([
            "clusterset",
            "set-primary",
            "--lab",
            "lab.json",
            "-i",
            "127.0.0.1:3310",
            "replica",
            "--invalidate",
            "r3",
            "--timeout",
            "-1",
        ]);
        assert_eq!(app.lab, PathBuf::from("lab.json"));
        let Command::SetPrimary(args) = &app.command else {
            panic!("parsed as {:?}", app.command);
        };
        let options = SwitchoverOptions::from(args);
        assert_eq!(options.invalidate_replica_clusters, ["r3"]);
        assert_eq!(options.timeout_secs, Some(-1));
        assert_eq!(args.target.instance, "127.0.0.1:3310");
    }

    #[test]
    fn new_lab_attaches_routers_to_the_first_cluster() {
        let app = App::parse_from([
            "clusterset",
            "lab",
            "new",
            "--cluster",
            "a",
            "--cluster",
            "b",
            "--router",
            "app::r1",
        ]);
        let Command::Lab(LabCommand::New(args)) = &app.command else {
            panic!("parsed as {:?}", app.command);
        };
        let spec = LabSpec::from(args);
        assert_eq!(spec.clusters.len(), 2);
        assert_eq!(spec.clusters[0].routers, ["app::r1"]);
        assert!(spec.clusters[1].routers.is_empty());
        assert_eq!(spec.spare_servers, 2);
    }

    #[test]
    fn routing_value_is_optional() {
        let app = App::parse_from(["clusterset", "set-routing-option", "-i", "h:1", "target_cluster"]);
        let Command::SetRoutingOption(args) = &app.command else {
            panic!("parsed as {:?}", app.command);
        };
        assert_eq!(args.option, "target_cluster");
        assert!(args.value.is_none() && args.router.is_none());
    }
}
