//! Control-plane orchestration for MySQL InnoDB ClusterSet.
//!
//! A ClusterSet is a group of InnoDB Clusters: one primary cluster takes the
//! writes and every replica cluster follows it through an asynchronous
//! channel. `clusterset_core` creates the ClusterSet, adds and removes
//! replica clusters, switches or fails over the primary role, rejoins
//! clusters that fell out and dissolves the whole thing, keeping the
//! replication topology, the metadata and the replication accounts in step.
//!
//! # Building blocks
//!
//! - [`lock`]: ClusterSet and cluster locks held through the server-side
//!   locking service.
//! - [`gtid`]: GTID sets and the transaction-set comparison that finds
//!   missing, purged and errant transactions.
//! - [`replication`]: the ClusterSet channel and Group Replication member
//!   actions.
//! - [`metadata`]: reversible, transactional edits of the metadata schema.
//! - [`undo`]: compensations for partially applied changes.
//! - [`topology`]: the operations themselves.
//!
//! The crate talks to servers only through the [`Instance`] and
//! [`MetadataStore`] traits; a caller provides them with a [`Connector`] in
//! the [`OperationContext`].
//!
//! ```rust,ignore
//! use clusterset_core::{topology, CreateOptions, OperationContext};
//!
//! let ctx = OperationContext::builder()
//!     .console(console)
//!     .connector(connector)
//!     .build();
//! topology::create_cluster_set(&ctx, "db1:3306", "myDomain", &CreateOptions::default())?;
//! ```
//!
//! # Crate features
//!
//! - **`serde`**: `Serialize`/`Deserialize` on settings, records, errors and
//!   status reports.
//! - **`schemars`**: JSON Schema for [`Settings`].

pub mod config;
pub mod context;
pub mod error;
pub mod gtid;
pub mod instance;
pub mod lock;
pub mod metadata;
pub mod replication;
pub mod topology;
pub mod undo;

pub use config::{
    AsyncReplicationOptions, AuthType, CreateOptions, CreateReplicaOptions, DissolveOptions, FailoverOptions,
    RejoinOptions, RemoveOptions, Settings, SslMode, SwitchoverOptions, SyncTimeout,
};
pub use context::{Connector, Console, FailurePoints, Notifier, OperationContext};
pub use error::{Error, ErrorCode, ErrorKind, Result, ServerError};
pub use gtid::GtidSet;
pub use instance::{Instance, InstanceRef};
pub use metadata::{Metadata, MetadataStore};
