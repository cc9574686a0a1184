//! A simulated MySQL estate for `clusterset_core`.
//!
//! [`World`] models servers, Group Replication groups, asynchronous
//! channels with managed auto-failover, the locking service, the global read
//! lock and the metadata schema. [`SimConnector`] hands out sessions on it
//! that implement [`Instance`](clusterset_core::Instance) natively, so every
//! ClusterSet operation runs end to end without a real server.
//!
//! [`Lab`] seeds ready-made topologies and performs operator actions such as
//! network partitions, client writes and binlog purges. A lab can be saved to
//! and loaded from JSON, which is how the command line keeps state between
//! invocations.

pub mod connection;
pub mod gtid;
pub mod lab;
pub mod metadata;
pub mod testing;
pub mod world;

pub use connection::{SimConnector, SimInstance};
pub use gtid::Gtids;
pub use lab::{ClusterSpec, Lab, LabError, LabSpec, ServerSummary};
pub use metadata::SimMetadataStore;
pub use world::{World, WorldState};
