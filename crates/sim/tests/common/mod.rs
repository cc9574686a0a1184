//! Shared fixtures for the scenario tests.
#![allow(dead_code)]

use std::sync::Arc;

use clusterset_core::metadata::MetadataState;
use clusterset_core::topology::{self, status::ClusterSetStatus};
use clusterset_core::{
    CreateOptions, CreateReplicaOptions, FailurePoints, OperationContext, Settings,
};
use clusterset_sim::testing::{RecordingConsole, RecordingNotifier};
use clusterset_sim::{ClusterSpec, Lab, LabSpec};

pub const DOMAIN: &str = "dom";

/// A lab plus the context every operation runs with.
pub struct Harness {
    pub lab: Lab,
    pub console: Arc<RecordingConsole>,
    pub notifier: Arc<RecordingNotifier>,
}

/// Short timeouts: every wait in the simulation is real time.
pub fn settings() -> Settings {
    Settings::builder()
        .lock_timeout_secs(1)
        .default_sync_timeout_secs(2)
        .build()
}

impl Harness {
    pub fn new(spec: &LabSpec) -> Self {
        Self {
            lab: Lab::new(spec).expect("lab seeds"),
            console: Arc::new(RecordingConsole::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    /// One three-member cluster and `spares` standalone servers.
    pub fn single(spares: usize) -> Self {
        Self::new(&LabSpec::builder().spare_servers(spares).build())
    }

    pub fn ctx(&self) -> OperationContext {
        OperationContext::builder()
            .console(self.console.clone())
            .connector(self.lab.connector())
            .notifier(self.notifier.clone())
            .settings(settings())
            .build()
    }

    pub fn ctx_failing(&self, failures: Arc<dyn FailurePoints>) -> OperationContext {
        OperationContext::builder()
            .console(self.console.clone())
            .connector(self.lab.connector())
            .failures(failures)
            .notifier(self.notifier.clone())
            .settings(settings())
            .build()
    }

    pub fn primary(&self, cluster: &str) -> String {
        self.lab.primary_of(cluster).expect("cluster has a primary")
    }

    pub fn metadata(&self, address: &str) -> MetadataState {
        self.lab.metadata(address).expect("server has the metadata schema")
    }

    pub fn status(&self, address: &str) -> ClusterSetStatus {
        topology::status(&self.ctx(), address).expect("status is readable")
    }

    /// ClusterSet on `cluster1`.
    pub fn create(&self) {
        let primary = self.primary("cluster1");
        topology::create_cluster_set(&self.ctx(), &primary, DOMAIN, &CreateOptions::default())
            .expect("ClusterSet is created");
    }

    /// A replica cluster grown from the next spare server.
    pub fn add_replica(&self, name: &str) -> String {
        let spare = self
            .lab
            .spare_servers()
            .into_iter()
            .next()
            .expect("a spare server is left");
        topology::create_replica_cluster(
            &self.ctx(),
            &self.primary("cluster1"),
            &spare,
            name,
            &CreateReplicaOptions::default(),
        )
        .expect("replica cluster is created");
        spare
    }
}

/// `cluster1` as a ClusterSet with replica clusters `names`.
pub fn cluster_set(names: &[&str]) -> Harness {
    let harness = Harness::single(names.len() + 1);
    harness.create();
    for name in names {
        harness.add_replica(name);
    }
    harness
}

/// Two seeded clusters, the second one not yet in any ClusterSet.
pub fn two_clusters() -> Harness {
    Harness::new(
        &LabSpec::builder()
            .clusters(vec![
                ClusterSpec::builder().name("cluster1").build(),
                ClusterSpec::builder().name("other").size(1).build(),
            ])
            .build(),
    )
}
