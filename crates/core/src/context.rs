//! Everything a topology operation needs from its caller.
//!
//! There is no ambient global state: the console, the connection factory,
//! fault injection and change notification are passed in explicitly through
//! an [`OperationContext`].

use std::sync::Arc;

use tracing::info;
use typed_builder::TypedBuilder;

use crate::config::Settings;
use crate::error::Result;
use crate::instance::InstanceRef;
use crate::metadata::MetadataStore;

/// Operator-facing narrative. Separate from the `tracing` logs.
pub trait Console: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn success(&self, message: &str);
}

/// Prints the narrative to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn info(&self, message: &str) {
        println!("{message}");
    }

    fn warn(&self, message: &str) {
        println!("WARNING: {message}");
    }

    fn success(&self, message: &str) {
        println!("{message}");
    }
}

/// Opens server connections and metadata handles.
pub trait Connector: Send + Sync {
    /// A new exclusive connection to `address`.
    ///
    /// # Errors
    ///
    /// A network [`ServerError`](crate::error::ServerError) when unreachable.
    fn connect(&self, address: &str) -> Result<InstanceRef>;

    /// The metadata schema as seen through `server`.
    ///
    /// # Errors
    ///
    /// Server errors.
    fn metadata_store(&self, server: &InstanceRef) -> Result<Arc<dyn MetadataStore>>;
}

/// Named points where tests can make an operation fail.
pub trait FailurePoints: Send + Sync {
    /// # Errors
    ///
    /// Whatever error the implementation wants to inject at `point`.
    fn check(&self, point: &str) -> Result<()>;
}

/// Production behaviour: never fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFailures;

impl FailurePoints for NoFailures {
    fn check(&self, _point: &str) -> Result<()> {
        Ok(())
    }
}

/// Receives the process-wide "primary changed" event.
pub trait Notifier: Send + Sync {
    fn primary_changed(&self, cluster_set_id: &str);
}

/// Logs the event and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn primary_changed(&self, cluster_set_id: &str) {
        info!(cluster_set = cluster_set_id, "global primary changed");
    }
}

#[derive(Clone, TypedBuilder)]
pub struct OperationContext {
    pub console: Arc<dyn Console>,
    pub connector: Arc<dyn Connector>,
    #[builder(default = Arc::new(NoFailures))]
    pub failures: Arc<dyn FailurePoints>,
    #[builder(default = Arc::new(LogNotifier))]
    pub notifier: Arc<dyn Notifier>,
    #[builder(default)]
    pub settings: Settings,
}

impl OperationContext {
    /// Give the fault injector a chance to fail at `point`.
    ///
    /// # Errors
    ///
    /// The injected error.
    pub fn failure_point(&self, point: &str) -> Result<()> {
        self.failures.check(point)
    }

    /// Connect, mapping nothing: the caller decides what unreachable means.
    ///
    /// # Errors
    ///
    /// Network errors.
    pub fn connect(&self, address: &str) -> Result<InstanceRef> {
        self.connector.connect(address)
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.console.info(message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.console.warn(message.as_ref());
    }

    pub fn success(&self, message: impl AsRef<str>) {
        self.console.success(message.as_ref());
    }
}

/// Generate a replication account password.
#[must_use]
pub fn generate_password() -> String {
    use rand::distr::{Alphanumeric, Distribution};
    Alphanumeric
        .sample_iter(rand::rng())
        .take(32)
        .map(char::from)
        .collect()
}
