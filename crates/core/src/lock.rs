//! Advisory locks held through the server-side locking service.
//!
//! A lock lives on one server and belongs to the connection that took it.
//! Every lock of a namespace is released at once, so a [`LockGuard`] stands
//! for "this connection holds locks in this namespace".

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result, ServerError};
use crate::instance::{Instance, InstanceRef};

/// Namespace of ClusterSet-wide locks.
pub const CLUSTER_SET_NAMESPACE: &str = "AdminAPI_clusterset";
/// Namespace of per-cluster locks.
pub const CLUSTER_NAMESPACE: &str = "AdminAPI_cluster";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScope {
    /// The whole ClusterSet, keyed by its id.
    ClusterSet(String),
    /// One cluster, keyed by its id.
    Cluster(String),
}

impl LockScope {
    #[must_use]
    pub const fn namespace(&self) -> &'static str {
        match self {
            Self::ClusterSet(_) => CLUSTER_SET_NAMESPACE,
            Self::Cluster(_) => CLUSTER_NAMESPACE,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ClusterSet(id) | Self::Cluster(id) => id,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::ClusterSet(id) => format!("ClusterSet '{id}'"),
            Self::Cluster(id) => format!("cluster '{id}'"),
        }
    }
}

/// Held lock namespace on one connection. Dropping it releases the locks.
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard {
    server: InstanceRef,
    namespace: &'static str,
    /// `false` when the locking service is unavailable and nothing was taken.
    held: bool,
}

impl LockGuard {
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.held
    }

    #[must_use]
    pub fn address(&self) -> String {
        self.server.address()
    }

    /// Release now. Failures are logged and otherwise ignored.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match self.server.release_locks(self.namespace) {
            Ok(()) => debug!(
                server = %self.server.address(),
                namespace = self.namespace,
                "released locks"
            ),
            Err(err) => warn!(
                server = %self.server.address(),
                namespace = self.namespace,
                %err,
                "failed to release locks"
            ),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Make sure the locking service is usable on `server`.
///
/// Returns `false` when the service is missing and cannot be installed
/// because the server is read-only or the install failed. Callers then run
/// without concurrency protection.
///
/// # Errors
///
/// Propagates errors from reading the server state.
pub fn ensure_lock_service(server: &dyn Instance) -> Result<bool> {
    if server.has_lock_service()? {
        return Ok(true);
    }
    let read_only = ["super_read_only", "read_only"]
        .into_iter()
        .map(|var| server.get_sysvar(var))
        .collect::<Result<Vec<_>>>()?
        .iter()
        .flatten()
        .any(|v| crate::instance::parse_bool(v));
    if read_only {
        warn!(
            server = %server.address(),
            "locking service is not installed and the server is read-only, concurrent operations are not prevented"
        );
        return Ok(false);
    }
    match server.install_lock_service() {
        Ok(()) => {
            debug!(server = %server.address(), "installed locking service");
            Ok(true)
        }
        Err(err) => {
            warn!(
                server = %server.address(),
                %err,
                "unable to install the locking service, concurrent operations are not prevented"
            );
            Ok(false)
        }
    }
}

/// Take `scope` in `mode` on `server`, waiting at most `timeout`.
///
/// # Errors
///
/// [`ErrorCode::LockGetFailed`](crate::error::ErrorCode::LockGetFailed) if the
/// lock is still busy after `timeout`; any other server error as-is.
pub fn acquire(
    server: &InstanceRef,
    scope: &LockScope,
    mode: LockMode,
    timeout: Duration,
) -> Result<LockGuard> {
    let namespace = scope.namespace();
    if !ensure_lock_service(server.as_ref())? {
        return Ok(LockGuard {
            server: server.clone(),
            namespace,
            held: false,
        });
    }
    debug!(server = %server.address(), namespace, name = scope.name(), ?mode, "acquiring lock");
    match server.get_lock(namespace, scope.name(), mode, timeout) {
        Ok(()) => Ok(LockGuard {
            server: server.clone(),
            namespace,
            held: true,
        }),
        Err(err) if err.server_code() == Some(ServerError::LOCK_TIMEOUT) => {
            Err(Error::lock_timeout(&scope.describe(), timeout, err))
        }
        Err(err) => Err(err),
    }
}

/// Locks taken by one operation, released in reverse order.
#[derive(Default)]
#[must_use = "the locks are released when the set is dropped"]
pub struct LockSet {
    guards: Vec<LockGuard>,
}

impl LockSet {
    pub fn push(&mut self, guard: LockGuard) {
        self.guards.push(guard);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            guard.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::instance::Row;

    #[derive(Default)]
    struct LockServer {
        installed: Mutex<bool>,
        read_only: bool,
        busy: bool,
        log: Mutex<Vec<String>>,
    }

    impl Instance for LockServer {
        fn address(&self) -> String {
            "lock:3306".into()
        }

        fn execute(&self, sql: &str) -> Result<()> {
            self.log.lock().unwrap().push(sql.into());
            Ok(())
        }

        fn query(&self, sql: &str) -> Result<Vec<Row>> {
            self.log.lock().unwrap().push(sql.into());
            Ok(Vec::new())
        }

        fn get_sysvar(&self, name: &str) -> Result<Option<String>> {
            Ok(Some(if self.read_only && name == "super_read_only" { "ON" } else { "OFF" }.into()))
        }

        fn has_lock_service(&self) -> Result<bool> {
            Ok(*self.installed.lock().unwrap())
        }

        fn install_lock_service(&self) -> Result<()> {
            *self.installed.lock().unwrap() = true;
            Ok(())
        }

        fn get_lock(&self, ns: &str, name: &str, _: LockMode, _: Duration) -> Result<()> {
            if self.busy {
                return Err(ServerError::new(ServerError::LOCK_TIMEOUT, "busy").into());
            }
            self.log.lock().unwrap().push(format!("lock {ns}.{name}"));
            Ok(())
        }

        fn release_locks(&self, ns: &str) -> Result<()> {
            self.log.lock().unwrap().push(format!("release {ns}"));
            Ok(())
        }
    }

    #[test]
    fn installs_service_then_locks_and_releases_on_drop() {
        let server = Arc::new(LockServer::default());
        let handle: InstanceRef = server.clone();
        {
            let guard = acquire(
                &handle,
                &LockScope::ClusterSet("cs1".into()),
                LockMode::Exclusive,
                Duration::from_secs(1),
            )
            .unwrap();
            assert!(guard.is_held());
        }
        assert!(*server.installed.lock().unwrap());
        let log = server.log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            ["lock AdminAPI_clusterset.cs1", "release AdminAPI_clusterset"]
        );
    }

    #[test]
    fn read_only_server_degrades_to_no_lock() {
        let server = Arc::new(LockServer {
            read_only: true,
            ..LockServer::default()
        });
        let handle: InstanceRef = server.clone();
        let guard = acquire(
            &handle,
            &LockScope::Cluster("c1".into()),
            LockMode::Shared,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(!guard.is_held());
        drop(guard);
        assert!(server.log.lock().unwrap().is_empty());
    }

    #[test]
    fn busy_lock_reports_timeout() {
        let server = Arc::new(LockServer {
            installed: Mutex::new(true),
            busy: true,
            ..LockServer::default()
        });
        let handle: InstanceRef = server;
        let err = acquire(
            &handle,
            &LockScope::ClusterSet("cs1".into()),
            LockMode::Exclusive,
            Duration::from_secs(3),
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::LockGetFailed));
        assert!(err.to_string().contains("after 3s"));
    }

    #[test]
    fn lock_set_releases_in_reverse() {
        let server = Arc::new(LockServer {
            installed: Mutex::new(true),
            ..LockServer::default()
        });
        let handle: InstanceRef = server.clone();
        let mut set = LockSet::default();
        for scope in [
            LockScope::ClusterSet("cs".into()),
            LockScope::Cluster("c1".into()),
        ] {
            set.push(acquire(&handle, &scope, LockMode::Exclusive, Duration::from_secs(1)).unwrap());
        }
        assert_eq!(set.len(), 2);
        drop(set);
        let log = server.log.lock().unwrap();
        assert_eq!(
            &log[2..],
            ["release AdminAPI_cluster", "release AdminAPI_clusterset"]
        );
    }
}
