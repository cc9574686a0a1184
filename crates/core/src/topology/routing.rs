//! Router registrations and their ClusterSet routing options.

use tracing::info;

use super::cluster_set::ClusterSet;
use crate::context::OperationContext;
use crate::error::{Error, ErrorCode, Result};
use crate::lock::LockMode;
use crate::metadata::{routing, Attributes, RouterRecord, Value};

/// Routers of a ClusterSet together with the options they inherit.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Routers {
    pub global_options: Attributes,
    pub routers: Vec<RouterRecord>,
}

impl Routers {
    /// The effective value of `option` for `router`: its own override, else
    /// the ClusterSet-wide value.
    #[must_use]
    pub fn effective(&self, router: &str, option: &str) -> Option<&Value> {
        self.routers
            .iter()
            .find(|r| r.name == router)
            .and_then(|r| r.options.get(option))
            .or_else(|| self.global_options.get(option))
    }
}

/// # Errors
///
/// Only the errors of [`ClusterSet::open`].
pub fn list_routers(ctx: &OperationContext, address: &str) -> Result<Routers> {
    let cluster_set = ClusterSet::open(ctx, address)?;
    let mut routers = cluster_set.metadata().routers_of(cluster_set.id())?;
    routers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Routers {
        global_options: cluster_set.record().routing_options.clone(),
        routers,
    })
}

/// Default of a ClusterSet-wide routing option.
fn default_value(option: &str) -> Option<&'static str> {
    match option {
        routing::TARGET_CLUSTER => Some(routing::TARGET_PRIMARY),
        routing::INVALIDATED_CLUSTER_POLICY => Some(routing::POLICY_DROP_ALL),
        _ => None,
    }
}

/// Set a routing option ClusterSet-wide, or for one `router` when given.
///
/// `value = None` resets: a router loses its override, a ClusterSet-wide
/// option goes back to its default.
///
/// # Errors
///
/// - [`ErrorCode::InvalidOption`] for an unknown option or invalid value.
/// - [`ErrorCode::RouterNotFound`] for a router not registered with the ClusterSet.
/// - [`ErrorCode::PrimaryClusterUnavailable`] without a writable global primary.
pub fn set_routing_option(
    ctx: &OperationContext,
    address: &str,
    router: Option<&str>,
    option: &str,
    value: Option<&str>,
) -> Result<()> {
    let cluster_set = ClusterSet::open(ctx, address)?;
    let Some(default) = default_value(option) else {
        return Err(Error::new(
            ErrorCode::InvalidOption,
            format!("Unsupported routing option '{option}'"),
        ));
    };
    if let Some(value) = value {
        validate_value(&cluster_set, option, value)?;
    }
    if let Some(router) = router {
        let known = cluster_set
            .metadata()
            .routers_of(cluster_set.id())?
            .iter()
            .any(|r| r.name == router);
        if !known {
            return Err(Error::new(
                ErrorCode::RouterNotFound,
                format!(
                    "Router '{router}' is not registered with ClusterSet '{}'",
                    cluster_set.domain_name()
                ),
            ));
        }
    }

    let primary_cluster = cluster_set.connect_primary()?;
    let global_primary = primary_cluster.primary().map_err(|err| {
        Error::with_cause(
            ErrorCode::PrimaryClusterUnavailable,
            format!("The primary cluster '{}' is not available", primary_cluster.name()),
            err,
        )
    })?;
    let _locks = cluster_set.acquire_locks(&primary_cluster, &[], LockMode::Exclusive)?;

    let stored = match (router, value) {
        (_, Some(value)) => Some(Value::from(value)),
        (Some(_), None) => None,
        (None, None) => Some(Value::from(default)),
    };
    let writer = cluster_set.writer(global_primary)?;
    let mut txn = writer.transaction()?;
    txn.set_routing_option(cluster_set.id(), router, option, stored.clone())?;
    txn.commit()?;

    let scope = router.map_or_else(|| String::from("the ClusterSet"), |r| format!("router '{r}'"));
    info!(option, value = ?stored, %scope, "routing option updated");
    match stored {
        Some(value) => ctx.success(format!("Routing option '{option}' successfully updated to '{value}' for {scope}.")),
        None => ctx.success(format!("Routing option '{option}' successfully cleared for {scope}.")),
    }
    Ok(())
}

fn validate_value(cluster_set: &ClusterSet<'_>, option: &str, value: &str) -> Result<()> {
    let valid = match option {
        routing::TARGET_CLUSTER => {
            value == routing::TARGET_PRIMARY
                || cluster_set
                    .members()?
                    .iter()
                    .any(|m| m.cluster.name == value)
        }
        routing::INVALIDATED_CLUSTER_POLICY => {
            value == routing::POLICY_ACCEPT_RO || value == routing::POLICY_DROP_ALL
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::new(
            ErrorCode::InvalidOption,
            format!("Invalid value '{value}' for routing option '{option}'"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_override_beats_global_option() {
        let mut global = Attributes::new();
        global.insert(routing::TARGET_CLUSTER.to_string(), Value::from("primary"));
        let mut options = Attributes::new();
        options.insert(routing::TARGET_CLUSTER.to_string(), Value::from("c2"));
        let routers = Routers {
            global_options: global,
            routers: vec![
                RouterRecord {
                    name: "host1::r1".into(),
                    cluster_id: None,
                    cluster_set_id: Some("cs".into()),
                    options,
                },
                RouterRecord {
                    name: "host2::r2".into(),
                    cluster_id: None,
                    cluster_set_id: Some("cs".into()),
                    options: Attributes::new(),
                },
            ],
        };
        assert_eq!(
            routers.effective("host1::r1", routing::TARGET_CLUSTER),
            Some(&Value::from("c2"))
        );
        assert_eq!(
            routers.effective("host2::r2", routing::TARGET_CLUSTER),
            Some(&Value::from("primary"))
        );
        assert_eq!(routers.effective("host2::r2", "unknown"), None);
    }

    #[test]
    fn only_known_options_have_defaults() {
        assert_eq!(default_value(routing::TARGET_CLUSTER), Some("primary"));
        assert_eq!(default_value(routing::INVALIDATED_CLUSTER_POLICY), Some("drop_all"));
        assert_eq!(default_value("read_only_targets"), None);
    }
}
