//! Reconcilers for each resource kind.

mod environment;
mod label_category;
mod network;
mod project;
mod tunnel;
mod vm;

pub use environment::{EnvironmentDesired, EnvironmentReconciler};
pub use label_category::{LabelCategoryDesired, LabelCategoryReconciler};
pub use network::{NetworkDesired, NetworkReconciler};
pub use project::{ProjectDesired, ProjectReconciler};
pub use tunnel::{TunnelDesired, TunnelReconciler};
pub use vm::{
    DiskSpec, InterfaceSpec, ObservedDisk, ObservedInterface, ObservedService, ServiceSpec,
    VmDesired, VmObserved, VmReconciler,
};

use labsync_remote::RemoteError;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::ResourceKind;

/// Map a read result so that a missing resource becomes `None`.
fn absent_if_missing<T>(kind: ResourceKind, id: &str, result: labsync_remote::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(RemoteError::NotFound { .. }) => {
            warn!(kind = %kind, id, "Resource missing remotely");
            Ok(None)
        }
        Err(err) => Err(Error::remote(format!("read {kind}"), err)),
    }
}

/// Map a delete result so that a missing resource counts as deleted.
fn deleted_if_missing(kind: ResourceKind, id: &str, result: labsync_remote::Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(RemoteError::NotFound { .. }) => {
            debug!(kind = %kind, id, "Resource already deleted");
            Ok(())
        }
        Err(err) => Err(Error::remote(format!("delete {kind}"), err)),
    }
}

/// Presence probe for absence waits: not-found means gone.
fn present<T>(result: labsync_remote::Result<T>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(RemoteError::NotFound { .. }) => Ok(false),
        Err(err) => Err(Error::remote("poll deletion", err)),
    }
}

pub(crate) fn require_non_blank(kind: ResourceKind, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_desired(
            kind.as_str(),
            format!("{field} must not be empty"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_read_is_absence() {
        let result: labsync_remote::Result<u8> = Err(RemoteError::not_found("v2/projects/1"));
        assert_eq!(absent_if_missing(ResourceKind::Project, "1", result), Ok(None));
    }

    #[test]
    fn test_other_read_errors_propagate() {
        let result: labsync_remote::Result<u8> = Err(RemoteError::status(500, "boom"));
        assert!(matches!(
            absent_if_missing(ResourceKind::Project, "1", result),
            Err(Error::Request { .. })
        ));
    }

    #[test]
    fn test_not_found_delete_is_success() {
        let result = Err(RemoteError::not_found("v2/tunnels/4"));
        assert_eq!(deleted_if_missing(ResourceKind::Tunnel, "4", result), Ok(()));
    }

    #[test]
    fn test_blank_field_rejected() {
        assert!(require_non_blank(ResourceKind::Network, "name", "  ").is_err());
        assert!(require_non_blank(ResourceKind::Network, "name", "lan").is_ok());
    }
}
