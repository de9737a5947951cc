use async_trait::async_trait;
use labsync_remote::types::{Tunnel, TunnelRequest};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{absent_if_missing, deleted_if_missing, require_non_blank};
use crate::context::ProviderContext;
use crate::error::{Error, Result};
use crate::reconciler::{Applied, ResourceReconciler};
use crate::types::ResourceKind;

/// A route between networks in two environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelDesired {
    pub source_network_id: String,
    pub target_network_id: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelReconciler;

impl TunnelReconciler {
    async fn fetch(ctx: &ProviderContext, id: &str) -> Result<Tunnel> {
        ctx.service()
            .get_tunnel(id)
            .await
            .map_err(|e| Error::remote("read tunnel", e))
    }
}

#[async_trait]
impl ResourceReconciler for TunnelReconciler {
    type Desired = TunnelDesired;
    type Observed = Tunnel;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Tunnel
    }

    fn validate(&self, desired: &TunnelDesired) -> Result<()> {
        let kind = ResourceKind::Tunnel;
        require_non_blank(kind, "source_network_id", &desired.source_network_id)?;
        require_non_blank(kind, "target_network_id", &desired.target_network_id)?;
        if desired.source_network_id == desired.target_network_id {
            return Err(Error::invalid_desired(
                kind.as_str(),
                "source and target network must differ",
            ));
        }
        Ok(())
    }

    fn requires_replacement(&self, prior: &TunnelDesired, desired: &TunnelDesired) -> Option<&'static str> {
        if prior.source_network_id != desired.source_network_id {
            Some("source_network_id")
        } else if prior.target_network_id != desired.target_network_id {
            Some("target_network_id")
        } else {
            None
        }
    }

    fn drifted(&self, _desired: &TunnelDesired, _observed: &Tunnel) -> bool {
        false
    }

    async fn create(&self, ctx: &ProviderContext, desired: &TunnelDesired) -> Result<String> {
        let request = TunnelRequest {
            source_network_id: desired.source_network_id.clone(),
            target_network_id: desired.target_network_id.clone(),
        };
        let tunnel = ctx
            .service()
            .create_tunnel(&request)
            .await
            .map_err(|e| Error::remote("create tunnel", e))?;
        info!(
            id = %tunnel.id,
            source = %tunnel.source_network_id,
            target = %tunnel.target_network_id,
            "Created tunnel"
        );
        Ok(tunnel.id)
    }

    async fn finish_create(
        &self,
        ctx: &ProviderContext,
        id: &str,
        _desired: &TunnelDesired,
    ) -> Result<Applied<Tunnel>> {
        Ok(Applied::new(id, Self::fetch(ctx, id).await?))
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &str,
        _desired: &TunnelDesired,
        _prior: Option<&Tunnel>,
    ) -> Result<Option<Tunnel>> {
        absent_if_missing(ResourceKind::Tunnel, id, ctx.service().get_tunnel(id).await)
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &str,
        _desired: &TunnelDesired,
        _prior: Option<&Tunnel>,
    ) -> Result<Applied<Tunnel>> {
        Ok(Applied::new(id, Self::fetch(ctx, id).await?))
    }

    async fn delete(&self, ctx: &ProviderContext, id: &str, _desired: &TunnelDesired) -> Result<()> {
        deleted_if_missing(ResourceKind::Tunnel, id, ctx.service().delete_tunnel(id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_to_itself_is_rejected() {
        let desired = TunnelDesired {
            source_network_id: "net-1".to_string(),
            target_network_id: "net-1".to_string(),
        };
        assert!(matches!(
            ResourceReconciler::validate(&TunnelReconciler, &desired),
            Err(Error::InvalidDesiredState { .. })
        ));
    }

    #[test]
    fn test_either_endpoint_change_requires_replacement() {
        let prior = TunnelDesired {
            source_network_id: "net-1".to_string(),
            target_network_id: "net-2".to_string(),
        };
        let moved = TunnelDesired {
            target_network_id: "net-3".to_string(),
            ..prior.clone()
        };
        assert_eq!(
            TunnelReconciler.requires_replacement(&prior, &moved),
            Some("target_network_id")
        );
    }
}
