use std::net::Ipv4Addr;

use async_trait::async_trait;
use labsync_remote::types::{Network, NetworkRequest};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{absent_if_missing, deleted_if_missing, require_non_blank};
use crate::context::ProviderContext;
use crate::error::{Error, Result};
use crate::reconciler::{Applied, ResourceReconciler};
use crate::types::ResourceKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDesired {
    pub environment_id: String,
    pub name: String,
    pub domain: String,
    pub subnet: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub tunnelable: bool,
}

impl NetworkDesired {
    fn request(&self) -> NetworkRequest {
        NetworkRequest {
            name: self.name.clone(),
            domain: self.domain.clone(),
            subnet: self.subnet.clone(),
            gateway: self.gateway.clone(),
            tunnelable: self.tunnelable,
        }
    }
}

/// Whether `subnet` is IPv4 CIDR notation.
fn is_cidr(subnet: &str) -> bool {
    subnet.split_once('/').is_some_and(|(addr, prefix)| {
        addr.parse::<Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
    })
}

/// Networks live inside an environment and are synchronous.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkReconciler;

#[async_trait]
impl ResourceReconciler for NetworkReconciler {
    type Desired = NetworkDesired;
    type Observed = Network;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn validate(&self, desired: &NetworkDesired) -> Result<()> {
        let kind = ResourceKind::Network;
        require_non_blank(kind, "environment_id", &desired.environment_id)?;
        require_non_blank(kind, "name", &desired.name)?;
        require_non_blank(kind, "domain", &desired.domain)?;
        if !is_cidr(&desired.subnet) {
            return Err(Error::invalid_desired(
                kind.as_str(),
                format!("subnet '{}' is not IPv4 CIDR notation", desired.subnet),
            ));
        }
        if let Some(gateway) = desired
            .gateway
            .as_ref()
            .filter(|gateway| gateway.parse::<Ipv4Addr>().is_err())
        {
            return Err(Error::invalid_desired(
                kind.as_str(),
                format!("gateway '{gateway}' is not an IPv4 address"),
            ));
        }
        Ok(())
    }

    fn requires_replacement(&self, prior: &NetworkDesired, desired: &NetworkDesired) -> Option<&'static str> {
        (prior.environment_id != desired.environment_id).then_some("environment_id")
    }

    fn drifted(&self, desired: &NetworkDesired, observed: &Network) -> bool {
        observed.name != desired.name
            || observed.domain != desired.domain
            || observed.subnet != desired.subnet
            || observed.tunnelable != desired.tunnelable
            || (desired.gateway.is_some() && observed.gateway != desired.gateway)
    }

    async fn create(&self, ctx: &ProviderContext, desired: &NetworkDesired) -> Result<String> {
        let network = ctx
            .service()
            .create_network(&desired.environment_id, &desired.request())
            .await
            .map_err(|e| Error::remote("create network", e))?;
        info!(id = %network.id, environment_id = %desired.environment_id, "Created network");
        Ok(network.id)
    }

    async fn finish_create(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &NetworkDesired,
    ) -> Result<Applied<Network>> {
        let network = ctx
            .service()
            .get_network(&desired.environment_id, id)
            .await
            .map_err(|e| Error::remote("read network", e))?;
        Ok(Applied::new(id, network))
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &NetworkDesired,
        _prior: Option<&Network>,
    ) -> Result<Option<Network>> {
        absent_if_missing(
            ResourceKind::Network,
            id,
            ctx.service().get_network(&desired.environment_id, id).await,
        )
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &NetworkDesired,
        _prior: Option<&Network>,
    ) -> Result<Applied<Network>> {
        let network = ctx
            .service()
            .update_network(&desired.environment_id, id, &desired.request())
            .await
            .map_err(|e| Error::remote("update network", e))?;
        Ok(Applied::new(id, network))
    }

    async fn delete(&self, ctx: &ProviderContext, id: &str, desired: &NetworkDesired) -> Result<()> {
        deleted_if_missing(
            ResourceKind::Network,
            id,
            ctx.service().delete_network(&desired.environment_id, id).await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(subnet: &str) -> NetworkDesired {
        NetworkDesired {
            environment_id: "env-1".to_string(),
            name: "lan".to_string(),
            domain: "lab.test".to_string(),
            subnet: subnet.to_string(),
            gateway: Some("10.0.0.254".to_string()),
            tunnelable: true,
        }
    }

    #[test]
    fn test_subnet_must_be_cidr() {
        assert!(ResourceReconciler::validate(&NetworkReconciler, &desired("10.0.0.0/24")).is_ok());
        assert!(ResourceReconciler::validate(&NetworkReconciler, &desired("10.0.0.0")).is_err());
        assert!(ResourceReconciler::validate(&NetworkReconciler, &desired("10.0.0.0/33")).is_err());
    }

    #[test]
    fn test_environment_change_requires_replacement() {
        let prior = desired("10.0.0.0/24");
        let mut next = prior.clone();
        next.subnet = "10.0.1.0/24".to_string();
        assert_eq!(NetworkReconciler.requires_replacement(&prior, &next), None);
        next.environment_id = "env-2".to_string();
        assert_eq!(
            NetworkReconciler.requires_replacement(&prior, &next),
            Some("environment_id")
        );
    }
}
