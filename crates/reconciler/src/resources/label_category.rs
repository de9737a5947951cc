use async_trait::async_trait;
use labsync_remote::types::{LabelCategory, LabelCategoryRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{absent_if_missing, deleted_if_missing, require_non_blank};
use crate::context::ProviderContext;
use crate::error::{Error, Result};
use crate::reconciler::{Applied, ResourceReconciler};
use crate::types::ResourceKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelCategoryDesired {
    pub name: String,
    #[serde(default)]
    pub single_value: bool,
}

/// Label categories are account-wide and have no mutable fields.
///
/// The service cannot remove a category, so delete disables it and a
/// disabled category reads as absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelCategoryReconciler;

impl LabelCategoryReconciler {
    async fn fetch(ctx: &ProviderContext, id: &str) -> Result<Option<LabelCategory>> {
        let category = absent_if_missing(
            ResourceKind::LabelCategory,
            id,
            ctx.service().get_label_category(id).await,
        )?;
        Ok(category.filter(|category| {
            if !category.enabled {
                debug!(id, "Label category is disabled");
            }
            category.enabled
        }))
    }
}

#[async_trait]
impl ResourceReconciler for LabelCategoryReconciler {
    type Desired = LabelCategoryDesired;
    type Observed = LabelCategory;

    fn kind(&self) -> ResourceKind {
        ResourceKind::LabelCategory
    }

    fn validate(&self, desired: &LabelCategoryDesired) -> Result<()> {
        require_non_blank(ResourceKind::LabelCategory, "name", &desired.name)
    }

    fn requires_replacement(
        &self,
        prior: &LabelCategoryDesired,
        desired: &LabelCategoryDesired,
    ) -> Option<&'static str> {
        if prior.name != desired.name {
            Some("name")
        } else if prior.single_value != desired.single_value {
            Some("single_value")
        } else {
            None
        }
    }

    fn drifted(&self, _desired: &LabelCategoryDesired, _observed: &LabelCategory) -> bool {
        false
    }

    async fn create(&self, ctx: &ProviderContext, desired: &LabelCategoryDesired) -> Result<String> {
        let request = LabelCategoryRequest {
            name: desired.name.clone(),
            single_value: desired.single_value,
        };
        let category = ctx
            .service()
            .create_label_category(&request)
            .await
            .map_err(|e| Error::remote("create label category", e))?;
        info!(id = %category.id, name = %category.name, "Created label category");
        Ok(category.id)
    }

    async fn finish_create(
        &self,
        ctx: &ProviderContext,
        id: &str,
        _desired: &LabelCategoryDesired,
    ) -> Result<Applied<LabelCategory>> {
        let category = Self::fetch(ctx, id)
            .await?
            .ok_or_else(|| Error::not_found(format!("label category {id}")))?;
        Ok(Applied::new(id, category))
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &str,
        _desired: &LabelCategoryDesired,
        _prior: Option<&LabelCategory>,
    ) -> Result<Option<LabelCategory>> {
        Self::fetch(ctx, id).await
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &LabelCategoryDesired,
        _prior: Option<&LabelCategory>,
    ) -> Result<Applied<LabelCategory>> {
        // Every field is immutable; an update only re-reads.
        self.finish_create(ctx, id, desired).await
    }

    async fn delete(&self, ctx: &ProviderContext, id: &str, _desired: &LabelCategoryDesired) -> Result<()> {
        deleted_if_missing(
            ResourceKind::LabelCategory,
            id,
            ctx.service().delete_label_category(id).await,
        )
    }
}
