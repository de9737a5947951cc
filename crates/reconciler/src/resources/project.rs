use async_trait::async_trait;
use labsync_remote::types::{Project, ProjectRequest, ProjectRole};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{absent_if_missing, deleted_if_missing, require_non_blank};
use crate::context::ProviderContext;
use crate::error::{Error, Result};
use crate::reconciler::{Applied, ResourceReconciler};
use crate::types::ResourceKind;

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDesired {
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub auto_add_role_name: Option<ProjectRole>,
    #[serde(default = "default_true")]
    pub show_project_members: bool,
}

impl ProjectDesired {
    fn request(&self) -> ProjectRequest {
        ProjectRequest {
            name: self.name.clone(),
            summary: self.summary.clone(),
            auto_add_role_name: self.auto_add_role_name,
            show_project_members: self.show_project_members,
        }
    }
}

/// Projects are synchronous: no settle wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectReconciler;

#[async_trait]
impl ResourceReconciler for ProjectReconciler {
    type Desired = ProjectDesired;
    type Observed = Project;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Project
    }

    fn validate(&self, desired: &ProjectDesired) -> Result<()> {
        require_non_blank(ResourceKind::Project, "name", &desired.name)
    }

    fn requires_replacement(&self, _prior: &ProjectDesired, _desired: &ProjectDesired) -> Option<&'static str> {
        None
    }

    fn drifted(&self, desired: &ProjectDesired, observed: &Project) -> bool {
        observed.name != desired.name
            || observed.show_project_members != desired.show_project_members
            || (desired.summary.is_some() && observed.summary != desired.summary)
            || desired
                .auto_add_role_name
                .is_some_and(|role| observed.auto_add_role_name != Some(role))
    }

    async fn create(&self, ctx: &ProviderContext, desired: &ProjectDesired) -> Result<String> {
        let project = ctx
            .service()
            .create_project(&desired.request())
            .await
            .map_err(|e| Error::remote("create project", e))?;
        info!(id = %project.id, name = %project.name, "Created project");
        Ok(project.id)
    }

    async fn finish_create(
        &self,
        ctx: &ProviderContext,
        id: &str,
        _desired: &ProjectDesired,
    ) -> Result<Applied<Project>> {
        let project = ctx
            .service()
            .get_project(id)
            .await
            .map_err(|e| Error::remote("read project", e))?;
        Ok(Applied::new(id, project))
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &str,
        _desired: &ProjectDesired,
        _prior: Option<&Project>,
    ) -> Result<Option<Project>> {
        absent_if_missing(ResourceKind::Project, id, ctx.service().get_project(id).await)
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &ProjectDesired,
        _prior: Option<&Project>,
    ) -> Result<Applied<Project>> {
        let project = ctx
            .service()
            .update_project(id, &desired.request())
            .await
            .map_err(|e| Error::remote("update project", e))?;
        Ok(Applied::new(id, project))
    }

    async fn delete(&self, ctx: &ProviderContext, id: &str, _desired: &ProjectDesired) -> Result<()> {
        deleted_if_missing(ResourceKind::Project, id, ctx.service().delete_project(id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labsync_remote::InMemoryRemoteService;
    use std::sync::Arc;

    fn desired(name: &str) -> ProjectDesired {
        ProjectDesired {
            name: name.to_string(),
            summary: Some("training".to_string()),
            auto_add_role_name: Some(ProjectRole::Participant),
            show_project_members: true,
        }
    }

    #[tokio::test]
    async fn test_project_lifecycle() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let ctx = ProviderContext::new(Arc::new(InMemoryRemoteService::new()));
        let reconciler = ProjectReconciler;

        let id = reconciler.create(&ctx, &desired("course")).await?;
        let applied = reconciler.finish_create(&ctx, &id, &desired("course")).await?;
        assert_eq!(applied.observed.name, "course");
        assert_eq!(applied.observed.auto_add_role_name, Some(ProjectRole::Participant));

        let updated = reconciler.update(&ctx, &id, &desired("renamed"), None).await?;
        assert_eq!(updated.observed.name, "renamed");

        reconciler.delete(&ctx, &id, &desired("renamed")).await?;
        let after = reconciler.read(&ctx, &id, &desired("renamed"), None).await?;
        assert_eq!(after, None);

        // deleting twice is still success
        reconciler.delete(&ctx, &id, &desired("renamed")).await?;
        Ok(())
    }

    #[test]
    fn test_show_project_members_defaults_true() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let desired: ProjectDesired = serde_json::from_value(serde_json::json!({ "name": "p" }))?;
        assert!(desired.show_project_members);
        assert!(ResourceReconciler::validate(&ProjectReconciler, &desired).is_ok());
        Ok(())
    }
}
