use std::ops::RangeInclusive;

use async_trait::async_trait;
use itertools::Itertools;
use labsync_remote::types::{
    CreateEnvironmentRequest, Environment, Label, LabelRequest, Tag, UpdateEnvironmentRequest,
};
use labsync_remote::{RemoteService, Runstate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{absent_if_missing, deleted_if_missing, present, require_non_blank};
use crate::context::ProviderContext;
use crate::diff::{CollectionChanges, DiffKey, apply_removals_then_additions, diff};
use crate::error::{Error, Result};
use crate::poller::{Observation, RunstateSets};
use crate::reconciler::{Applied, ResourceReconciler};
use crate::types::{ChangeReport, ResourceKind};

/// Accepted idle timeouts, in seconds.
const IDLE_RANGE: RangeInclusive<u32> = 300..=86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentDesired {
    pub template_id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub outbound_traffic: bool,
    #[serde(default)]
    pub routable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "label")]
    pub labels: Vec<LabelRequest>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub suspend_on_idle: Option<u32>,
    #[serde(default)]
    pub suspend_at_time: Option<String>,
    #[serde(default)]
    pub shutdown_on_idle: Option<u32>,
    #[serde(default)]
    pub shutdown_at_time: Option<String>,
}

impl EnvironmentDesired {
    fn create_request(&self) -> CreateEnvironmentRequest {
        CreateEnvironmentRequest {
            template_id: self.template_id.clone(),
            name: self.name.clone(),
            description: Some(self.description.clone()),
            outbound_traffic: self.outbound_traffic,
            routable: self.routable,
            suspend_on_idle: self.suspend_on_idle,
            suspend_at_time: self.suspend_at_time.clone(),
            shutdown_on_idle: self.shutdown_on_idle,
            shutdown_at_time: self.shutdown_at_time.clone(),
            tags: self
                .tags
                .iter()
                .unique_by(|tag| tag.diff_key())
                .cloned()
                .collect(),
            labels: self.labels.iter().unique().cloned().collect(),
            user_data: self.user_data.clone(),
        }
    }

    fn update_request(&self) -> UpdateEnvironmentRequest {
        UpdateEnvironmentRequest {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            outbound_traffic: self.outbound_traffic,
            routable: self.routable,
            suspend_on_idle: self.suspend_on_idle,
            suspend_at_time: self.suspend_at_time.clone(),
            shutdown_on_idle: self.shutdown_on_idle,
            shutdown_at_time: self.shutdown_at_time.clone(),
        }
    }
}

/// Runstate used while waiting for a new environment.
///
/// The environment can report `running` before its VMs do, so it stays
/// `busy` until every VM is running too.
fn create_runstate(env: &Environment) -> Runstate {
    if env.runstate == Runstate::Running && env.vms.iter().any(|vm| vm.runstate != Runstate::Running) {
        return Runstate::Busy;
    }
    env.runstate.clone()
}

async fn fetch(service: &dyn RemoteService, id: &str) -> Result<Environment> {
    service
        .get_environment(id)
        .await
        .map_err(|e| Error::remote("read environment", e))
}

/// Environments copy a template and settle asynchronously.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentReconciler;

impl EnvironmentReconciler {
    async fn reconcile_tags(
        service: &dyn RemoteService,
        id: &str,
        desired: &[String],
        observed: &[Tag],
    ) -> Result<CollectionChanges> {
        let tags = diff(desired, observed);
        apply_removals_then_additions(
            &tags,
            |tag: &Tag| {
                let tag_id = tag.id.clone();
                async move {
                    service
                        .delete_tag(id, &tag_id)
                        .await
                        .map_err(|e| Error::remote("delete tag", e))
                }
            },
            |value: &String| {
                let value = value.clone();
                async move {
                    service
                        .create_tag(id, &value)
                        .await
                        .map(|_| ())
                        .map_err(|e| Error::remote("create tag", e))
                }
            },
        )
        .await
        .into_result("tags")
    }

    async fn reconcile_labels(
        service: &dyn RemoteService,
        id: &str,
        desired: &[LabelRequest],
        observed: &[Label],
    ) -> Result<CollectionChanges> {
        let labels = diff(desired, observed);
        apply_removals_then_additions(
            &labels,
            |label: &Label| {
                let label_id = label.id.clone();
                async move {
                    service
                        .delete_label(id, &label_id)
                        .await
                        .map_err(|e| Error::remote("delete label", e))
                }
            },
            |request: &LabelRequest| {
                let request = request.clone();
                async move {
                    service
                        .create_label(id, &request)
                        .await
                        .map(|_| ())
                        .map_err(|e| Error::remote("create label", e))
                }
            },
        )
        .await
        .into_result("labels")
    }
}

#[async_trait]
impl ResourceReconciler for EnvironmentReconciler {
    type Desired = EnvironmentDesired;
    type Observed = Environment;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Environment
    }

    fn validate(&self, desired: &EnvironmentDesired) -> Result<()> {
        let kind = ResourceKind::Environment;
        require_non_blank(kind, "template_id", &desired.template_id)?;
        require_non_blank(kind, "name", &desired.name)?;
        require_non_blank(kind, "description", &desired.description)?;

        for (field, value) in [
            ("suspend_on_idle", desired.suspend_on_idle),
            ("shutdown_on_idle", desired.shutdown_on_idle),
        ] {
            if let Some(seconds) = value.filter(|s| !IDLE_RANGE.contains(s)) {
                return Err(Error::invalid_desired(
                    kind.as_str(),
                    format!(
                        "{field} must be between {} and {} seconds, got {seconds}",
                        IDLE_RANGE.start(),
                        IDLE_RANGE.end()
                    ),
                ));
            }
        }

        for tag in &desired.tags {
            require_non_blank(kind, "tag", tag)?;
        }
        for label in &desired.labels {
            require_non_blank(kind, "label category", &label.category)?;
            require_non_blank(kind, "label value", &label.value)?;
        }
        Ok(())
    }

    fn requires_replacement(
        &self,
        prior: &EnvironmentDesired,
        desired: &EnvironmentDesired,
    ) -> Option<&'static str> {
        (prior.template_id != desired.template_id).then_some("template_id")
    }

    fn drifted(&self, desired: &EnvironmentDesired, observed: &Environment) -> bool {
        let scalars = observed.name != desired.name
            || observed.description.as_deref() != Some(desired.description.as_str())
            || observed.outbound_traffic.is_some_and(|v| v != desired.outbound_traffic)
            || observed.routable.is_some_and(|v| v != desired.routable)
            || (desired.suspend_on_idle.is_some() && observed.suspend_on_idle != desired.suspend_on_idle)
            || (desired.suspend_at_time.is_some() && observed.suspend_at_time != desired.suspend_at_time)
            || (desired.shutdown_on_idle.is_some() && observed.shutdown_on_idle != desired.shutdown_on_idle)
            || (desired.shutdown_at_time.is_some() && observed.shutdown_at_time != desired.shutdown_at_time);
        scalars
            || !diff(&desired.tags, &observed.tags).is_empty()
            || !diff(&desired.labels, &observed.labels).is_empty()
            || observed.user_data.as_deref().unwrap_or_default()
                != desired.user_data.as_deref().unwrap_or_default()
    }

    async fn create(&self, ctx: &ProviderContext, desired: &EnvironmentDesired) -> Result<String> {
        let env = ctx
            .service()
            .create_environment(&desired.create_request())
            .await
            .map_err(|e| Error::remote("create environment", e))?;
        info!(id = %env.id, template_id = %desired.template_id, "Created environment");
        Ok(env.id)
    }

    async fn finish_create(
        &self,
        ctx: &ProviderContext,
        id: &str,
        _desired: &EnvironmentDesired,
    ) -> Result<Applied<Environment>> {
        let service = ctx.service();
        let config = ctx.runstate_wait(
            RunstateSets::CREATE,
            ctx.timeouts(ResourceKind::Environment).create,
        );
        let env = ctx
            .waiter()
            .await_state(&config, move || async move {
                let env = fetch(service, id).await?;
                let label = create_runstate(&env).to_string();
                Ok(Observation::new(env, label))
            })
            .await?;
        info!(id, vms = env.vms.len(), "Environment running");
        Ok(Applied::new(id, env))
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &str,
        _desired: &EnvironmentDesired,
        _prior: Option<&Environment>,
    ) -> Result<Option<Environment>> {
        absent_if_missing(
            ResourceKind::Environment,
            id,
            ctx.service().get_environment(id).await,
        )
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &EnvironmentDesired,
        _prior: Option<&Environment>,
    ) -> Result<Applied<Environment>> {
        let service = ctx.service();
        service
            .update_environment(id, &desired.update_request())
            .await
            .map_err(|e| Error::remote("update environment", e))?;

        let config = ctx.runstate_wait(
            RunstateSets::UPDATE,
            ctx.timeouts(ResourceKind::Environment).update,
        );
        let env = ctx
            .waiter()
            .await_state(&config, move || async move {
                let env = fetch(service, id).await?;
                let label = env.runstate.as_str().to_string();
                Ok(Observation::new(env, label))
            })
            .await?;

        let mut report = ChangeReport::new();
        report.record(
            "tags",
            Self::reconcile_tags(service, id, &desired.tags, &env.tags).await?,
        );
        report.record(
            "labels",
            Self::reconcile_labels(service, id, &desired.labels, &env.labels).await?,
        );

        let user_data = desired.user_data.as_deref().unwrap_or_default();
        if env.user_data.as_deref().unwrap_or_default() != user_data {
            service
                .update_user_data(id, user_data)
                .await
                .map_err(|e| Error::remote("update user data", e))?;
            report.record("user_data", CollectionChanges { removed: 0, added: 1 });
        }

        debug!(id, changes = report.total(), "Environment collections reconciled");
        let env = fetch(service, id).await?;
        Ok(Applied::new(id, env).with_report(report))
    }

    async fn delete(&self, ctx: &ProviderContext, id: &str, _desired: &EnvironmentDesired) -> Result<()> {
        let service = ctx.service();
        deleted_if_missing(
            ResourceKind::Environment,
            id,
            service.delete_environment(id).await,
        )?;

        let config = ctx.absence_wait(ctx.timeouts(ResourceKind::Environment).delete);
        ctx.waiter()
            .await_absence(&config, move || async move {
                present(service.get_environment(id).await)
            })
            .await?;
        info!(id, "Environment deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use labsync_remote::InMemoryRemoteService;
    use labsync_remote::types::VmSummary;
    use std::sync::Arc;
    use std::time::Duration;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn harness() -> (Arc<InMemoryRemoteService>, Arc<ManualClock>, ProviderContext) {
        let service = Arc::new(InMemoryRemoteService::new().with_template("tpl-1", &[("t-1", "web")]));
        let clock = Arc::new(ManualClock::new());
        let ctx = ProviderContext::new(service.clone()).with_clock(clock.clone());
        (service, clock, ctx)
    }

    fn desired(tags: &[&str]) -> EnvironmentDesired {
        EnvironmentDesired {
            template_id: "tpl-1".to_string(),
            name: "lab".to_string(),
            description: "training lab".to_string(),
            outbound_traffic: false,
            routable: false,
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            labels: vec![LabelRequest {
                category: "owner".to_string(),
                value: "ops".to_string(),
            }],
            user_data: None,
            suspend_on_idle: Some(3_600),
            suspend_at_time: None,
            shutdown_on_idle: None,
            shutdown_at_time: None,
        }
    }

    fn summary(runstate: Runstate) -> VmSummary {
        VmSummary {
            id: "1".to_string(),
            name: "web".to_string(),
            runstate,
        }
    }

    fn environment(runstate: Runstate, vms: Vec<VmSummary>) -> Environment {
        Environment {
            id: "env-1".to_string(),
            name: "lab".to_string(),
            description: None,
            runstate,
            outbound_traffic: None,
            routable: None,
            suspend_on_idle: None,
            suspend_at_time: None,
            shutdown_on_idle: None,
            shutdown_at_time: None,
            user_data: None,
            tags: Vec::new(),
            labels: Vec::new(),
            vms,
        }
    }

    #[test]
    fn test_running_environment_with_busy_vm_is_busy() {
        let env = environment(Runstate::Running, vec![summary(Runstate::Busy)]);
        assert_eq!(create_runstate(&env), Runstate::Busy);

        let env = environment(Runstate::Running, vec![summary(Runstate::Running)]);
        assert_eq!(create_runstate(&env), Runstate::Running);

        let env = environment(Runstate::Other("error".to_string()), vec![summary(Runstate::Busy)]);
        assert_eq!(create_runstate(&env).as_str(), "error");
    }

    /// Given a template with one VM
    /// When the environment is created
    /// Then creation waits until the VM is running and sends tags up front
    #[tokio::test]
    async fn test_create_waits_for_vms() -> TestResult {
        let (service, clock, ctx) = harness();
        let reconciler = EnvironmentReconciler;
        let desired = desired(&["Web", "web", "prod"]);

        let id = reconciler.create(&ctx, &desired).await?;
        let applied = reconciler.finish_create(&ctx, &id, &desired).await?;

        assert_eq!(applied.observed.runstate, Runstate::Running);
        assert!(applied.observed.vms.iter().all(|vm| vm.runstate == Runstate::Running));
        assert_eq!(applied.observed.tags.len(), 2);
        assert_eq!(service.call_count("get_environment").await, 2);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(10), Duration::from_secs(10)]
        );
        Ok(())
    }

    /// Given an environment tagged "Foo"
    /// When updated to "foo" plus "bar", then updated again unchanged
    /// Then only "bar" is added and the second pass changes nothing
    #[tokio::test]
    async fn test_update_is_idempotent() -> TestResult {
        let (service, _clock, ctx) = harness();
        let reconciler = EnvironmentReconciler;
        let id = reconciler.create(&ctx, &desired(&["Foo"])).await?;
        reconciler.finish_create(&ctx, &id, &desired(&["Foo"])).await?;

        let first = reconciler.update(&ctx, &id, &desired(&["foo", "bar"]), None).await?;
        assert_eq!(
            first.report.collections.get("tags"),
            Some(&CollectionChanges { removed: 0, added: 1 })
        );
        let values: Vec<&str> = first.observed.tags.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(values, vec!["Foo", "bar"]);

        let second = reconciler.update(&ctx, &id, &desired(&["foo", "bar"]), None).await?;
        assert!(second.report.is_empty());
        assert_eq!(service.call_count("delete_tag").await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_label_change_removes_before_adding() -> TestResult {
        let (service, _clock, ctx) = harness();
        let reconciler = EnvironmentReconciler;
        let original = desired(&[]);
        let id = reconciler.create(&ctx, &original).await?;
        reconciler.finish_create(&ctx, &id, &original).await?;

        let mut changed = original.clone();
        changed.labels = vec![LabelRequest {
            category: "owner".to_string(),
            value: "dev".to_string(),
        }];
        let applied = reconciler.update(&ctx, &id, &changed, None).await?;

        assert_eq!(
            applied.report.collections.get("labels"),
            Some(&CollectionChanges { removed: 1, added: 1 })
        );
        let calls = service.calls().await;
        let removed = calls.iter().position(|c| c.starts_with("delete_label"));
        let added = calls.iter().position(|c| c.starts_with("create_label"));
        assert!(matches!((removed, added), (Some(r), Some(a)) if r < a));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_then_read_is_absence() -> TestResult {
        let (_service, _clock, ctx) = harness();
        let reconciler = EnvironmentReconciler;
        let desired = desired(&[]);
        let id = reconciler.create(&ctx, &desired).await?;
        reconciler.finish_create(&ctx, &id, &desired).await?;

        reconciler.delete(&ctx, &id, &desired).await?;
        assert_eq!(reconciler.read(&ctx, &id, &desired, None).await?, None);
        reconciler.delete(&ctx, &id, &desired).await?;
        Ok(())
    }

    /// Given a created environment
    /// When its remote copy loses a tag or changes a declared setting
    /// Then it reads as drifted, and an unset optional setting is ignored
    #[tokio::test]
    async fn test_drift_is_detected_against_desired() -> TestResult {
        let (_service, _clock, ctx) = harness();
        let reconciler = EnvironmentReconciler;
        let desired = desired(&["web"]);
        let id = reconciler.create(&ctx, &desired).await?;
        let observed = reconciler.finish_create(&ctx, &id, &desired).await?.observed;
        assert!(!reconciler.drifted(&desired, &observed));

        let mut untagged = observed.clone();
        untagged.tags.clear();
        assert!(reconciler.drifted(&desired, &untagged));

        let mut resized = observed.clone();
        resized.suspend_on_idle = Some(7_200);
        assert!(reconciler.drifted(&desired, &resized));

        let mut scheduled = observed;
        scheduled.shutdown_at_time = Some("2026/01/01 18:00:00".to_string());
        assert!(!reconciler.drifted(&desired, &scheduled));
        Ok(())
    }

    #[test]
    fn test_idle_range_is_enforced() {
        let mut desired = desired(&[]);
        desired.shutdown_on_idle = Some(60);
        assert!(matches!(
            ResourceReconciler::validate(&EnvironmentReconciler, &desired),
            Err(Error::InvalidDesiredState { .. })
        ));
        desired.shutdown_on_idle = Some(86_400);
        assert!(ResourceReconciler::validate(&EnvironmentReconciler, &desired).is_ok());
    }

    #[test]
    fn test_template_change_requires_replacement() {
        let prior = desired(&[]);
        let mut next = prior.clone();
        next.name = "renamed".to_string();
        assert_eq!(EnvironmentReconciler.requires_replacement(&prior, &next), None);
        next.template_id = "tpl-2".to_string();
        assert_eq!(
            EnvironmentReconciler.requires_replacement(&prior, &next),
            Some("template_id")
        );
    }
}
