//! Engine lifecycle tests against the in-memory remote service.
//!
//! Tests verify that:
//! - Apply picks create, refresh, update, re-create or replace from recorded state
//! - A partially applied update keeps the old desired state and converges on retry
//! - Changes made behind our back are corrected when desired state is unchanged
//! - Cross-resource references resolve to recorded ids
//! - Records survive a restart when kept in a state file

use std::sync::Arc;

use labsync_reconciler::{
    Engine, Error, FileStateStore, InMemoryStateStore, ManualClock, ProviderContext,
    ReconcileAction, Registry, ResourceAddress, ResourceKind, StateStore,
};
use labsync_remote::InMemoryRemoteService;
use serde_json::{Value, json};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn service() -> Arc<InMemoryRemoteService> {
    Arc::new(
        InMemoryRemoteService::new()
            .with_template("tpl-1", &[("t-1", "web")])
            .with_template("tpl-2", &[("t-2", "db")]),
    )
}

fn engine_with(service: &Arc<InMemoryRemoteService>, store: Arc<dyn StateStore>) -> Engine {
    let ctx = ProviderContext::new(service.clone()).with_clock(Arc::new(ManualClock::new()));
    Engine::new(Registry::standard(), store, ctx)
}

fn engine(service: &Arc<InMemoryRemoteService>) -> Engine {
    engine_with(service, Arc::new(InMemoryStateStore::new()))
}

fn lab() -> ResourceAddress {
    ResourceAddress::new(ResourceKind::Environment, "lab")
}

fn environment(template_id: &str, tags: &[&str]) -> Value {
    json!({
        "template_id": template_id,
        "name": "lab",
        "description": "training lab",
        "tags": tags,
        "label": [{ "label_category": "owner", "value": "ops" }],
    })
}

mod apply_tests {
    use super::*;

    // ==========================================================================
    // ACTION SELECTION
    // ==========================================================================

    #[tokio::test]
    async fn first_apply_creates_and_second_only_refreshes() -> TestResult {
        // GIVEN: An empty state store
        let service = service();
        let engine = engine(&service);

        // WHEN: The same environment is applied twice
        let created = engine.apply(&lab(), environment("tpl-1", &["a"])).await?;
        let again = engine.apply(&lab(), environment("tpl-1", &["a"])).await?;

        // THEN: The second pass makes no remote mutation
        assert_eq!(created.action, ReconcileAction::Create);
        assert!(created.id.is_some());
        assert_eq!(again.action, ReconcileAction::Refresh);
        assert_eq!(again.id, created.id);
        assert!(again.report.is_empty());
        assert_eq!(service.call_count("update_environment").await, 0);
        assert_eq!(service.call_count("create_tag").await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn changed_desired_state_updates_in_place() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let created = engine.apply(&lab(), environment("tpl-1", &["a"])).await?;

        let updated = engine.apply(&lab(), environment("tpl-1", &["b"])).await?;

        assert_eq!(updated.action, ReconcileAction::Update);
        assert_eq!(updated.id, created.id);
        let tags = updated.report.collections.get("tags").copied().unwrap_or_default();
        assert_eq!((tags.removed, tags.added), (1, 1));
        Ok(())
    }

    #[tokio::test]
    async fn resource_deleted_behind_our_back_is_recreated() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let created = engine.apply(&lab(), environment("tpl-1", &[])).await?;
        let old_id = created.id.unwrap_or_default();
        assert!(service.drop_environment(&old_id).await);

        let recreated = engine.apply(&lab(), environment("tpl-1", &[])).await?;

        assert_eq!(recreated.action, ReconcileAction::Recreate);
        assert!(recreated.id.is_some_and(|id| id != old_id));
        assert_eq!(service.call_count("create_environment").await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn template_change_replaces_the_environment() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let created = engine.apply(&lab(), environment("tpl-1", &[])).await?;

        let replaced = engine.apply(&lab(), environment("tpl-2", &[])).await?;

        assert!(matches!(
            &replaced.action,
            ReconcileAction::Replace { reason } if reason.contains("template_id")
        ));
        assert_ne!(replaced.id, created.id);
        assert_eq!(service.call_count("delete_environment").await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_desired_state_is_rejected_before_any_call() -> TestResult {
        let service = service();
        let engine = engine(&service);

        let result = engine
            .apply(&lab(), json!({ "template_id": "tpl-1", "name": "lab" }))
            .await;

        assert!(matches!(result, Err(Error::InvalidDesiredState { .. })));
        assert!(service.calls().await.is_empty());
        assert!(engine.records().await?.is_empty());
        Ok(())
    }
}

mod partial_failure_tests {
    use super::*;

    #[tokio::test]
    async fn failed_update_keeps_old_desired_state_and_retry_converges() -> TestResult {
        // GIVEN: A settled environment and a tag create that will fail once
        let service = service();
        let engine = engine(&service);
        engine.apply(&lab(), environment("tpl-1", &["a"])).await?;
        service.fail_next("create_tag", 500).await;

        // WHEN: A new tag is declared
        let failed = engine.apply(&lab(), environment("tpl-1", &["a", "b"])).await;

        // THEN: The record still holds the previous desired state
        assert!(failed.is_err());
        let records = engine.records().await?;
        let recorded = records.first().and_then(|(_, record)| record.desired.clone());
        assert_eq!(recorded, Some(environment("tpl-1", &["a"])));

        // AND: The next apply finishes the update
        let retried = engine.apply(&lab(), environment("tpl-1", &["a", "b"])).await?;
        assert_eq!(retried.action, ReconcileAction::Update);
        let tags = retried.report.collections.get("tags").copied().unwrap_or_default();
        assert_eq!((tags.removed, tags.added), (0, 1));

        let settled = engine.apply(&lab(), environment("tpl-1", &["a", "b"])).await?;
        assert_eq!(settled.action, ReconcileAction::Refresh);
        Ok(())
    }

    #[tokio::test]
    async fn failed_create_leaves_no_record() -> TestResult {
        let service = service();
        let engine = engine(&service);
        service.fail_next("create_environment", 503).await;

        assert!(engine.apply(&lab(), environment("tpl-1", &[])).await.is_err());
        assert!(engine.records().await?.is_empty());

        let created = engine.apply(&lab(), environment("tpl-1", &[])).await?;
        assert_eq!(created.action, ReconcileAction::Create);
        Ok(())
    }
}

mod drift_tests {
    use super::*;
    use labsync_reconciler::CollectionChanges;
    use labsync_remote::RemoteService;
    use labsync_remote::types::{UpdateEnvironmentRequest, UpdateVmRequest};

    // ==========================================================================
    // OUT-OF-BAND CHANGES
    // ==========================================================================

    fn web() -> ResourceAddress {
        ResourceAddress::new(ResourceKind::Vm, "web")
    }

    fn vm() -> Value {
        json!({
            "environment_id": "ref:environment.lab",
            "template_id": "tpl-1",
            "vm_id": "t-1",
            "cpus": 2,
            "disk": [{ "name": "data", "size": 10_240 }],
            "network_interface": [{
                "interface_type": "vmxnet3",
                "network_id": "ref:network.lan",
                "ip": "10.0.0.5",
                "published_service": [{ "name": "ssh", "internal_port": 22 }],
            }],
        })
    }

    /// Value at a JSON pointer inside the recorded observed state.
    async fn observed_at(
        engine: &Engine,
        address: &ResourceAddress,
        pointer: &str,
    ) -> Result<String, Box<dyn std::error::Error>> {
        let value = engine
            .records()
            .await?
            .into_iter()
            .find(|(recorded, _)| recorded == address)
            .and_then(|(_, record)| record.observed)
            .and_then(|observed| observed.pointer(pointer).cloned());
        match value {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Ok(other.to_string()),
            None => Err(format!("nothing recorded at {pointer}").into()),
        }
    }

    /// Environment, network and VM applied; returns the environment and VM ids.
    async fn lab_with_vm(engine: &Engine) -> Result<(String, String), Box<dyn std::error::Error>> {
        let env = engine.apply(&lab(), environment("tpl-1", &[])).await?;
        engine
            .apply(
                &ResourceAddress::new(ResourceKind::Network, "lan"),
                json!({
                    "environment_id": "ref:environment.lab",
                    "name": "lan",
                    "domain": "lab.test",
                    "subnet": "10.0.0.0/24",
                }),
            )
            .await?;
        let created = engine.apply(&web(), vm()).await?;
        Ok((env.id.unwrap_or_default(), created.id.unwrap_or_default()))
    }

    #[tokio::test]
    async fn tag_removed_out_of_band_is_restored() -> TestResult {
        // GIVEN: An environment tagged "a" whose tags were cleared remotely
        let service = service();
        let engine = engine(&service);
        let created = engine.apply(&lab(), environment("tpl-1", &["a"])).await?;
        service.set_tags(&created.id.unwrap_or_default(), &[]).await?;

        // WHEN: The unchanged desired state is applied again
        let corrected = engine.apply(&lab(), environment("tpl-1", &["a"])).await?;
        let settled = engine.apply(&lab(), environment("tpl-1", &["a"])).await?;

        // THEN: The tag is re-created once and the next pass is quiet
        assert_eq!(corrected.action, ReconcileAction::Update);
        assert_eq!(
            corrected.report.collections.get("tags"),
            Some(&CollectionChanges { removed: 0, added: 1 })
        );
        assert_eq!(service.call_count("create_tag").await, 1);
        assert_eq!(settled.action, ReconcileAction::Refresh);
        assert_eq!(observed_at(&engine, &lab(), "/tags/0/value").await?, "a");
        Ok(())
    }

    #[tokio::test]
    async fn tag_added_out_of_band_is_removed() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let created = engine.apply(&lab(), environment("tpl-1", &["a"])).await?;
        service
            .set_tags(&created.id.unwrap_or_default(), &["A", "stray"])
            .await?;

        let corrected = engine.apply(&lab(), environment("tpl-1", &["a"])).await?;

        assert_eq!(
            corrected.report.collections.get("tags"),
            Some(&CollectionChanges { removed: 1, added: 0 })
        );
        assert_eq!(service.call_count("delete_tag").await, 1);
        assert_eq!(service.call_count("create_tag").await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn label_deleted_out_of_band_is_restored() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let created = engine.apply(&lab(), environment("tpl-1", &[])).await?;
        let env_id = created.id.unwrap_or_default();
        let label_id = observed_at(&engine, &lab(), "/labels/0/id").await?;
        service.delete_label(&env_id, &label_id).await?;

        let corrected = engine.apply(&lab(), environment("tpl-1", &[])).await?;

        assert_eq!(corrected.action, ReconcileAction::Update);
        assert_eq!(
            corrected.report.collections.get("labels"),
            Some(&CollectionChanges { removed: 0, added: 1 })
        );
        assert_eq!(observed_at(&engine, &lab(), "/labels/0/value").await?, "ops");
        Ok(())
    }

    #[tokio::test]
    async fn renamed_environment_is_renamed_back() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let created = engine.apply(&lab(), environment("tpl-1", &[])).await?;
        let renamed = UpdateEnvironmentRequest {
            name: "someone else's lab".to_string(),
            description: Some("training lab".to_string()),
            ..UpdateEnvironmentRequest::default()
        };
        service
            .update_environment(&created.id.unwrap_or_default(), &renamed)
            .await?;

        let corrected = engine.apply(&lab(), environment("tpl-1", &[])).await?;

        assert_eq!(corrected.action, ReconcileAction::Update);
        assert_eq!(service.call_count("update_environment").await, 2);
        assert_eq!(observed_at(&engine, &lab(), "/name").await?, "lab");
        Ok(())
    }

    #[tokio::test]
    async fn disk_removed_out_of_band_is_added_back() -> TestResult {
        // GIVEN: A VM whose declared disk was removed remotely
        let service = service();
        let engine = engine(&service);
        let (env_id, vm_id) = lab_with_vm(&engine).await?;
        let disk_id = observed_at(&engine, &web(), "/disks/0/id").await?;
        service.remove_disk(&env_id, &vm_id, &disk_id).await?;

        // WHEN: The unchanged VM is applied again
        let corrected = engine.apply(&web(), vm()).await?;
        let settled = engine.apply(&web(), vm()).await?;

        // THEN: One disk is added and bound to the declared name
        assert_eq!(corrected.action, ReconcileAction::Update);
        assert_eq!(
            corrected.report.collections.get("disks"),
            Some(&CollectionChanges { removed: 0, added: 1 })
        );
        assert_eq!(service.call_count("add_disk").await, 2);
        assert_eq!(observed_at(&engine, &web(), "/disks/0/name").await?, "data");
        assert_eq!(settled.action, ReconcileAction::Refresh);
        Ok(())
    }

    #[tokio::test]
    async fn published_service_deleted_out_of_band_is_recreated() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let (env_id, vm_id) = lab_with_vm(&engine).await?;
        let nic_id = observed_at(&engine, &web(), "/interfaces/0/id").await?;
        let service_id = observed_at(&engine, &web(), "/interfaces/0/services/0/id").await?;
        service
            .delete_published_service(&env_id, &vm_id, &nic_id, &service_id)
            .await?;

        let corrected = engine.apply(&web(), vm()).await?;

        assert_eq!(corrected.action, ReconcileAction::Update);
        assert_eq!(
            corrected.report.collections.get("published_services"),
            Some(&CollectionChanges { removed: 0, added: 1 })
        );
        assert_eq!(
            observed_at(&engine, &web(), "/interfaces/0/services/0/name").await?,
            "ssh"
        );
        Ok(())
    }

    #[tokio::test]
    async fn resized_vm_is_resized_back() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let (env_id, vm_id) = lab_with_vm(&engine).await?;
        let resize = UpdateVmRequest {
            cpus: Some(4),
            ..UpdateVmRequest::default()
        };
        service.update_vm(&env_id, &vm_id, &resize).await?;

        let corrected = engine.apply(&web(), vm()).await?;

        assert_eq!(corrected.action, ReconcileAction::Update);
        assert_eq!(observed_at(&engine, &web(), "/cpus").await?, "2");
        Ok(())
    }

    #[tokio::test]
    async fn undrifted_vm_is_only_refreshed() -> TestResult {
        let service = service();
        let engine = engine(&service);
        lab_with_vm(&engine).await?;
        let updates_before = service.call_count("update_vm").await;

        let again = engine.apply(&web(), vm()).await?;

        assert_eq!(again.action, ReconcileAction::Refresh);
        assert_eq!(service.call_count("update_vm").await, updates_before);
        assert_eq!(service.call_count("add_disk").await, 1);
        Ok(())
    }
}

mod reference_tests {
    use super::*;

    fn network() -> Value {
        json!({
            "environment_id": "ref:environment.lab",
            "name": "lan",
            "domain": "lab.test",
            "subnet": "10.0.0.0/24",
        })
    }

    #[tokio::test]
    async fn references_resolve_to_recorded_ids() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let env = engine.apply(&lab(), environment("tpl-1", &[])).await?;
        let env_id = env.id.unwrap_or_default();

        let lan = ResourceAddress::new(ResourceKind::Network, "lan");
        let net = engine.apply(&lan, network()).await?;
        let vm = engine
            .apply(
                &ResourceAddress::new(ResourceKind::Vm, "web"),
                json!({
                    "environment_id": "ref:environment.lab",
                    "template_id": "tpl-1",
                    "vm_id": "t-1",
                    "disk": [{ "name": "data", "size": 10_240 }],
                    "network_interface": [{
                        "interface_type": "vmxnet3",
                        "network_id": "ref:network.lan",
                        "ip": "10.0.0.5",
                        "published_service": [{ "name": "ssh", "internal_port": 22 }],
                    }],
                }),
            )
            .await?;

        assert_eq!(net.action, ReconcileAction::Create);
        assert_eq!(vm.action, ReconcileAction::Create);
        let records = engine.records().await?;
        let stored_network = records
            .iter()
            .find(|(address, _)| *address == lan)
            .and_then(|(_, record)| record.desired.clone());
        assert_eq!(
            stored_network.and_then(|d| d.get("environment_id").cloned()),
            Some(Value::String(env_id))
        );
        Ok(())
    }

    #[tokio::test]
    async fn reference_to_unapplied_resource_is_invalid() -> TestResult {
        let service = service();
        let engine = engine(&service);

        let result = engine
            .apply(&ResourceAddress::new(ResourceKind::Network, "lan"), network())
            .await;

        assert!(matches!(result, Err(Error::InvalidDesiredState { .. })));
        assert_eq!(service.call_count("create_network").await, 0);
        Ok(())
    }
}

mod refresh_and_destroy_tests {
    use super::*;

    #[tokio::test]
    async fn refresh_clears_the_id_of_a_missing_resource() -> TestResult {
        let service = service();
        let engine = engine(&service);
        let created = engine.apply(&lab(), environment("tpl-1", &[])).await?;
        service.drop_environment(&created.id.unwrap_or_default()).await;

        let refreshed = engine.refresh(&lab()).await?;

        assert_eq!(refreshed.id, None);
        let records = engine.records().await?;
        assert!(records.first().is_some_and(|(_, r)| r.id.is_none() && r.desired.is_some()));

        let recreated = engine.apply(&lab(), environment("tpl-1", &[])).await?;
        assert_eq!(recreated.action, ReconcileAction::Create);
        Ok(())
    }

    #[tokio::test]
    async fn destroy_deletes_remotely_and_forgets_the_address() -> TestResult {
        let service = service();
        let engine = engine(&service);
        engine.apply(&lab(), environment("tpl-1", &[])).await?;

        let destroyed = engine.destroy(&lab()).await?;

        assert_eq!(destroyed.action, ReconcileAction::Delete);
        assert!(engine.records().await?.is_empty());
        assert_eq!(service.call_count("delete_environment").await, 1);

        // Destroying again is a no-op
        engine.destroy(&lab()).await?;
        assert_eq!(service.call_count("delete_environment").await, 1);
        Ok(())
    }
}

mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn records_survive_a_restart() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("labsync.state.json");
        let service = service();
        let project = ResourceAddress::new(ResourceKind::Project, "course");
        let desired = json!({ "name": "course", "summary": "intro" });

        let first = engine_with(&service, Arc::new(FileStateStore::new(&path)));
        first.apply(&project, desired.clone()).await?;

        let second = engine_with(&service, Arc::new(FileStateStore::new(&path)));
        let result = second.apply(&project, desired).await?;

        assert_eq!(result.action, ReconcileAction::Refresh);
        assert_eq!(service.call_count("create_project").await, 1);
        Ok(())
    }
}
