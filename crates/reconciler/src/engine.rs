//! Apply, refresh and destroy for addressed resources.
//!
//! The engine decides which reconciler operation to run from the stored
//! record, runs it, and persists the outcome. A create is recorded as soon as
//! the remote id exists and stays tainted until it has settled, so an
//! interrupted create is replaced rather than leaked.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use labsync_core::ResultExt;
use labsync_remote::types::Project;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::ProviderContext;
use crate::error::{Error, Result};
use crate::lookup;
use crate::reconciler::DynReconciler;
use crate::registry::Registry;
use crate::state::{ResourceRecord, StateStore};
use crate::types::{ChangeReport, ReconcileAction, ReconcileResult, ResourceAddress};

/// Prefix of a string that stands for another resource's id.
pub const REF_PREFIX: &str = "ref:";

fn collect_refs(value: &Value, refs: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if let Some(target) = s.strip_prefix(REF_PREFIX) {
                refs.insert(target.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_refs(item, refs)),
        Value::Object(map) => map.values().for_each(|item| collect_refs(item, refs)),
        _ => {}
    }
}

fn substitute_refs(value: &mut Value, ids: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            if let Some(id) = s.strip_prefix(REF_PREFIX).and_then(|target| ids.get(target)) {
                *s = id.clone();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| substitute_refs(item, ids)),
        Value::Object(map) => map.values_mut().for_each(|item| substitute_refs(item, ids)),
        _ => {}
    }
}

fn absent_record(desired: Option<Value>) -> ResourceRecord {
    ResourceRecord {
        id: None,
        desired,
        observed: None,
        tainted: false,
        updated_at: Utc::now(),
    }
}

pub struct Engine {
    registry: Registry,
    store: Arc<dyn StateStore>,
    ctx: ProviderContext,
}

impl Engine {
    #[must_use]
    pub fn new(registry: Registry, store: Arc<dyn StateStore>, ctx: ProviderContext) -> Self {
        Self {
            registry,
            store,
            ctx,
        }
    }

    #[must_use]
    pub const fn context(&self) -> &ProviderContext {
        &self.ctx
    }

    /// The single existing project called `name`; nothing is recorded.
    pub async fn find_project(&self, name: &str) -> Result<Project> {
        lookup::find_project(&self.ctx, name).await
    }

    /// Every stored record.
    pub async fn records(&self) -> Result<Vec<(ResourceAddress, ResourceRecord)>> {
        self.store.list().await
    }

    /// Replace `"ref:<kind>.<name>"` strings with recorded ids.
    pub async fn resolve_refs(&self, mut desired: Value) -> Result<Value> {
        let mut refs = BTreeSet::new();
        collect_refs(&desired, &mut refs);
        if refs.is_empty() {
            return Ok(desired);
        }

        let mut ids = HashMap::with_capacity(refs.len());
        for target in refs {
            let address: ResourceAddress = target.parse()?;
            let id = self
                .store
                .load(&address)
                .await?
                .filter(|record| !record.tainted)
                .and_then(|record| record.id)
                .ok_or_else(|| {
                    Error::invalid_desired(
                        address.kind.as_str(),
                        format!("referenced resource {address} has no id; apply it first"),
                    )
                })?;
            ids.insert(target, id);
        }
        substitute_refs(&mut desired, &ids);
        Ok(desired)
    }

    /// Bring one resource in line with `desired` and persist the outcome.
    ///
    /// # Errors
    ///
    /// Any reconciler error. When an update fails part way, the record keeps
    /// the previous desired state and the freshly read observed state, so the
    /// next apply retries the update.
    pub async fn apply(&self, address: &ResourceAddress, desired: Value) -> Result<ReconcileResult> {
        let reconciler = self.registry.get(address.kind)?;
        let reconciler = reconciler.as_ref();
        let desired = self.resolve_refs(desired).await?;
        reconciler.validate(&desired)?;

        let record = self.store.load(address).await?;
        let Some((id, record)) = record.and_then(|r| r.id.clone().map(|id| (id, r))) else {
            return self
                .create(address, reconciler, &desired, ReconcileAction::Create)
                .await;
        };
        let recorded = record.desired.as_ref().unwrap_or(&desired);

        if record.tainted {
            warn!(%address, id = %id, "Replacing resource whose create did not finish");
            reconciler.delete(&self.ctx, &id, recorded).await?;
            self.store.save(address, absent_record(None)).await?;
            let action = ReconcileAction::Replace {
                reason: "previous create did not finish".to_string(),
            };
            return self.create(address, reconciler, &desired, action).await;
        }

        let Some(observed) = reconciler
            .read(&self.ctx, &id, recorded, record.observed.as_ref())
            .await?
        else {
            info!(%address, id = %id, "Resource missing remotely, re-creating");
            self.store.save(address, absent_record(None)).await?;
            return self
                .create(address, reconciler, &desired, ReconcileAction::Recreate)
                .await;
        };

        if let Some(field) = reconciler.requires_replacement(recorded, &desired)? {
            info!(%address, id = %id, field, "Immutable field changed, replacing");
            reconciler.delete(&self.ctx, &id, recorded).await?;
            self.store.save(address, absent_record(None)).await?;
            let action = ReconcileAction::Replace {
                reason: format!("{field} changed"),
            };
            return self.create(address, reconciler, &desired, action).await;
        }

        if record.desired.as_ref() == Some(&desired) && !reconciler.drifted(&desired, &observed)? {
            debug!(%address, id = %id, "Desired state unchanged");
            self.store
                .save(address, ResourceRecord::settled(&id, desired, observed))
                .await?;
            return Ok(ReconcileResult {
                address: address.clone(),
                action: ReconcileAction::Refresh,
                id: Some(id),
                report: ChangeReport::new(),
            });
        }

        if record.desired.as_ref() == Some(&desired) {
            info!(%address, id = %id, "Remote state drifted, correcting");
        }
        match reconciler
            .update(&self.ctx, &id, &desired, Some(&observed))
            .await
        {
            Ok(applied) => {
                info!(%address, id = %id, changes = applied.report.total(), "Updated");
                self.store
                    .save(
                        address,
                        ResourceRecord::settled(&applied.id, desired, applied.observed),
                    )
                    .await?;
                Ok(ReconcileResult {
                    address: address.clone(),
                    action: ReconcileAction::Update,
                    id: Some(applied.id),
                    report: applied.report,
                })
            }
            Err(err) => {
                warn!(%address, id = %id, error = %err, "Update failed, recording partial state");
                let current = reconciler
                    .read(&self.ctx, &id, &desired, Some(&observed))
                    .await
                    .into_option_logged()
                    .flatten()
                    .unwrap_or(observed);
                let partial = ResourceRecord {
                    id: Some(id),
                    desired: record.desired,
                    observed: Some(current),
                    tainted: false,
                    updated_at: Utc::now(),
                };
                self.store.save(address, partial).await?;
                Err(err)
            }
        }
    }

    async fn create(
        &self,
        address: &ResourceAddress,
        reconciler: &dyn DynReconciler,
        desired: &Value,
        action: ReconcileAction,
    ) -> Result<ReconcileResult> {
        let id = reconciler.create(&self.ctx, desired).await?;
        let mut pending = ResourceRecord::pending(&id);
        pending.desired = Some(desired.clone());
        self.store.save(address, pending).await?;
        debug!(%address, id = %id, "Recorded id before settling");

        let applied = reconciler.finish_create(&self.ctx, &id, desired).await?;
        self.store
            .save(
                address,
                ResourceRecord::settled(&applied.id, desired.clone(), applied.observed),
            )
            .await?;
        info!(%address, id = %applied.id, action = %action.description(), "Created");
        Ok(ReconcileResult {
            address: address.clone(),
            action,
            id: Some(applied.id),
            report: applied.report,
        })
    }

    /// Re-read one resource without changing it.
    ///
    /// A resource that is gone keeps its record with the id cleared.
    pub async fn refresh(&self, address: &ResourceAddress) -> Result<ReconcileResult> {
        let reconciler = self.registry.get(address.kind)?;
        let record = self.store.load(address).await?;
        let absent = ReconcileResult {
            address: address.clone(),
            action: ReconcileAction::Refresh,
            id: None,
            report: ChangeReport::new(),
        };
        let Some(mut record) = record else {
            return Ok(absent);
        };
        let (Some(id), Some(desired)) = (record.id.clone(), record.desired.clone()) else {
            return Ok(absent);
        };

        match reconciler
            .read(&self.ctx, &id, &desired, record.observed.as_ref())
            .await?
        {
            Some(observed) => {
                record.observed = Some(observed);
                record.updated_at = Utc::now();
                self.store.save(address, record).await?;
                Ok(ReconcileResult {
                    id: Some(id),
                    ..absent
                })
            }
            None => {
                info!(%address, id = %id, "Resource missing remotely");
                self.store.save(address, absent_record(Some(desired))).await?;
                Ok(absent)
            }
        }
    }

    /// Delete one resource and forget it.
    pub async fn destroy(&self, address: &ResourceAddress) -> Result<ReconcileResult> {
        let reconciler = self.registry.get(address.kind)?;
        if let Some(record) = self.store.load(address).await? {
            match (&record.id, &record.desired) {
                (Some(id), Some(desired)) => {
                    reconciler.delete(&self.ctx, id, desired).await?;
                    info!(%address, id = %id, "Deleted");
                }
                (Some(id), None) => {
                    warn!(%address, id = %id, "No desired state recorded, cannot delete remotely");
                }
                (None, _) => debug!(%address, "Nothing to delete"),
            }
            self.store.clear(address).await?;
        }
        Ok(ReconcileResult {
            address: address.clone(),
            action: ReconcileAction::Delete,
            id: None,
            report: ChangeReport::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_refs_are_found_at_any_depth() {
        let desired = json!({
            "environment_id": "ref:environment.lab",
            "network_interface": [{ "network_id": "ref:network.lan" }],
            "name": "plain",
        });
        let mut refs = BTreeSet::new();
        collect_refs(&desired, &mut refs);
        assert_eq!(
            refs.into_iter().collect::<Vec<_>>(),
            vec!["environment.lab".to_string(), "network.lan".to_string()]
        );
    }

    #[test]
    fn test_substitution_leaves_other_strings_alone() {
        let mut desired = json!({
            "environment_id": "ref:environment.lab",
            "description": "see ref:nothing",
        });
        let ids = HashMap::from([("environment.lab".to_string(), "42".to_string())]);
        substitute_refs(&mut desired, &ids);
        assert_eq!(
            desired,
            json!({ "environment_id": "42", "description": "see ref:nothing" })
        );
    }
}
