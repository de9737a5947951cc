//! The per-kind reconciler contract and its type-erased adapter.
//!
//! Each kind implements [`ResourceReconciler`] against strongly-typed desired
//! and observed structs. The engine works with [`DynReconciler`], which
//! converts the opaque desired map at the boundary and nowhere else.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::ProviderContext;
use crate::error::{Error, Result};
use crate::types::{ChangeReport, ResourceKind};

/// Observed state after a create or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied<O> {
    pub id: String,
    pub observed: O,
    pub report: ChangeReport,
}

impl<O> Applied<O> {
    pub fn new(id: impl Into<String>, observed: O) -> Self {
        Self {
            id: id.into(),
            observed,
            report: ChangeReport::new(),
        }
    }

    #[must_use]
    pub fn with_report(mut self, report: ChangeReport) -> Self {
        self.report = report;
        self
    }
}

/// Create, read, update and delete for one resource kind.
///
/// Create is split in two so the engine can record the remote id as soon as
/// it exists, before any settle wait.
#[async_trait]
pub trait ResourceReconciler: Send + Sync {
    type Desired: DeserializeOwned + Serialize + Clone + Send + Sync;
    type Observed: DeserializeOwned + Serialize + Clone + Send + Sync;

    fn kind(&self) -> ResourceKind;

    /// Reject desired states the remote would refuse.
    fn validate(&self, _desired: &Self::Desired) -> Result<()> {
        Ok(())
    }

    /// Whether going from `prior` to `desired` touches an immutable field.
    /// Returns the first such field.
    fn requires_replacement(
        &self,
        prior: &Self::Desired,
        desired: &Self::Desired,
    ) -> Option<&'static str>;

    /// Whether the remote resource has moved away from `desired` since it
    /// was last reconciled. Only fields an update can restore count.
    fn drifted(&self, desired: &Self::Desired, observed: &Self::Observed) -> bool;

    /// Issue the create call and return the assigned id.
    async fn create(&self, ctx: &ProviderContext, desired: &Self::Desired) -> Result<String>;

    /// Settle a freshly created resource and read it back.
    async fn finish_create(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &Self::Desired,
    ) -> Result<Applied<Self::Observed>>;

    /// Current observed state, or `None` if the resource is gone.
    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &Self::Desired,
        prior: Option<&Self::Observed>,
    ) -> Result<Option<Self::Observed>>;

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &Self::Desired,
        prior: Option<&Self::Observed>,
    ) -> Result<Applied<Self::Observed>>;

    /// Delete; a resource that is already gone counts as deleted.
    async fn delete(&self, ctx: &ProviderContext, id: &str, desired: &Self::Desired) -> Result<()>;
}

/// [`ResourceReconciler`] over opaque JSON values.
#[async_trait]
pub trait DynReconciler: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn validate(&self, desired: &Value) -> Result<()>;

    fn requires_replacement(&self, prior: &Value, desired: &Value) -> Result<Option<&'static str>>;

    fn drifted(&self, desired: &Value, observed: &Value) -> Result<bool>;

    async fn create(&self, ctx: &ProviderContext, desired: &Value) -> Result<String>;

    async fn finish_create(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &Value,
    ) -> Result<Applied<Value>>;

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &Value,
        prior: Option<&Value>,
    ) -> Result<Option<Value>>;

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &Value,
        prior: Option<&Value>,
    ) -> Result<Applied<Value>>;

    async fn delete(&self, ctx: &ProviderContext, id: &str, desired: &Value) -> Result<()>;
}

fn desired_of<R: ResourceReconciler + ?Sized>(reconciler: &R, value: &Value) -> Result<R::Desired> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::invalid_desired(ResourceReconciler::kind(reconciler).as_str(), e.to_string()))
}

/// A stored observation that no longer parses is treated as missing.
fn prior_of<R: ResourceReconciler + ?Sized>(value: Option<&Value>) -> Option<R::Observed> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn erase<O: Serialize>(applied: Applied<O>) -> Result<Applied<Value>> {
    Ok(Applied {
        id: applied.id,
        observed: serde_json::to_value(applied.observed)?,
        report: applied.report,
    })
}

#[async_trait]
impl<R> DynReconciler for R
where
    R: ResourceReconciler,
{
    fn kind(&self) -> ResourceKind {
        ResourceReconciler::kind(self)
    }

    fn validate(&self, desired: &Value) -> Result<()> {
        let desired = desired_of(self, desired)?;
        ResourceReconciler::validate(self, &desired)
    }

    fn requires_replacement(&self, prior: &Value, desired: &Value) -> Result<Option<&'static str>> {
        let Ok(prior) = serde_json::from_value::<R::Desired>(prior.clone()) else {
            return Ok(None);
        };
        let desired = desired_of(self, desired)?;
        Ok(ResourceReconciler::requires_replacement(self, &prior, &desired))
    }

    /// An observation that does not parse is treated as drifted.
    fn drifted(&self, desired: &Value, observed: &Value) -> Result<bool> {
        let desired = desired_of(self, desired)?;
        Ok(prior_of::<R>(Some(observed))
            .is_none_or(|observed| ResourceReconciler::drifted(self, &desired, &observed)))
    }

    async fn create(&self, ctx: &ProviderContext, desired: &Value) -> Result<String> {
        let desired = desired_of(self, desired)?;
        ResourceReconciler::create(self, ctx, &desired).await
    }

    async fn finish_create(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &Value,
    ) -> Result<Applied<Value>> {
        let desired = desired_of(self, desired)?;
        erase(ResourceReconciler::finish_create(self, ctx, id, &desired).await?)
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &Value,
        prior: Option<&Value>,
    ) -> Result<Option<Value>> {
        let desired = desired_of(self, desired)?;
        let prior = prior_of::<R>(prior);
        match ResourceReconciler::read(self, ctx, id, &desired, prior.as_ref()).await? {
            Some(observed) => Ok(Some(serde_json::to_value(observed)?)),
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &Value,
        prior: Option<&Value>,
    ) -> Result<Applied<Value>> {
        let desired = desired_of(self, desired)?;
        let prior = prior_of::<R>(prior);
        erase(ResourceReconciler::update(self, ctx, id, &desired, prior.as_ref()).await?)
    }

    async fn delete(&self, ctx: &ProviderContext, id: &str, desired: &Value) -> Result<()> {
        let desired = desired_of(self, desired)?;
        ResourceReconciler::delete(self, ctx, id, &desired).await
    }
}
