//! Lookup from resource kind to its reconciler.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::reconciler::DynReconciler;
use crate::resources::{
    EnvironmentReconciler, LabelCategoryReconciler, NetworkReconciler, ProjectReconciler,
    TunnelReconciler, VmReconciler,
};
use crate::types::ResourceKind;

#[derive(Clone, Default)]
pub struct Registry {
    reconcilers: HashMap<ResourceKind, Arc<dyn DynReconciler>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a reconciler for every kind.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(ProjectReconciler))
            .with(Arc::new(EnvironmentReconciler))
            .with(Arc::new(NetworkReconciler))
            .with(Arc::new(VmReconciler))
            .with(Arc::new(LabelCategoryReconciler))
            .with(Arc::new(TunnelReconciler))
    }

    #[must_use]
    pub fn with(mut self, reconciler: Arc<dyn DynReconciler>) -> Self {
        self.register(reconciler);
        self
    }

    /// Register a reconciler, replacing any earlier one for the same kind.
    pub fn register(&mut self, reconciler: Arc<dyn DynReconciler>) {
        self.reconcilers.insert(reconciler.kind(), reconciler);
    }

    pub fn get(&self, kind: ResourceKind) -> Result<Arc<dyn DynReconciler>> {
        self.reconcilers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::unknown_kind(kind.as_str()))
    }

    /// Registered kinds, in a stable order.
    #[must_use]
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self.reconcilers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_every_kind() {
        let registry = Registry::standard();
        assert_eq!(registry.kinds(), ResourceKind::ALL.to_vec());
        for kind in ResourceKind::ALL {
            assert!(registry.get(kind).is_ok_and(|r| r.kind() == kind));
        }
    }

    #[test]
    fn test_missing_kind_is_unknown() {
        let registry = Registry::new().with(Arc::new(ProjectReconciler));
        assert!(matches!(
            registry.get(ResourceKind::Tunnel),
            Err(Error::UnknownKind { .. })
        ));
    }
}
