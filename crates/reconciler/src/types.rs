//! Core types for the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::diff::CollectionChanges;
use crate::error::Error;

/// Resource kinds with a registered reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Project,
    Environment,
    Network,
    Vm,
    LabelCategory,
    Tunnel,
}

impl ResourceKind {
    pub const ALL: [Self; 6] = [
        Self::Project,
        Self::Environment,
        Self::Network,
        Self::Vm,
        Self::LabelCategory,
        Self::Tunnel,
    ];

    /// Name used in manifests, references and timeout overrides.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Environment => "environment",
            Self::Network => "network",
            Self::Vm => "vm",
            Self::LabelCategory => "label_category",
            Self::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::unknown_kind(s))
    }
}

/// Where a resource's record lives: its kind plus the manifest name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceAddress {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceAddress {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for ResourceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('.')
            .ok_or_else(|| Error::unknown_kind(s))?;
        Ok(Self::new(kind.parse()?, name))
    }
}

/// Nested-collection mutations made by one reconciler call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub collections: BTreeMap<String, CollectionChanges>,
}

impl ChangeReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a collection's changes; empty ones are not kept.
    pub fn record(&mut self, collection: &str, changes: CollectionChanges) {
        if !changes.is_empty() {
            let entry = self.collections.entry(collection.to_string()).or_default();
            entry.added = entry.added.saturating_add(changes.added);
            entry.removed = entry.removed.saturating_add(changes.removed);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.values().all(CollectionChanges::is_empty)
    }

    /// Total individual add/remove calls made.
    #[must_use]
    pub fn total(&self) -> usize {
        self.collections
            .values()
            .fold(0_usize, |total, c| {
                total.saturating_add(c.added).saturating_add(c.removed)
            })
    }
}

/// What the engine decided to do for one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileAction {
    /// No record or no id: create from scratch.
    Create,
    /// The recorded id no longer exists remotely: create again.
    Recreate,
    /// An immutable field changed, or an earlier create did not finish.
    Replace { reason: String },
    /// Desired state changed: update in place.
    Update,
    /// Nothing changed: read only.
    Refresh,
    /// Remove the resource.
    Delete,
}

impl ReconcileAction {
    /// Human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Create => "create".to_string(),
            Self::Recreate => "re-create (missing remotely)".to_string(),
            Self::Replace { reason } => format!("replace ({reason})"),
            Self::Update => "update in place".to_string(),
            Self::Refresh => "refresh".to_string(),
            Self::Delete => "delete".to_string(),
        }
    }
}

/// Result of reconciling one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    pub address: ResourceAddress,
    pub action: ReconcileAction,
    /// Remote id after the action; `None` once deleted or found absent.
    pub id: Option<String>,
    pub report: ChangeReport,
}
