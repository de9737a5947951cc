//! Set difference for nested collections.
//!
//! The remote API has no batch update for tags, labels, disks or published
//! services, so a [`DiffResult`] is applied one item at a time: removals
//! first (by the observed item's remote id), then additions.

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;

use itertools::Itertools;
use labsync_remote::types::{Label, LabelRequest, Tag};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Equality key used to compare desired and observed items.
pub trait DiffKey {
    type Key: Eq + Hash + Clone;

    fn diff_key(&self) -> Self::Key;
}

/// Tag identity: case-insensitive, surrounding whitespace ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagKey(String);

impl TagKey {
    pub fn new(value: &str) -> Self {
        Self(value.trim().to_lowercase())
    }
}

/// Label identity: category and value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelKey {
    pub category: String,
    pub value: String,
}

impl DiffKey for String {
    type Key = TagKey;

    fn diff_key(&self) -> TagKey {
        TagKey::new(self)
    }
}

impl DiffKey for Tag {
    type Key = TagKey;

    fn diff_key(&self) -> TagKey {
        TagKey::new(&self.value)
    }
}

impl DiffKey for LabelRequest {
    type Key = LabelKey;

    fn diff_key(&self) -> LabelKey {
        LabelKey {
            category: self.category.clone(),
            value: self.value.clone(),
        }
    }
}

impl DiffKey for Label {
    type Key = LabelKey;

    fn diff_key(&self) -> LabelKey {
        LabelKey {
            category: self.category.clone(),
            value: self.value.clone(),
        }
    }
}

/// What to add, what to remove, and what already matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffResult<D, O> {
    /// Desired items with no observed counterpart, in declaration order.
    pub to_add: Vec<D>,
    /// Observed items with no desired counterpart, in observed order.
    pub to_remove: Vec<O>,
    /// Observed items that match a desired item.
    pub unchanged: Vec<O>,
}

impl<D, O> DiffResult<D, O> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Compare desired against observed on their shared key.
///
/// Desired duplicates collapse to one addition.
pub fn diff<D, O, K>(desired: &[D], observed: &[O]) -> DiffResult<D, O>
where
    D: DiffKey<Key = K> + Clone,
    O: DiffKey<Key = K> + Clone,
    K: Eq + Hash + Clone,
{
    let desired_keys: HashSet<K> = desired.iter().map(DiffKey::diff_key).collect();
    let observed_keys: HashSet<K> = observed.iter().map(DiffKey::diff_key).collect();

    let to_add = desired
        .iter()
        .unique_by(|item| item.diff_key())
        .filter(|item| !observed_keys.contains(&item.diff_key()))
        .cloned()
        .collect();

    let (unchanged, to_remove): (Vec<O>, Vec<O>) = observed
        .iter()
        .cloned()
        .partition(|item| desired_keys.contains(&item.diff_key()));

    DiffResult {
        to_add,
        to_remove,
        unchanged,
    }
}

/// Mutations that completed while applying a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionChanges {
    pub removed: usize,
    pub added: usize,
}

impl CollectionChanges {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.removed == 0 && self.added == 0
    }
}

/// Outcome of [`apply_removals_then_additions`]: what succeeded, and the
/// failure that stopped it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOutcome<T = ()> {
    pub changes: CollectionChanges,
    /// Values returned by the successful additions, in order.
    pub added: Vec<T>,
    pub failure: Option<Error>,
}

impl<T> CollectionOutcome<T> {
    /// Surface the failure, logging whatever had already been applied.
    pub fn into_result(self, collection: &str) -> Result<CollectionChanges> {
        match self.failure {
            None => Ok(self.changes),
            Some(err) => {
                if !self.changes.is_empty() {
                    warn!(
                        collection,
                        removed = self.changes.removed,
                        added = self.changes.added,
                        error = %err,
                        "Collection partially applied"
                    );
                }
                Err(err)
            }
        }
    }
}

/// Issue one call per removed item, then one per added item.
///
/// Stops at the first failure. Earlier mutations are kept, along with what
/// the completed additions returned; the next reconciliation pass converges
/// the rest.
pub async fn apply_removals_then_additions<D, O, T, R, RFut, A, AFut>(
    diff: &DiffResult<D, O>,
    mut remove: R,
    mut add: A,
) -> CollectionOutcome<T>
where
    R: FnMut(&O) -> RFut,
    RFut: Future<Output = Result<()>>,
    A: FnMut(&D) -> AFut,
    AFut: Future<Output = Result<T>>,
{
    let mut outcome = CollectionOutcome {
        changes: CollectionChanges::default(),
        added: Vec::with_capacity(diff.to_add.len()),
        failure: None,
    };

    for item in &diff.to_remove {
        if let Err(err) = remove(item).await {
            outcome.failure = Some(err);
            return outcome;
        }
        outcome.changes.removed = outcome.changes.removed.saturating_add(1);
    }

    for item in &diff.to_add {
        match add(item).await {
            Ok(value) => {
                outcome.added.push(value);
                outcome.changes.added = outcome.changes.added.saturating_add(1);
            }
            Err(err) => {
                outcome.failure = Some(err);
                return outcome;
            }
        }
    }

    outcome
}
