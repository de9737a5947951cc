//! Binding observed nested items to the declarations that produced them.
//!
//! Some items (disks, published services) are declared without an id; the
//! remote assigns one at creation. An observed item is named by its first-seen
//! binding if one was recorded, otherwise by the first still-unclaimed
//! declaration with the same discriminating key, in declaration order.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::net::IpAddr;

use labsync_remote::types::Disk;
use tracing::warn;

/// LUN of the base OS disk, which is never user-managed.
pub const BASE_DISK_LUN: &str = "0";

/// A declared item as seen by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredItem<K> {
    pub name: String,
    pub key: K,
    /// Remote id bound on an earlier pass, if any.
    pub bound_id: Option<String>,
}

impl<K> DeclaredItem<K> {
    pub fn new(name: impl Into<String>, key: K, bound_id: Option<String>) -> Self {
        Self {
            name: name.into(),
            key,
            bound_id,
        }
    }
}

/// Id bindings plus FIFO queues of unbound names per key.
///
/// Scoped to one reconciliation call; never shared across resources.
#[derive(Debug, Clone)]
pub struct CorrelationIndex<K> {
    by_id: HashMap<String, String>,
    fifo: HashMap<K, VecDeque<String>>,
}

impl<K: Eq + Hash> CorrelationIndex<K> {
    pub fn new(declared: impl IntoIterator<Item = DeclaredItem<K>>) -> Self {
        let mut by_id = HashMap::new();
        let mut fifo: HashMap<K, VecDeque<String>> = HashMap::new();
        for item in declared {
            match item.bound_id {
                Some(id) => {
                    by_id.insert(id, item.name);
                }
                None => fifo.entry(item.key).or_default().push_back(item.name),
            }
        }
        Self { by_id, fifo }
    }

    /// Name for an observed item, consuming a queued declaration if needed.
    ///
    /// Resolving the same id twice yields the same name.
    pub fn resolve(&mut self, id: &str, key: &K) -> Option<String> {
        if let Some(name) = self.by_id.get(id) {
            return Some(name.clone());
        }
        let name = self.fifo.get_mut(key).and_then(VecDeque::pop_front)?;
        self.by_id.insert(id.to_string(), name.clone());
        Some(name)
    }

    /// Like [`Self::resolve`], trying each key in turn.
    pub fn resolve_any(&mut self, id: &str, keys: &[K]) -> Option<String> {
        if let Some(name) = self.by_id.get(id) {
            return Some(name.clone());
        }
        keys.iter().find_map(|key| {
            let name = self.fifo.get_mut(key).and_then(VecDeque::pop_front)?;
            self.by_id.insert(id.to_string(), name.clone());
            Some(name)
        })
    }

    /// Whether a declaration still waits for an observed item.
    #[must_use]
    pub fn has_unclaimed(&self) -> bool {
        self.fifo.values().any(|queue| !queue.is_empty())
    }
}

/// Canonical form of an IP address for comparison.
pub fn normalize_ip(ip: &str) -> String {
    let trimmed = ip.trim();
    trimmed
        .parse::<IpAddr>()
        .map_or_else(|_| trimmed.to_lowercase(), |addr| addr.to_string())
}

/// Key for published-service correlation.
pub type ServiceKey = (String, u16);

/// Name each user-managed observed disk, in observed order.
///
/// The base disk is dropped before correlation. Disks with no matching
/// declaration keep `None`.
pub fn correlate_disks(
    declared: impl IntoIterator<Item = DeclaredItem<u32>>,
    observed: &[Disk],
) -> Vec<(Option<String>, Disk)> {
    let mut index = CorrelationIndex::new(declared);
    observed
        .iter()
        .filter(|disk| disk.lun != BASE_DISK_LUN)
        .map(|disk| {
            let name = index.resolve(&disk.id, &disk.size);
            if name.is_none() {
                warn!(disk_id = %disk.id, size = disk.size, "Observed disk matches no declaration");
            }
            (name, disk.clone())
        })
        .collect()
}
