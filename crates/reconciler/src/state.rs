//! Persistence of ids, desired and observed state between runs.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::ResourceAddress;

const STATE_VERSION: u32 = 1;

/// What is known about one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Remote id; `None` once the resource is known to be absent.
    pub id: Option<String>,
    /// Desired state the observed state was last reconciled against.
    pub desired: Option<Value>,
    /// Normalized observed state, including correlation bindings.
    pub observed: Option<Value>,
    /// Set while a create has not finished settling; the next apply replaces it.
    #[serde(default)]
    pub tainted: bool,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Record for a resource that exists but has not settled yet.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            desired: None,
            observed: None,
            tainted: true,
            updated_at: Utc::now(),
        }
    }

    /// Record for a settled resource.
    pub fn settled(id: impl Into<String>, desired: Value, observed: Value) -> Self {
        Self {
            id: Some(id.into()),
            desired: Some(desired),
            observed: Some(observed),
            tainted: false,
            updated_at: Utc::now(),
        }
    }
}

/// Storage for resource records.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, address: &ResourceAddress) -> Result<Option<ResourceRecord>>;

    async fn save(&self, address: &ResourceAddress, record: ResourceRecord) -> Result<()>;

    /// Forget an address entirely.
    async fn clear(&self, address: &ResourceAddress) -> Result<()>;

    async fn list(&self) -> Result<Vec<(ResourceAddress, ResourceRecord)>>;
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<ResourceAddress, ResourceRecord>>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, address: &ResourceAddress) -> Result<Option<ResourceRecord>> {
        Ok(self.records.read().await.get(address).cloned())
    }

    async fn save(&self, address: &ResourceAddress, record: ResourceRecord) -> Result<()> {
        self.records.write().await.insert(address.clone(), record);
        Ok(())
    }

    async fn clear(&self, address: &ResourceAddress) -> Result<()> {
        self.records.write().await.remove(address);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(ResourceAddress, ResourceRecord)>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .map(|(address, record)| (address.clone(), record.clone()))
            .collect())
    }
}

/// On-disk layout: records keyed by `kind.name`.
#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    resources: BTreeMap<String, ResourceRecord>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            resources: BTreeMap::new(),
        }
    }
}

/// Write to a sibling temp file, then rename over the target.
async fn save_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err);
    }
    Ok(())
}

/// JSON state file. Each mutation rewrites the whole document atomically.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<StateDocument> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StateDocument::default());
            }
            Err(err) => {
                return Err(Error::state_store(format!(
                    "failed to read {}: {err}",
                    self.path.display()
                )));
            }
        };
        let document: StateDocument = serde_json::from_slice(&bytes).map_err(|e| {
            Error::state_store(format!("corrupt state file {}: {e}", self.path.display()))
        })?;
        if document.version > STATE_VERSION {
            return Err(Error::state_store(format!(
                "state file version {} is newer than supported version {STATE_VERSION}",
                document.version
            )));
        }
        Ok(document)
    }

    async fn write_document(&self, document: &StateDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        save_bytes_atomic(&self.path, &bytes).await.map_err(|e| {
            Error::state_store(format!("failed to write {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), resources = document.resources.len(), "Saved state");
        Ok(())
    }

    async fn modify(&self, change: impl FnOnce(&mut StateDocument) + Send) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        change(&mut document);
        document.version = STATE_VERSION;
        self.write_document(&document).await
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, address: &ResourceAddress) -> Result<Option<ResourceRecord>> {
        let mut document = self.read_document().await?;
        Ok(document.resources.remove(&address.to_string()))
    }

    async fn save(&self, address: &ResourceAddress, record: ResourceRecord) -> Result<()> {
        let key = address.to_string();
        self.modify(move |document| {
            document.resources.insert(key, record);
        })
        .await
    }

    async fn clear(&self, address: &ResourceAddress) -> Result<()> {
        let key = address.to_string();
        self.modify(move |document| {
            document.resources.remove(&key);
        })
        .await
    }

    async fn list(&self) -> Result<Vec<(ResourceAddress, ResourceRecord)>> {
        self.read_document()
            .await?
            .resources
            .into_iter()
            .map(|(key, record)| Ok((key.parse()?, record)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKind;
    use serde_json::json;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn address() -> ResourceAddress {
        ResourceAddress::new(ResourceKind::Environment, "lab")
    }

    #[tokio::test]
    async fn test_file_store_round_trips_records() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("state.json");
        let store = FileStateStore::new(&path);

        assert_eq!(store.load(&address()).await?, None);

        let record = ResourceRecord::settled("42", json!({"name": "lab"}), json!({"id": "42"}));
        store.save(&address(), record.clone()).await?;

        let reopened = FileStateStore::new(&path);
        assert_eq!(reopened.load(&address()).await?, Some(record.clone()));
        assert_eq!(reopened.list().await?, vec![(address(), record)]);
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_removes_only_that_address() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = FileStateStore::new(dir.path().join("state.json"));
        let other = ResourceAddress::new(ResourceKind::Network, "lan");

        store.save(&address(), ResourceRecord::pending("1")).await?;
        store.save(&other, ResourceRecord::pending("2")).await?;
        store.clear(&address()).await?;

        let listed: Vec<ResourceAddress> = store.list().await?.into_iter().map(|(a, _)| a).collect();
        assert_eq!(listed, vec![other]);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_state_store_error() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json")?;

        let result = FileStateStore::new(&path).load(&address()).await;
        assert!(matches!(result, Err(Error::StateStore { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_in_memory_store() -> TestResult {
        let store = InMemoryStateStore::new();
        store.save(&address(), ResourceRecord::pending("7")).await?;
        let loaded = store.load(&address()).await?;
        assert!(loaded.is_some_and(|r| r.tainted && r.id.as_deref() == Some("7")));
        store.clear(&address()).await?;
        assert!(store.list().await?.is_empty());
        Ok(())
    }
}
