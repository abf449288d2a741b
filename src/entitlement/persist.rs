//! Persisted key-value storage for the policy cache.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

use crate::error::{GatekeeperError, Result};

/// A string key-value store that outlives the process.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Read a value.
    async fn load(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn save(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store, mainly for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FilePolicyStore {
    dir: PathBuf,
}

impl FilePolicyStore {
    /// Store files under `dir`, creating it on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The file backing `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    fn persist_error(path: &Path, e: std::io::Error) -> GatekeeperError {
        GatekeeperError::Persist(format!("{}: {}", path.display(), e))
    }
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::persist_error(&path, e)),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::persist_error(&self.dir, e))?;
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| Self::persist_error(&tmp, e))?;
        // Rename so readers never see a half-written file
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::persist_error(&path, e))?;

        trace!(path = %path.display(), "Persisted policy cache entry");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::persist_error(&path, e)),
        }
    }
}

/// Persistence implementations selectable from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PersistenceBackend {
    /// Nothing survives a restart
    #[default]
    Memory,
    /// JSON files under `dir`
    File { dir: PathBuf },
}

impl PersistenceBackend {
    /// Build the configured store.
    pub fn build(&self) -> Arc<dyn PolicyStore> {
        match self {
            PersistenceBackend::Memory => Arc::new(MemoryPolicyStore::new()),
            PersistenceBackend::File { dir } => Arc::new(FilePolicyStore::new(dir.clone())),
        }
    }
}
