// # File State Store
//
// File-based implementation of StateStore with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: write to `<path>.tmp`, then rename over the state file
// - Backup: the previous file is copied to `<path>.backup` before each replace
// - Recovery: a state file that fails to parse is replaced by the backup
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "resources": {
//     "generic_system.web": {
//       "kind": "generic_system",
//       "state": { "id": "gs-1", "links": [] },
//       "last_applied": "2025-01-09T12:00:00Z"
//     }
//   }
// }
// ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::state_store::{ResourceRecord, StateStore, StateStoreFactory};

/// State file format version
const STATE_FILE_VERSION: &str = "1.0";

/// File-based state store with crash recovery
///
/// Every mutation is written through immediately; `flush` only has work to
/// do after a failed write.
///
/// # Example
///
/// ```rust,no_run
/// use fabric_core::state::FileStateStore;
/// use fabric_core::traits::StateStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileStateStore::new("/var/lib/fabric/state.json").await?;
///     for address in store.list_resources().await? {
///         println!("tracking {address}");
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
}

#[derive(Debug)]
struct FileState {
    resources: BTreeMap<String, ResourceRecord>,
    dirty: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StateFileFormat {
    version: String,
    resources: BTreeMap<String, ResourceRecord>,
}

/// Why a state file could not be loaded
enum LoadError {
    /// File exists but is not a valid state file
    Corrupt(Error),
    /// File could not be read at all
    Io(Error),
}

impl FileStateStore {
    /// Create or load a file state store
    ///
    /// Missing parent directories are created. A corrupt state file is
    /// recovered from its backup; if that fails too the store starts empty.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let resources = Self::load_state_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(FileState {
                resources,
                dirty: false,
            })),
        })
    }

    async fn load_state_with_recovery(path: &Path) -> Result<BTreeMap<String, ResourceRecord>, Error> {
        let err = match Self::load_state(path).await {
            Ok(resources) => {
                tracing::debug!("Loaded state from file: {} resources", resources.len());
                return Ok(resources);
            }
            Err(LoadError::Io(e)) => return Err(e),
            Err(LoadError::Corrupt(e)) => e,
        };

        tracing::warn!(
            "State file appears corrupted: {}. Attempting recovery from backup.",
            err
        );

        let backup_path = Self::backup_path(path);
        if !backup_path.exists() {
            tracing::warn!("No backup file found. Starting with empty state.");
            return Ok(BTreeMap::new());
        }

        match Self::load_state(&backup_path).await {
            Ok(resources) => {
                tracing::info!("Recovered state from backup: {} resources", resources.len());
                if let Err(restore_err) = fs::copy(&backup_path, path).await {
                    tracing::error!("Failed to restore state file from backup: {}", restore_err);
                }
                Ok(resources)
            }
            Err(LoadError::Corrupt(e)) | Err(LoadError::Io(e)) => {
                tracing::error!("Backup also unusable: {}. Starting with empty state.", e);
                Ok(BTreeMap::new())
            }
        }
    }

    async fn load_state(path: &Path) -> Result<BTreeMap<String, ResourceRecord>, LoadError> {
        if !path.exists() {
            tracing::debug!("State file does not exist: {}", path.display());
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            LoadError::Io(Error::state_store(format!(
                "Failed to read state file {}: {}",
                path.display(),
                e
            )))
        })?;

        let state_file: StateFileFormat = serde_json::from_str(&content).map_err(|e| {
            LoadError::Corrupt(Error::state_store(format!(
                "Failed to parse state file {}: {}",
                path.display(),
                e
            )))
        })?;

        if state_file.version != STATE_FILE_VERSION {
            tracing::warn!(
                "State file version mismatch: expected {}, got {}. Attempting to load anyway.",
                STATE_FILE_VERSION,
                state_file.version
            );
        }

        Ok(state_file.resources)
    }

    async fn write_state(&self) -> Result<(), Error> {
        let json = {
            let guard = self.state.read().await;
            let state_file = StateFileFormat {
                version: STATE_FILE_VERSION.to_string(),
                resources: guard.resources.clone(),
            };
            serde_json::to_string_pretty(&state_file)
                .map_err(|e| Error::state_store(format!("Failed to serialize state: {}", e)))?
        };

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.flush().await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to flush temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await
        {
            tracing::warn!("Failed to create backup: {}", e);
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        self.state.write().await.dirty = false;
        tracing::trace!("State written to file: {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }

    /// Path of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get_resource(&self, address: &str) -> Result<Option<ResourceRecord>, Error> {
        Ok(self.state.read().await.resources.get(address).cloned())
    }

    async fn set_resource(&self, address: &str, record: &ResourceRecord) -> Result<(), Error> {
        {
            let mut guard = self.state.write().await;
            guard.resources.insert(address.to_string(), record.clone());
            guard.dirty = true;
        }
        self.write_state().await
    }

    async fn delete_resource(&self, address: &str) -> Result<(), Error> {
        {
            let mut guard = self.state.write().await;
            if guard.resources.remove(address).is_none() {
                return Ok(());
            }
            guard.dirty = true;
        }
        self.write_state().await
    }

    async fn list_resources(&self) -> Result<Vec<String>, Error> {
        Ok(self.state.read().await.resources.keys().cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        if self.state.read().await.dirty {
            self.write_state().await
        } else {
            Ok(())
        }
    }
}

/// Factory registered under "file"; expects `{"path": "..."}`
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStateStoreFactory;

impl StateStoreFactory for FileStateStoreFactory {
    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn StateStore>, Error> {
        let path = config
            .get("path")
            .and_then(|p| p.as_str())
            .ok_or_else(|| Error::config("file state store requires a 'path'"))?
            .to_string();

        // block_in_place requires the multi-threaded runtime.
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::config("file state store must be created inside a tokio runtime"))?;
        let store = tokio::task::block_in_place(|| handle.block_on(FileStateStore::new(path)))?;
        Ok(Box::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::state_store::ResourceKind;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(id: &str) -> ResourceRecord {
        ResourceRecord::new(ResourceKind::GenericSystem, json!({ "id": id }))
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStateStore::new(&path).await.unwrap();
        assert!(store.list_resources().await.unwrap().is_empty());

        store.set_resource("generic_system.web", &record("gs-1")).await.unwrap();
        assert!(path.exists());

        let reopened = FileStateStore::new(&path).await.unwrap();
        let fetched = reopened.get_resource("generic_system.web").await.unwrap().unwrap();
        assert_eq!(fetched.state["id"], "gs-1");
    }

    #[tokio::test]
    async fn test_file_store_corruption_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStateStore::new(&path).await.unwrap();
        store.set_resource("generic_system.web", &record("gs-1")).await.unwrap();
        store.set_resource("generic_system.web", &record("gs-2")).await.unwrap();

        assert!(FileStateStore::backup_path(&path).exists());
        fs::write(&path, b"not json").await.unwrap();

        let recovered = FileStateStore::new(&path).await.unwrap();
        let fetched = recovered.get_resource("generic_system.web").await.unwrap().unwrap();
        // The backup holds the state from before the last write.
        assert_eq!(fetched.state["id"], "gs-1");
    }

    #[tokio::test]
    async fn test_file_store_delete_missing_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileStateStore::new(&path).await.unwrap();
        store.delete_resource("nothing").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_factory_requires_path() {
        assert!(FileStateStoreFactory.create(&json!({})).is_err());

        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStateStoreFactory
            .create(&json!({ "path": path.to_str().unwrap() }))
            .unwrap();
        assert!(store.list_resources().await.unwrap().is_empty());
    }
}
