// # Memory State Store
//
// In-memory implementation of StateStore.
//
// ## Crash Behavior
//
// - All tracked state is lost on exit
// - The next run sees every configured resource as new and creates it again,
//   which fails for objects that still exist remotely
//
// Suitable for tests, demos and one-shot runs against a scratch blueprint.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::state_store::{ResourceRecord, StateStore, StateStoreFactory};

/// In-memory state store implementation
///
/// # Example
///
/// ```rust,no_run
/// use fabric_core::state::MemoryStateStore;
/// use fabric_core::traits::StateStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStateStore::new();
///     assert!(store.get_resource("generic_system.web").await?.is_none());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<RwLock<HashMap<String, ResourceRecord>>>,
}

impl MemoryStateStore {
    /// Create a new empty memory state store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked resources
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether nothing is tracked
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Forget everything
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_resource(&self, address: &str) -> Result<Option<ResourceRecord>, Error> {
        Ok(self.inner.read().await.get(address).cloned())
    }

    async fn set_resource(&self, address: &str, record: &ResourceRecord) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .insert(address.to_string(), record.clone());
        Ok(())
    }

    async fn delete_resource(&self, address: &str) -> Result<(), Error> {
        self.inner.write().await.remove(address);
        Ok(())
    }

    async fn list_resources(&self) -> Result<Vec<String>, Error> {
        let mut addresses: Vec<String> = self.inner.read().await.keys().cloned().collect();
        addresses.sort();
        Ok(addresses)
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Factory registered under "memory"
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStateStoreFactory;

impl StateStoreFactory for MemoryStateStoreFactory {
    fn create(&self, _config: &serde_json::Value) -> Result<Box<dyn StateStore>, Error> {
        Ok(Box::new(MemoryStateStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::state_store::ResourceKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStateStore::new();
        assert!(store.is_empty().await);

        let record = ResourceRecord::new(ResourceKind::GenericSystem, json!({"id": "gs-1"}));
        store.set_resource("generic_system.web", &record).await.unwrap();
        assert_eq!(store.len().await, 1);

        let fetched = store.get_resource("generic_system.web").await.unwrap().unwrap();
        assert_eq!(fetched.kind, ResourceKind::GenericSystem);
        assert_eq!(fetched.state["id"], "gs-1");

        store.delete_resource("generic_system.web").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_store_list_is_sorted() {
        let store = MemoryStateStore::new();
        let record = ResourceRecord::new(ResourceKind::TemplateAssignment, json!({}));
        store.set_resource("b", &record).await.unwrap();
        store.set_resource("a", &record).await.unwrap();

        assert_eq!(store.list_resources().await.unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_memory_store_delete_missing_is_ok() {
        let store = MemoryStateStore::new();
        tokio_test::assert_ok!(tokio_test::block_on(store.delete_resource("never-tracked")));
        assert!(tokio_test::block_on(store.list_resources()).unwrap().is_empty());
    }
}
