//! Test doubles and common utilities for contract tests
//!
//! Everything runs against `MemoryFabric`; the wrappers here only count
//! calls or interfere with them.

#![allow(dead_code)]

use async_trait::async_trait;
use fabric_core::config::{EngineConfig, ResourceConfig};
use fabric_core::error::Result;
use fabric_core::model::{DesiredLink, ObjectId};
use fabric_core::resources::GenericSystemSpec;
use fabric_core::state::MemoryStateStore;
use fabric_core::traits::{BlueprintClient, FabricClient, ResourceRecord, StateStore};
use fabric_core::{EngineEvent, FabricEngine, MemoryFabric};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Blueprint "bp" with two leaf switches
pub fn lab_fabric() -> MemoryFabric {
    let fabric = MemoryFabric::new();
    fabric.add_blueprint("bp");
    fabric.add_switch("bp", "leaf1", &["xe-0/0/1", "xe-0/0/2", "xe-0/0/3", "xe-0/0/4"]);
    fabric.add_switch("bp", "leaf2", &["xe-0/0/1", "xe-0/0/2"]);
    fabric
}

/// Recorded calls other than lock/unlock
pub fn mutations(fabric: &MemoryFabric) -> Vec<String> {
    fabric
        .calls()
        .into_iter()
        .filter(|c| !c.starts_with("lock ") && !c.starts_with("unlock "))
        .collect()
}

/// Generic system resource at `address` with ungrouped links
pub fn system(address: &str, links: &[(&str, &str)]) -> ResourceConfig {
    let links = links
        .iter()
        .map(|(switch, port)| DesiredLink::new(*switch, *port))
        .collect();
    ResourceConfig::generic_system(address, GenericSystemSpec::new("bp", links))
}

/// Generic system resource built from explicit links
pub fn system_with(address: &str, links: Vec<DesiredLink>) -> ResourceConfig {
    ResourceConfig::generic_system(address, GenericSystemSpec::new("bp", links))
}

/// Engine over `client` and `store` with default settings
pub fn engine(client: Arc<dyn FabricClient>, store: SharedStateStore) -> (FabricEngine, mpsc::Receiver<EngineEvent>) {
    FabricEngine::new(client, Box::new(store), &EngineConfig::default()).expect("engine construction succeeds")
}

/// Drain all events currently buffered
pub fn drain(rx: &mut mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Remote ID of the generic system tracked under `address`
pub async fn tracked_system_id(store: &SharedStateStore, address: &str) -> ObjectId {
    let record = store
        .get_resource(address)
        .await
        .unwrap()
        .expect("address is tracked");
    ObjectId::new(record.state["id"].as_str().expect("state carries an id"))
}

/// A state store that outlives the engine using it (simulates restarts)
#[derive(Clone, Default)]
pub struct SharedStateStore {
    inner: Arc<MemoryStateStore>,
    flush_count: Arc<AtomicUsize>,
}

impl SharedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flush() calls
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for SharedStateStore {
    async fn get_resource(&self, address: &str) -> Result<Option<ResourceRecord>> {
        self.inner.get_resource(address).await
    }

    async fn set_resource(&self, address: &str, record: &ResourceRecord) -> Result<()> {
        self.inner.set_resource(address, record).await
    }

    async fn delete_resource(&self, address: &str) -> Result<()> {
        self.inner.delete_resource(address).await
    }

    async fn list_resources(&self) -> Result<Vec<String>> {
        self.inner.list_resources().await
    }

    async fn flush(&self) -> Result<()> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        self.inner.flush().await
    }
}

/// A FabricClient that counts mutex calls and can cancel a token once the
/// mutex is taken
pub struct CountingFabric {
    inner: MemoryFabric,
    lock_calls: Arc<AtomicUsize>,
    unlock_calls: Arc<AtomicUsize>,
    cancel_on_lock: Option<CancellationToken>,
}

impl CountingFabric {
    pub fn new(inner: MemoryFabric) -> Self {
        Self {
            inner,
            lock_calls: Arc::new(AtomicUsize::new(0)),
            unlock_calls: Arc::new(AtomicUsize::new(0)),
            cancel_on_lock: None,
        }
    }

    /// Cancel `token` right after the first successful lock
    pub fn cancelling_on_lock(mut self, token: CancellationToken) -> Self {
        self.cancel_on_lock = Some(token);
        self
    }

    pub fn lock_calls(&self) -> usize {
        self.lock_calls.load(Ordering::SeqCst)
    }

    pub fn unlock_calls(&self) -> usize {
        self.unlock_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FabricClient for CountingFabric {
    async fn blueprint(&self, blueprint_id: &ObjectId) -> Result<Arc<dyn BlueprintClient>> {
        self.inner.blueprint(blueprint_id).await
    }

    async fn lock_blueprint(&self, blueprint_id: &ObjectId, cancel: &CancellationToken) -> Result<()> {
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lock_blueprint(blueprint_id, cancel).await?;
        if let Some(token) = &self.cancel_on_lock {
            token.cancel();
        }
        Ok(())
    }

    async fn unlock_blueprint(&self, blueprint_id: &ObjectId) -> Result<()> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.unlock_blueprint(blueprint_id).await
    }

    fn client_name(&self) -> &'static str {
        "counting"
    }
}
