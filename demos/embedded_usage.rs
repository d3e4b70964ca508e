//! Minimal embedding example for fabric-core
//!
//! This example drives the engine against the in-memory fabric with a
//! custom state store. The application owns the engine, the event channel
//! and the cancellation token.

use fabric_core::model::{DesiredLink, LagMode, ObjectId};
use fabric_core::resources::{GenericSystemSpec, TemplateAssignmentSpec};
use fabric_core::traits::{ResourceRecord, StateStore};
use fabric_core::config::EngineConfig;
use fabric_core::{FabricClient, FabricEngine, MemoryFabric, ResourceConfig, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Custom state store that prints every write
#[derive(Clone, Default)]
struct EmbeddedStateStore {
    records: Arc<Mutex<HashMap<String, ResourceRecord>>>,
}

impl EmbeddedStateStore {
    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResourceRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl StateStore for EmbeddedStateStore {
    async fn get_resource(&self, address: &str) -> Result<Option<ResourceRecord>> {
        Ok(self.records().get(address).cloned())
    }

    async fn set_resource(&self, address: &str, record: &ResourceRecord) -> Result<()> {
        println!("[State] {} <- {}", address, record.state);
        self.records().insert(address.to_string(), record.clone());
        Ok(())
    }

    async fn delete_resource(&self, address: &str) -> Result<()> {
        println!("[State] {} forgotten", address);
        self.records().remove(address);
        Ok(())
    }

    async fn list_resources(&self) -> Result<Vec<String>> {
        let mut addresses: Vec<String> = self.records().keys().cloned().collect();
        addresses.sort();
        Ok(addresses)
    }

    async fn flush(&self) -> Result<()> {
        println!("[State] flushed");
        Ok(())
    }
}

fn web_server(second_leaf_port: &str) -> ResourceConfig {
    let links = vec![
        DesiredLink::new("leaf1", "xe-0/0/1").with_group("bond0", LagMode::LacpActive),
        DesiredLink::new("leaf2", second_leaf_port).with_group("bond0", LagMode::LacpActive),
        DesiredLink::new("leaf1", "xe-0/0/2").with_tags(["mgmt"]),
    ];
    let mut spec = GenericSystemSpec::new("bp", links);
    spec.hostname = Some("web01".to_string());
    spec.asn = Some(65001);
    ResourceConfig::generic_system("generic_system.web", spec)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
    println!("=== Embedded fabric-core Example ===\n");

    let fabric = MemoryFabric::new();
    fabric.add_blueprint("bp");
    fabric.add_switch("bp", "leaf1", &["xe-0/0/1", "xe-0/0/2"]);
    fabric.add_switch("bp", "leaf2", &["xe-0/0/1", "xe-0/0/2"]);

    let store = EmbeddedStateStore::default();
    let config = EngineConfig {
        event_channel_capacity: 100,
        ..EngineConfig::default()
    };

    println!("1. Creating engine...");
    let (engine, mut event_rx) = FabricEngine::new(Arc::new(fabric.clone()), Box::new(store.clone()), &config)?;

    let event_listener = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("[Event] {:?}", event);
        }
    });

    let cancel = CancellationToken::new();

    println!("\n2. Creating a generic system with a two-leaf LAG...");
    let summary = engine.apply(&[web_server("xe-0/0/1")], &cancel).await?;
    println!("   created={} failed={}", summary.created, summary.failed.len());

    println!("\n3. Moving one LAG member to another port...");
    let summary = engine.apply(&[web_server("xe-0/0/2")], &cancel).await?;
    println!("   updated={} unchanged={}", summary.updated, summary.unchanged);

    println!("\n4. Attaching a connectivity template to leaf1 xe-0/0/1...");
    let assignment = ResourceConfig::template_assignment(
        "template_assignment.web",
        TemplateAssignmentSpec::new("bp", "if-1", ["ct-web"]),
    );
    engine
        .apply(&[web_server("xe-0/0/2"), assignment.clone()], &cancel)
        .await?;
    let bp = fabric.blueprint(&ObjectId::new("bp")).await?;
    println!(
        "   templates on if-1: {:?}",
        bp.get_application_point_templates(&ObjectId::new("if-1")).await?
    );

    println!("\n5. Applying again (should change nothing)...");
    fabric.clear_calls();
    let summary = engine
        .apply(&[web_server("xe-0/0/2"), assignment], &cancel)
        .await?;
    println!("   unchanged={} calls={:?}", summary.unchanged, fabric.calls());

    println!("\n6. Destroying everything tracked...");
    let summary = engine.destroy(&cancel).await?;
    println!("   deleted={} systems left={}", summary.deleted, fabric.system_count("bp"));

    drop(engine);
    let _ = event_listener.await;

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- The application owns the engine and its cancellation token");
    println!("- Tracked state lives wherever the StateStore puts it");
    println!("- A second apply with the same configuration is a no-op");
    println!("- Tracked resources left: {}", store.records().len());

    Ok(())
}
