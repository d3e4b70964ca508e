// # fabric-core
//
// Core library for declarative management of datacenter-fabric objects.
//
// ## Architecture Overview
//
// - **FabricClient / BlueprintClient**: Traits for talking to the fabric
//   controller, one blueprint at a time
// - **StateStore**: Trait for tracked resource state between runs
// - **reconcile**: Natural-key matching, LAG group resolution and ordered
//   application of the resulting operations
// - **lock**: Scoped blueprint mutex around every mutation
// - **resources**: Generic systems and connectivity-template assignments
// - **FabricEngine**: Applies a list of resources against tracked state
// - **ClientRegistry**: Plugin-based registry for clients and state stores
//
// ## Design Principles
//
// 1. **Identity by natural key**: remote IDs are never used to decide what
//    an entry is, only to address it
// 2. **Scope**: only objects this crate created or is told about are ever
//    modified
// 3. **Plugin-Based**: Clients are registered dynamically, no hard-coded if-else
// 4. **Library-First**: All core functionality can be used as a library

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod model;
pub mod query;
pub mod reconcile;
pub mod registry;
pub mod resources;
pub mod state;
pub mod traits;

// Re-export core types for convenience
pub use client::MemoryFabric;
pub use config::{ClientConfig, FabricConfig, ResourceConfig, StateStoreConfig};
pub use engine::{EngineEvent, FabricEngine, RunSummary};
pub use error::{Error, Result};
pub use lock::{BlueprintGuard, with_blueprint_lock};
pub use model::{DesiredLink, LagMode, LinkKey, ObjectId, ObservedLink};
pub use registry::ClientRegistry;
pub use state::{FileStateStore, MemoryStateStore};
pub use traits::{BlueprintClient, FabricClient, StateStore};
