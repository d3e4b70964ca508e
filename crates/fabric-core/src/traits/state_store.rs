// # State Store Trait
//
// Defines the interface for tracked resource state.
//
// ## Purpose
//
// The state store remembers, per resource address:
// - Which kind of resource it is
// - The last state read back after a successful apply
// - When that apply happened
//
// Without it the engine could not tell a resource it created earlier from
// one it has never seen, and could not find remote IDs on the next run.
//
// ## Implementations
//
// - In-memory: `MemoryStateStore`
// - File-based: `FileStateStore` (JSON, atomic replace)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of managed resource behind a state record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A generic system with its links
    GenericSystem,
    /// Connectivity templates on one application point
    TemplateAssignment,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::GenericSystem => "generic_system",
            ResourceKind::TemplateAssignment => "template_assignment",
        })
    }
}

/// Tracked state of one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource kind
    pub kind: ResourceKind,
    /// Serialized resource state
    pub state: serde_json::Value,
    /// Timestamp of the last successful apply or refresh
    pub last_applied: chrono::DateTime<chrono::Utc>,
}

impl ResourceRecord {
    /// Create a record stamped with the current time
    pub(crate) fn new(kind: ResourceKind, state: serde_json::Value) -> Self {
        Self {
            kind,
            state,
            last_applied: chrono::Utc::now(),
        }
    }
}

/// Trait for state store implementations
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Perform I/O for persistent storage
/// - ✅ Cache state in memory (with explicit flush)
///
/// ## Forbidden Capabilities
/// - ❌ Talk to the fabric controller (owned by `FabricClient`)
/// - ❌ Decide what to change (owned by `FabricEngine`)
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get the record for a resource address
    ///
    /// # Returns
    ///
    /// - `Ok(Some(record))`: The resource is tracked
    /// - `Ok(None)`: Nothing tracked under that address
    /// - `Err(Error)`: Storage error
    async fn get_resource(&self, address: &str) -> Result<Option<ResourceRecord>, crate::Error>;

    /// Create or replace the record for a resource address
    async fn set_resource(&self, address: &str, record: &ResourceRecord) -> Result<(), crate::Error>;

    /// Forget a resource address (no error if it is not tracked)
    async fn delete_resource(&self, address: &str) -> Result<(), crate::Error>;

    /// All tracked addresses
    async fn list_resources(&self) -> Result<Vec<String>, crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}

/// Helper trait for constructing state stores from configuration
pub trait StateStoreFactory: Send + Sync {
    /// Create a StateStore instance from configuration
    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn StateStore>, crate::Error>;
}
