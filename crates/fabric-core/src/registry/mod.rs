//! Plugin-based client registry
//!
//! Controller clients and state stores are looked up by type name instead
//! of being hard-wired into the engine.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fabric_core::registry::ClientRegistry;
//!
//! let registry = ClientRegistry::with_defaults();
//! fabric_client_apstra::register(&registry);
//!
//! let client = registry.create_client(&config.client)?;
//! let store = registry.create_state_store(&config.state_store)?;
//! ```
//!
//! ## Registration
//!
//! Client crates expose a `register` function:
//!
//! ```rust,ignore
//! pub fn register(registry: &ClientRegistry) {
//!     registry.register_client("apstra", Box::new(ApstraClientFactory));
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::client::MemoryFabricFactory;
use crate::config::{ClientConfig, StateStoreConfig};
use crate::error::{Error, Result};
use crate::state::{FileStateStoreFactory, MemoryStateStoreFactory};
use crate::traits::{FabricClient, FabricClientFactory, StateStore, StateStoreFactory};

/// Registry of client and state store factories
///
/// ## Thread Safety
///
/// Interior mutability with RwLock: concurrent lookups, exclusive
/// registration.
#[derive(Default)]
pub struct ClientRegistry {
    /// Registered controller client factories
    clients: RwLock<HashMap<String, Arc<dyn FabricClientFactory>>>,

    /// Registered state store factories
    state_stores: RwLock<HashMap<String, Arc<dyn StateStoreFactory>>>,
}

impl ClientRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `memory` client and `memory`/`file` stores
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_client("memory", Box::new(MemoryFabricFactory));
        registry.register_state_store("memory", Box::new(MemoryStateStoreFactory));
        registry.register_state_store("file", Box::new(FileStateStoreFactory));
        registry
    }

    /// Register a controller client factory under `name`
    ///
    /// A later registration with the same name replaces the earlier one.
    pub fn register_client(&self, name: impl Into<String>, factory: Box<dyn FabricClientFactory>) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::from(factory));
    }

    /// Register a state store factory under `name`
    pub fn register_state_store(&self, name: impl Into<String>, factory: Box<dyn StateStoreFactory>) {
        self.state_stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::from(factory));
    }

    /// Create a controller client from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(client)`: created client
    /// - `Err(Error::Config)`: type not registered, or the factory rejected
    ///   the configuration
    pub fn create_client(&self, config: &ClientConfig) -> Result<Arc<dyn FabricClient>> {
        config.validate()?;
        let client_type = config.type_name();
        let factory = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown client type: {client_type}")))?;

        factory.create(config)
    }

    /// Create a state store from configuration
    pub fn create_state_store(&self, config: &StateStoreConfig) -> Result<Box<dyn StateStore>> {
        let store_type = config.type_name();
        let factory = self
            .state_stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(store_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown state store type: {store_type}")))?;

        factory.create(&config.factory_config())
    }

    /// Registered client type names, sorted
    pub fn list_clients(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Registered state store type names, sorted
    pub fn list_state_stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state_stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Check if a client type is registered
    pub fn has_client(&self, name: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Check if a state store type is registered
    pub fn has_state_store(&self, name: &str) -> bool {
        self.state_stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}
