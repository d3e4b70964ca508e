//! Configuration types for the fabric reconciliation system
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::resources::{GenericSystemSpec, TemplateAssignmentSpec};
use crate::traits::ResourceKind;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Controller client configuration
    pub client: ClientConfig,

    /// State store configuration
    #[serde(default)]
    pub state_store: StateStoreConfig,

    /// Resources to manage
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl FabricConfig {
    /// Configuration with a client and nothing to manage
    pub fn new(client: ClientConfig) -> Self {
        Self {
            client,
            state_store: StateStoreConfig::default(),
            resources: Vec::new(),
            engine: EngineConfig::default(),
        }
    }

    /// Validate the configuration
    ///
    /// An empty resource list is valid: applying it destroys everything
    /// tracked.
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.client.validate()?;
        self.engine.validate()?;

        let mut seen = BTreeSet::new();
        for resource in &self.resources {
            if resource.address.is_empty() {
                return Err(crate::Error::config("Resource address cannot be empty"));
            }
            if !seen.insert(resource.address.as_str()) {
                return Err(crate::Error::config(format!(
                    "Resource address '{}' is used twice",
                    resource.address
                )));
            }
            resource.spec.validate()?;
        }
        Ok(())
    }
}

/// Controller client configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientConfig {
    /// Apstra controller over its REST API
    Apstra {
        /// Base URL, e.g. "https://apstra.example.com"
        url: String,
        /// Login user
        username: String,
        /// Login password
        password: String,
        /// Skip TLS certificate validation
        #[serde(default)]
        tls_validation_disabled: bool,
        /// Per-request timeout in seconds
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        /// How long to wait for a blueprint mutex held by someone else
        #[serde(default = "default_lock_timeout_secs")]
        lock_timeout_secs: u64,
        /// Delay between attempts while waiting for the mutex
        #[serde(default = "default_lock_poll_interval_ms")]
        lock_poll_interval_ms: u64,
    },

    /// In-memory fabric (tests, demos, dry runs)
    Memory {
        /// Blueprints and switch ports to create at startup
        #[serde(default)]
        blueprints: Vec<MemorySeed>,
    },

    /// Custom client
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientConfig::Apstra {
                url,
                username,
                tls_validation_disabled,
                timeout_secs,
                lock_timeout_secs,
                lock_poll_interval_ms,
                ..
            } => f
                .debug_struct("Apstra")
                .field("url", url)
                .field("username", username)
                .field("password", &"<redacted>")
                .field("tls_validation_disabled", tls_validation_disabled)
                .field("timeout_secs", timeout_secs)
                .field("lock_timeout_secs", lock_timeout_secs)
                .field("lock_poll_interval_ms", lock_poll_interval_ms)
                .finish(),
            ClientConfig::Memory { blueprints } => f.debug_struct("Memory").field("blueprints", blueprints).finish(),
            ClientConfig::Custom { factory, .. } => f
                .debug_struct("Custom")
                .field("factory", factory)
                .finish_non_exhaustive(),
        }
    }
}

impl ClientConfig {
    /// Validate the client configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ClientConfig::Apstra {
                url,
                username,
                password,
                timeout_secs,
                lock_poll_interval_ms,
                ..
            } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(crate::Error::config("Apstra URL must start with http:// or https://"));
                }
                if username.is_empty() || password.is_empty() {
                    return Err(crate::Error::config("Apstra username and password are required"));
                }
                if *timeout_secs == 0 {
                    return Err(crate::Error::config("Apstra request timeout must be > 0"));
                }
                if *lock_poll_interval_ms == 0 {
                    return Err(crate::Error::config("Lock poll interval must be > 0"));
                }
                Ok(())
            }
            ClientConfig::Memory { blueprints } => {
                if blueprints.iter().any(|b| b.id.is_empty()) {
                    return Err(crate::Error::config("Memory blueprint id cannot be empty"));
                }
                Ok(())
            }
            ClientConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("Custom client factory cannot be empty"));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom client config cannot be null"));
                }
                Ok(())
            }
        }
    }

    /// Get the client type name
    pub fn type_name(&self) -> &str {
        match self {
            ClientConfig::Apstra { .. } => "apstra",
            ClientConfig::Memory { .. } => "memory",
            ClientConfig::Custom { factory, .. } => factory,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::Memory {
            blueprints: Vec::new(),
        }
    }
}

/// Blueprint to create in an in-memory fabric
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySeed {
    /// Blueprint ID
    pub id: String,
    /// Switch ID -> port names
    #[serde(default)]
    pub switches: BTreeMap<String, Vec<String>>,
}

/// State store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateStoreConfig {
    /// File-based state store
    File {
        /// Path to the state file
        path: String,
    },

    /// In-memory state store (not persistent)
    #[default]
    Memory,

    /// Custom state store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl StateStoreConfig {
    /// Get the state store type name
    pub fn type_name(&self) -> &str {
        match self {
            StateStoreConfig::File { .. } => "file",
            StateStoreConfig::Memory => "memory",
            StateStoreConfig::Custom { factory, .. } => factory,
        }
    }

    /// Configuration value handed to the factory
    pub fn factory_config(&self) -> serde_json::Value {
        match self {
            StateStoreConfig::File { path } => serde_json::json!({ "path": path }),
            StateStoreConfig::Memory => serde_json::Value::Null,
            StateStoreConfig::Custom { config, .. } => config.clone(),
        }
    }
}

/// One managed resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Stable address used to track the resource across runs
    pub address: String,

    /// What the resource should look like
    #[serde(flatten)]
    pub spec: ResourceSpec,
}

impl ResourceConfig {
    /// Generic system resource at `address`
    pub fn generic_system(address: impl Into<String>, spec: GenericSystemSpec) -> Self {
        Self {
            address: address.into(),
            spec: ResourceSpec::GenericSystem(spec),
        }
    }

    /// Template assignment resource at `address`
    pub fn template_assignment(address: impl Into<String>, spec: TemplateAssignmentSpec) -> Self {
        Self {
            address: address.into(),
            spec: ResourceSpec::TemplateAssignment(spec),
        }
    }
}

/// Desired state of a resource, by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceSpec {
    /// Generic system with links
    GenericSystem(GenericSystemSpec),
    /// Connectivity templates on one application point
    TemplateAssignment(TemplateAssignmentSpec),
}

impl ResourceSpec {
    /// Kind recorded in tracked state
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::GenericSystem(_) => ResourceKind::GenericSystem,
            ResourceSpec::TemplateAssignment(_) => ResourceKind::TemplateAssignment,
        }
    }

    /// Validate without contacting the controller
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ResourceSpec::GenericSystem(spec) => spec.validate(),
            ResourceSpec::TemplateAssignment(spec) => spec.validate(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Skip the blueprint mutex entirely
    ///
    /// Only safe when nothing else mutates the same blueprints.
    #[serde(default)]
    pub blueprint_mutex_disabled: bool,

    /// Capacity of the event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blueprint_mutex_disabled: false,
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_lock_timeout_secs() -> u64 {
    120
}

fn default_lock_poll_interval_ms() -> u64 {
    500
}

fn default_event_channel_capacity() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apstra_defaults_apply() {
        let config: ClientConfig = serde_json::from_value(json!({
            "type": "apstra",
            "url": "https://apstra.example.com",
            "username": "admin",
            "password": "secret"
        }))
        .unwrap();

        match &config {
            ClientConfig::Apstra {
                timeout_secs,
                lock_timeout_secs,
                tls_validation_disabled,
                ..
            } => {
                assert_eq!(*timeout_secs, 30);
                assert_eq!(*lock_timeout_secs, 120);
                assert!(!tls_validation_disabled);
            }
            other => panic!("unexpected {other:?}"),
        }
        config.validate().unwrap();
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn resources_decode_by_type() {
        let config: FabricConfig = serde_json::from_value(json!({
            "client": { "type": "memory" },
            "resources": [
                {
                    "address": "generic_system.web",
                    "type": "generic_system",
                    "blueprint_id": "bp",
                    "links": [
                        { "target_switch_id": "sw1", "target_switch_if_name": "xe-0/0/1" }
                    ]
                },
                {
                    "address": "template_assignment.web",
                    "type": "template_assignment",
                    "blueprint_id": "bp",
                    "application_point_id": "if-1",
                    "template_ids": ["ct-1"]
                }
            ]
        }))
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.resources[0].spec.kind(), ResourceKind::GenericSystem);
        assert_eq!(config.resources[1].spec.kind(), ResourceKind::TemplateAssignment);
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let spec = TemplateAssignmentSpec::new("bp", "if-1", ["ct-1"]);
        let mut config = FabricConfig::new(ClientConfig::default());
        config.resources.push(ResourceConfig::template_assignment("a", spec.clone()));
        config.resources.push(ResourceConfig::template_assignment("a", spec));
        assert!(config.validate().is_err());
    }

    #[test]
    fn apstra_requires_scheme() {
        let config = ClientConfig::Apstra {
            url: "apstra.example.com".into(),
            username: "u".into(),
            password: "p".into(),
            tls_validation_disabled: false,
            timeout_secs: 30,
            lock_timeout_secs: 120,
            lock_poll_interval_ms: 500,
        };
        assert!(config.validate().is_err());
    }
}
