//! Core traits for the fabric reconciliation system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`FabricClient`]: Controller session, blueprint lookup and the blueprint mutex
//! - [`BlueprintClient`]: Typed calls scoped to one blueprint
//! - [`StateStore`]: Persistent tracked state for managed resources

pub mod fabric_client;
pub mod state_store;

pub use fabric_client::{
    BlueprintClient, FabricClient, FabricClientFactory, LinkParams, SystemInfo, SystemRequest,
};
pub use state_store::{ResourceKind, ResourceRecord, StateStore, StateStoreFactory};
