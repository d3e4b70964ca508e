// # Fabric Client Traits
//
// Defines the interface to the fabric controller.
//
// ## Implementations
//
// - In-memory: `crate::client::MemoryFabric` (tests, demos, dry runs)
// - Apstra: `fabric-client-apstra` crate
//
// ## Usage
//
// ```rust,ignore
// use fabric_core::{FabricClient, ObjectId};
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let client = /* FabricClient implementation */;
//
//     let bp = client.blueprint(&ObjectId::new("bp-1")).await?;
//     let links = bp.list_links(&ObjectId::new("gs-1")).await?;
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::model::{DesiredLink, LagMode, LinkKey, ObjectId, ObservedLink};
use crate::query::PathQuery;

/// Parameters for creating a generic system
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemRequest {
    /// Hostname; the controller generates one when absent
    pub hostname: Option<String>,
    /// Web UI label; the controller generates one when absent
    pub label: Option<String>,
    /// Tags applied to the system node
    pub tags: BTreeSet<String>,
    /// Whether the system is external to the fabric
    pub external: bool,
    /// Lower bound for port-channel numbers (0 = controller default)
    pub port_channel_id_min: u32,
    /// Upper bound for port-channel numbers (0 = controller default)
    pub port_channel_id_max: u32,
}

/// A generic system node as reported by the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Node ID
    pub id: ObjectId,
    /// Hostname
    pub hostname: String,
    /// Web UI label
    pub label: String,
    /// External flag
    pub external: bool,
    /// Local ASN, when assigned
    pub asn: Option<u32>,
    /// IPv4 loopback (CIDR), when assigned
    pub loopback_ipv4: Option<String>,
    /// IPv6 loopback (CIDR), when assigned
    pub loopback_ipv6: Option<String>,
    /// Port-channel lower bound
    pub port_channel_id_min: u32,
    /// Port-channel upper bound
    pub port_channel_id_max: u32,
    /// Deploy mode (deploy, ready, drain, undeploy)
    pub deploy_mode: String,
}

/// Mutable LAG parameters of an existing link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkParams {
    /// Group label
    pub group_label: Option<String>,
    /// LAG mode
    pub lag_mode: Option<LagMode>,
    /// Link tags
    pub tags: BTreeSet<String>,
}

impl From<&DesiredLink> for LinkParams {
    fn from(link: &DesiredLink) -> Self {
        Self {
            group_label: link.group_label.clone(),
            lag_mode: link.lag_mode,
            tags: link.tags.clone(),
        }
    }
}

/// Trait for fabric controller clients
///
/// A client owns the authenticated session. Everything below the blueprint
/// level goes through a [`BlueprintClient`].
///
/// # Trust Level: Untrusted
///
/// ## Allowed Capabilities
/// - ✅ Perform HTTP/HTTPS API calls to the controller only
/// - ✅ Poll while waiting for the blueprint mutex (bounded by its timeout)
/// - ✅ Return success or failure verbatim
///
/// ## Forbidden Capabilities
/// - ❌ Retry failed mutations (the caller decides)
/// - ❌ Access the state store
/// - ❌ Decide what to change (owned by the reconcile layer)
#[async_trait]
pub trait FabricClient: Send + Sync {
    /// Open a blueprint-scoped client
    ///
    /// # Returns
    ///
    /// - `Ok(client)`: The blueprint exists
    /// - `Err(Error::NotFound)`: No blueprint with that ID
    async fn blueprint(&self, blueprint_id: &ObjectId) -> Result<Arc<dyn BlueprintClient>, crate::Error>;

    /// Acquire the advisory mutex of a blueprint, waiting while another
    /// holder has it
    ///
    /// `cancel` is only observed between attempts: a lock request already
    /// sent is completed, so `Ok(())` always means the mutex is held and
    /// `Err(Error::Cancelled)` means it is not.
    async fn lock_blueprint(&self, blueprint_id: &ObjectId, cancel: &CancellationToken) -> Result<(), crate::Error>;

    /// Release the advisory mutex of a blueprint
    async fn unlock_blueprint(&self, blueprint_id: &ObjectId) -> Result<(), crate::Error>;

    /// Client name (for logging/debugging)
    fn client_name(&self) -> &'static str;
}

/// Typed calls scoped to one blueprint
///
/// Every method is a single remote call. `Error::NotFound` means the
/// targeted object does not exist; any other failure is reported as-is.
#[async_trait]
pub trait BlueprintClient: Send + Sync {
    /// Blueprint this client is scoped to
    fn blueprint_id(&self) -> &ObjectId;

    /// Create a generic system together with its initial links
    ///
    /// LAG groups named by the links are created by the controller in the
    /// same request.
    async fn create_generic_system(
        &self,
        system: &SystemRequest,
        links: &[DesiredLink],
    ) -> Result<ObjectId, crate::Error>;

    /// Read a generic system node
    async fn get_generic_system(&self, system_id: &ObjectId) -> Result<SystemInfo, crate::Error>;

    /// Set hostname and label
    async fn set_system_names(
        &self,
        system_id: &ObjectId,
        hostname: &str,
        label: &str,
    ) -> Result<(), crate::Error>;

    /// Set or clear the local ASN
    async fn set_system_asn(&self, system_id: &ObjectId, asn: Option<u32>) -> Result<(), crate::Error>;

    /// Set or clear the loopback addresses
    async fn set_system_loopbacks(
        &self,
        system_id: &ObjectId,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
    ) -> Result<(), crate::Error>;

    /// Set the port-channel number range
    async fn set_port_channel_range(
        &self,
        system_id: &ObjectId,
        min: u32,
        max: u32,
    ) -> Result<(), crate::Error>;

    /// Set the deploy mode
    async fn set_deploy_mode(&self, system_id: &ObjectId, mode: &str) -> Result<(), crate::Error>;

    /// Read the tags of any node
    async fn get_node_tags(&self, node_id: &ObjectId) -> Result<BTreeSet<String>, crate::Error>;

    /// Replace the tags of any node
    async fn set_node_tags(&self, node_id: &ObjectId, tags: &BTreeSet<String>) -> Result<(), crate::Error>;

    /// Delete a generic system and all of its links
    ///
    /// Fails with `Error::TemplatesAssigned` when connectivity templates are
    /// still attached to any of its links.
    async fn delete_generic_system(&self, system_id: &ObjectId) -> Result<(), crate::Error>;

    /// Ethernet links of a generic system
    async fn list_links(&self, system_id: &ObjectId) -> Result<Vec<ObservedLink>, crate::Error>;

    /// Add one link to an existing generic system
    async fn create_link(&self, system_id: &ObjectId, link: &DesiredLink) -> Result<ObjectId, crate::Error>;

    /// Change group label, LAG mode and tags of a link
    async fn update_link(&self, link_id: &ObjectId, params: &LinkParams) -> Result<(), crate::Error>;

    /// Change the transform of the switch interface a link lands on
    ///
    /// Fails with `Error::TransformImmutable` when the controller refuses.
    async fn set_transform(&self, key: &LinkKey, transform_id: u32) -> Result<(), crate::Error>;

    /// Delete one link
    ///
    /// Fails with `Error::TemplatesAssigned` when connectivity templates are
    /// still attached to it.
    async fn delete_link(&self, link_id: &ObjectId) -> Result<(), crate::Error>;

    /// Create an aggregate (LAG) for `label` on a generic system
    async fn create_lag(
        &self,
        system_id: &ObjectId,
        label: &str,
        mode: LagMode,
    ) -> Result<ObjectId, crate::Error>;

    /// Delete an aggregate; it must have no member links left
    async fn delete_lag(&self, lag_id: &ObjectId) -> Result<(), crate::Error>;

    /// Connectivity templates attached to an application point
    async fn get_application_point_templates(
        &self,
        application_point_id: &ObjectId,
    ) -> Result<BTreeSet<ObjectId>, crate::Error>;

    /// Attach (`true`) or detach (`false`) templates on an application point
    async fn set_application_point_templates(
        &self,
        application_point_id: &ObjectId,
        assignments: &BTreeMap<ObjectId, bool>,
    ) -> Result<(), crate::Error>;

    /// Run a graph query, returning one item per matched path
    async fn query(&self, query: &PathQuery) -> Result<Vec<serde_json::Value>, crate::Error>;
}

/// Helper trait for constructing fabric clients from configuration
pub trait FabricClientFactory: Send + Sync {
    /// Create a FabricClient instance from configuration
    ///
    /// # Parameters
    ///
    /// - `config`: Configuration specific to this client
    ///
    /// # Returns
    ///
    /// A shared FabricClient trait object
    fn create(&self, config: &crate::config::ClientConfig) -> Result<Arc<dyn FabricClient>, crate::Error>;
}
