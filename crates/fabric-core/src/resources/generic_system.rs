//! Generic system resource
//!
//! A generic system is a server or external device attached to fabric
//! switches. Its links are managed as a set keyed by switch interface; LAG
//! groups follow from the links' group labels.

use async_trait::async_trait;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Outcome, Resource, ensure_live};
use crate::error::{Error, Result};
use crate::lock::with_blueprint_lock;
use crate::model::{DesiredLink, LinkKey, ObjectId, ObservedLink};
use crate::reconcile::lookup::{clear_link_templates, lags_of_system};
use crate::reconcile::{ApplyExecutor, compute_plan, order_operations, resolve_groups, validate_link_set};
use crate::traits::{BlueprintClient, FabricClient, ResourceKind, SystemRequest};

const DEPLOY_MODES: [&str; 4] = ["deploy", "ready", "drain", "undeploy"];
const PORT_CHANNEL_ID_MAX: u32 = 4096;

/// Desired generic system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericSystemSpec {
    /// Blueprint the system lives in
    pub blueprint_id: ObjectId,
    /// Web UI label; generated by the controller when absent
    #[serde(default)]
    pub name: Option<String>,
    /// Hostname; generated by the controller when absent
    #[serde(default)]
    pub hostname: Option<String>,
    /// Tags on the system node
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Links to fabric switches
    pub links: Vec<DesiredLink>,
    /// Local ASN
    #[serde(default)]
    pub asn: Option<u32>,
    /// IPv4 loopback in CIDR notation
    #[serde(default)]
    pub loopback_ipv4: Option<String>,
    /// IPv6 loopback in CIDR notation
    #[serde(default)]
    pub loopback_ipv6: Option<String>,
    /// Lower bound for port-channel numbers (0 = controller default)
    #[serde(default)]
    pub port_channel_id_min: u32,
    /// Upper bound for port-channel numbers (0 = controller default)
    #[serde(default)]
    pub port_channel_id_max: u32,
    /// Whether the system is external to the fabric
    #[serde(default)]
    pub external: bool,
    /// Deploy mode (deploy, ready, drain, undeploy)
    #[serde(default)]
    pub deploy_mode: Option<String>,
    /// Detach connectivity templates that would block deletion
    #[serde(default)]
    pub clear_cts_on_destroy: bool,
}

impl GenericSystemSpec {
    /// Minimal spec: a blueprint and its links
    pub fn new(blueprint_id: impl Into<ObjectId>, links: Vec<DesiredLink>) -> Self {
        Self {
            blueprint_id: blueprint_id.into(),
            name: None,
            hostname: None,
            tags: BTreeSet::new(),
            links,
            asn: None,
            loopback_ipv4: None,
            loopback_ipv6: None,
            port_channel_id_min: 0,
            port_channel_id_max: 0,
            external: false,
            deploy_mode: None,
            clear_cts_on_destroy: false,
        }
    }

    /// Check the desired state without contacting the controller
    pub fn validate(&self) -> Result<()> {
        if self.blueprint_id.is_empty() {
            return Err(Error::validation("blueprint_id", "must not be empty"));
        }
        if self.links.is_empty() {
            return Err(Error::validation("links", "at least one link is required"));
        }
        validate_link_set(&self.links)?;

        for (field, value) in [("name", &self.name), ("hostname", &self.hostname)] {
            if value.as_deref() == Some("") {
                return Err(Error::validation(field, "must not be empty"));
            }
        }
        if self.tags.iter().chain(self.links.iter().flat_map(|l| &l.tags)).any(String::is_empty) {
            return Err(Error::validation("tags", "tags must not be empty strings"));
        }
        if self.asn == Some(0) {
            return Err(Error::validation("asn", "must be between 1 and 4294967295"));
        }
        if let Some(v4) = &self.loopback_ipv4 {
            validate_cidr("loopback_ipv4", v4, false)?;
        }
        if let Some(v6) = &self.loopback_ipv6 {
            validate_cidr("loopback_ipv6", v6, true)?;
        }

        let (min, max) = (self.port_channel_id_min, self.port_channel_id_max);
        if (min == 0) != (max == 0) {
            return Err(Error::validation(
                "port_channel_id_min",
                "port_channel_id_min and port_channel_id_max must be set together",
            ));
        }
        if min > max || max > PORT_CHANNEL_ID_MAX {
            return Err(Error::validation(
                "port_channel_id_max",
                format!("range {min}-{max} must satisfy 1 <= min <= max <= {PORT_CHANNEL_ID_MAX}"),
            ));
        }

        if let Some(mode) = &self.deploy_mode
            && !DEPLOY_MODES.contains(&mode.as_str())
        {
            return Err(Error::validation(
                "deploy_mode",
                format!("{mode:?} is not one of {}", DEPLOY_MODES.join(", ")),
            ));
        }
        Ok(())
    }

    /// Whether moving from `state` to this spec needs a new system
    pub fn requires_replace(&self, state: &GenericSystemState) -> bool {
        self.blueprint_id != state.blueprint_id || self.external != state.external
    }
}

fn validate_cidr(field: &str, value: &str, v6: bool) -> Result<()> {
    let parsed = if v6 {
        value.parse::<Ipv6Net>().map(|_| ())
    } else {
        value.parse::<Ipv4Net>().map(|_| ())
    };
    parsed.map_err(|e| Error::validation(field, format!("{value:?} is not an IPv{} CIDR: {e}", if v6 { 6 } else { 4 })))
}

/// Tracked state of a generic system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericSystemState {
    /// Node ID
    pub id: ObjectId,
    /// Blueprint the system lives in
    pub blueprint_id: ObjectId,
    /// Web UI label
    pub name: String,
    /// Hostname
    pub hostname: String,
    /// Tags on the system node
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Ethernet links, with remote IDs
    #[serde(default)]
    pub links: Vec<ObservedLink>,
    /// Local ASN
    #[serde(default)]
    pub asn: Option<u32>,
    /// IPv4 loopback
    #[serde(default)]
    pub loopback_ipv4: Option<String>,
    /// IPv6 loopback
    #[serde(default)]
    pub loopback_ipv6: Option<String>,
    /// Port-channel lower bound
    #[serde(default)]
    pub port_channel_id_min: u32,
    /// Port-channel upper bound
    #[serde(default)]
    pub port_channel_id_max: u32,
    /// External flag
    #[serde(default)]
    pub external: bool,
    /// Deploy mode
    #[serde(default)]
    pub deploy_mode: String,
    /// Carried from the desired state for use by Delete
    #[serde(default)]
    pub clear_cts_on_destroy: bool,
}

impl GenericSystemState {
    /// What is known about a system whose creation did not finish
    fn provisional(id: ObjectId, spec: &GenericSystemSpec) -> Self {
        Self {
            id,
            blueprint_id: spec.blueprint_id.clone(),
            name: spec.name.clone().unwrap_or_default(),
            hostname: spec.hostname.clone().unwrap_or_default(),
            tags: spec.tags.clone(),
            links: Vec::new(),
            asn: None,
            loopback_ipv4: None,
            loopback_ipv6: None,
            port_channel_id_min: spec.port_channel_id_min,
            port_channel_id_max: spec.port_channel_id_max,
            external: spec.external,
            deploy_mode: String::new(),
            clear_cts_on_destroy: spec.clear_cts_on_destroy,
        }
    }
}

/// Keep a null group label where the configuration never set one
///
/// The controller assigns labels to ungrouped links on its own; reporting
/// them would show as drift on every run.
fn normalize_links(mut observed: Vec<ObservedLink>, prior: Option<&[ObservedLink]>) -> Vec<ObservedLink> {
    let Some(prior) = prior else {
        return observed;
    };
    let unlabeled: BTreeMap<&LinkKey, ()> = prior
        .iter()
        .filter(|l| l.group_label.is_none())
        .map(|l| (&l.key, ()))
        .collect();
    for link in &mut observed {
        if link.lag_mode.is_none() && unlabeled.contains_key(&link.key) {
            link.group_label = None;
        }
    }
    observed
}

/// Lifecycle of generic systems
pub struct GenericSystemResource {
    client: Arc<dyn FabricClient>,
    locking: bool,
}

impl GenericSystemResource {
    /// `locking == false` skips the blueprint mutex
    pub fn new(client: Arc<dyn FabricClient>, locking: bool) -> Self {
        Self { client, locking }
    }

    async fn create_inner(
        &self,
        spec: &GenericSystemSpec,
        cancel: &CancellationToken,
        created: &mut Option<ObjectId>,
    ) -> Result<(GenericSystemState, usize)> {
        spec.validate()?;
        ensure_live(cancel)?;
        let bp = self.open(&spec.blueprint_id).await?;
        let bp = bp.as_ref();

        with_blueprint_lock(self.client.clone(), &spec.blueprint_id, self.locking, cancel, move || async move {
            ensure_live(cancel)?;
            let request = SystemRequest {
                hostname: spec.hostname.clone(),
                label: spec.name.clone(),
                tags: spec.tags.clone(),
                external: spec.external,
                port_channel_id_min: spec.port_channel_id_min,
                port_channel_id_max: spec.port_channel_id_max,
            };
            let id = bp
                .create_generic_system(&request, &spec.links)
                .await
                .map_err(|e| e.context("create generic system", spec.blueprint_id.as_str(), spec.name.clone()))?;
            *created = Some(id.clone());
            info!(blueprint = %spec.blueprint_id, system = %id, links = spec.links.len(), "created generic system");

            let changes = 1 + self.apply_properties(bp, &id, spec, None, cancel).await?;

            let state = self
                .read_system(bp, &id, spec.clear_cts_on_destroy, None)
                .await?
                .ok_or_else(|| Error::not_found(format!("generic system {id} vanished after creation")))?;
            Ok((state, changes))
        })
        .await
    }

    async fn update_inner(
        &self,
        spec: &GenericSystemSpec,
        state: &GenericSystemState,
        cancel: &CancellationToken,
    ) -> Result<(GenericSystemState, usize, Vec<String>)> {
        spec.validate()?;
        if spec.requires_replace(state) {
            return Err(Error::validation(
                "external",
                "blueprint_id and external cannot change in place",
            ));
        }
        ensure_live(cancel)?;
        let bp = self.open(&spec.blueprint_id).await?;
        let bp = bp.as_ref();
        let bp_id = spec.blueprint_id.as_str();
        let id = &state.id;

        with_blueprint_lock(self.client.clone(), &spec.blueprint_id, self.locking, cancel, move || async move {
            let mut changes = 0;

            let hostname = spec.hostname.clone().unwrap_or_else(|| state.hostname.clone());
            let label = spec.name.clone().unwrap_or_else(|| state.name.clone());
            if hostname != state.hostname || label != state.name {
                ensure_live(cancel)?;
                bp.set_system_names(id, &hostname, &label)
                    .await
                    .map_err(|e| e.context("set hostname and label", bp_id, Some(id.to_string())))?;
                changes += 1;
            }

            changes += self.apply_properties(bp, id, spec, Some(state), cancel).await?;

            if spec.tags != state.tags {
                ensure_live(cancel)?;
                bp.set_node_tags(id, &spec.tags)
                    .await
                    .map_err(|e| e.context("set generic system tags", bp_id, Some(id.to_string())))?;
                changes += 1;
            }

            ensure_live(cancel)?;
            let observed = bp
                .list_links(id)
                .await
                .map_err(|e| e.context("list links", bp_id, Some(id.to_string())))?;
            let observed = normalize_links(observed, Some(&state.links));

            ensure_live(cancel)?;
            let lags = lags_of_system(bp, id)
                .await
                .map_err(|e| e.context("list LAGs", bp_id, Some(id.to_string())))?;

            let groups = resolve_groups(&spec.links, &observed, &lags);
            for change in &groups.moves {
                debug!(
                    system = %id,
                    link = %change.key,
                    from = change.from.as_deref().unwrap_or("-"),
                    to = change.to.as_deref().unwrap_or("-"),
                    "link changes LAG group"
                );
            }
            let plan = compute_plan("links", spec.links.clone(), observed)?;
            let operations = order_operations(&plan, &groups);
            debug!(system = %id, operations = operations.len(), "link operations planned");

            let report = ApplyExecutor::new(bp, id, cancel)
                .clear_templates_on_delete(spec.clear_cts_on_destroy)
                .execute(operations)
                .await;
            let warnings: Vec<String> = report.warnings().map(str::to_string).collect();
            changes += report.into_result()?.len();

            let new_state = self
                .read_system(bp, id, spec.clear_cts_on_destroy, Some(&state.links))
                .await?
                .ok_or_else(|| Error::not_found(format!("generic system {id}")))?;
            Ok((new_state, changes, warnings))
        })
        .await
    }

    async fn open(&self, blueprint_id: &ObjectId) -> Result<Arc<dyn BlueprintClient>> {
        self.client.blueprint(blueprint_id).await.map_err(|e| {
            if e.is_not_found() {
                Error::not_found(format!("blueprint {blueprint_id}"))
            } else {
                e.context("open blueprint", blueprint_id.as_str(), None)
            }
        })
    }

    /// Set ASN, loopbacks, port-channel range and deploy mode where they
    /// differ from `prior` (or from unset, for a new system)
    async fn apply_properties(
        &self,
        bp: &dyn BlueprintClient,
        id: &ObjectId,
        spec: &GenericSystemSpec,
        prior: Option<&GenericSystemState>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let bp_id = bp.blueprint_id().as_str();
        let object = Some(id.to_string());
        let mut changes = 0;

        if spec.asn != prior.and_then(|p| p.asn) {
            ensure_live(cancel)?;
            bp.set_system_asn(id, spec.asn)
                .await
                .map_err(|e| e.context("set ASN", bp_id, object.clone()))?;
            changes += 1;
        }

        let loopbacks_differ = spec.loopback_ipv4 != prior.and_then(|p| p.loopback_ipv4.clone())
            || spec.loopback_ipv6 != prior.and_then(|p| p.loopback_ipv6.clone());
        if loopbacks_differ {
            ensure_live(cancel)?;
            bp.set_system_loopbacks(id, spec.loopback_ipv4.as_deref(), spec.loopback_ipv6.as_deref())
                .await
                .map_err(|e| e.context("set loopbacks", bp_id, object.clone()))?;
            changes += 1;
        }

        if let Some(p) = prior
            && (p.port_channel_id_min, p.port_channel_id_max) != (spec.port_channel_id_min, spec.port_channel_id_max)
        {
            ensure_live(cancel)?;
            bp.set_port_channel_range(id, spec.port_channel_id_min, spec.port_channel_id_max)
                .await
                .map_err(|e| e.context("set port-channel range", bp_id, object.clone()))?;
            changes += 1;
        }

        if let Some(mode) = &spec.deploy_mode
            && prior.map(|p| p.deploy_mode.as_str()) != Some(mode.as_str())
        {
            ensure_live(cancel)?;
            bp.set_deploy_mode(id, mode)
                .await
                .map_err(|e| e.context("set deploy mode", bp_id, object.clone()))?;
            changes += 1;
        }

        Ok(changes)
    }

    async fn read_system(
        &self,
        bp: &dyn BlueprintClient,
        id: &ObjectId,
        clear_cts_on_destroy: bool,
        prior_links: Option<&[ObservedLink]>,
    ) -> Result<Option<GenericSystemState>> {
        let bp_id = bp.blueprint_id().as_str();
        let object = Some(id.to_string());

        let info = match bp.get_generic_system(id).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                warn!(blueprint = %bp_id, system = %id, "generic system not found; dropping from state");
                return Ok(None);
            }
            Err(e) => return Err(e.context("read generic system", bp_id, object)),
        };
        let tags = match bp.get_node_tags(id).await {
            Ok(tags) => tags,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.context("read generic system tags", bp_id, object)),
        };
        let links = match bp.list_links(id).await {
            Ok(links) => normalize_links(links, prior_links),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.context("list links", bp_id, object)),
        };

        Ok(Some(GenericSystemState {
            id: id.clone(),
            blueprint_id: bp.blueprint_id().clone(),
            name: info.label,
            hostname: info.hostname,
            tags,
            links,
            asn: info.asn,
            loopback_ipv4: info.loopback_ipv4,
            loopback_ipv6: info.loopback_ipv6,
            port_channel_id_min: info.port_channel_id_min,
            port_channel_id_max: info.port_channel_id_max,
            external: info.external,
            deploy_mode: info.deploy_mode,
            clear_cts_on_destroy,
        }))
    }
}

#[async_trait]
impl Resource for GenericSystemResource {
    type Spec = GenericSystemSpec;
    type State = GenericSystemState;

    const KIND: ResourceKind = ResourceKind::GenericSystem;

    fn requires_replace(spec: &Self::Spec, state: &Self::State) -> bool {
        spec.requires_replace(state)
    }

    /// Create the system with all of its links
    async fn create(&self, spec: &GenericSystemSpec, cancel: &CancellationToken) -> Outcome<GenericSystemState> {
        let mut created = None;
        match self.create_inner(spec, cancel, &mut created).await {
            Ok((state, changes)) => Outcome::applied(state, changes, Vec::new()),
            Err(e) => {
                if let Some(id) = &created {
                    warn!(blueprint = %spec.blueprint_id, system = %id, error = %e, "generic system created but not fully configured");
                }
                Outcome::failed(created.map(|id| GenericSystemState::provisional(id, spec)), e)
            }
        }
    }

    /// Re-read the system; `None` when it or its blueprint no longer exists
    async fn read(&self, state: &GenericSystemState, cancel: &CancellationToken) -> Result<Option<GenericSystemState>> {
        ensure_live(cancel)?;
        let bp = match self.client.blueprint(&state.blueprint_id).await {
            Ok(bp) => bp,
            Err(e) if e.is_not_found() => {
                warn!(blueprint = %state.blueprint_id, "blueprint not found; dropping generic system from state");
                return Ok(None);
            }
            Err(e) => return Err(e.context("open blueprint", state.blueprint_id.as_str(), None)),
        };
        self.read_system(bp.as_ref(), &state.id, state.clear_cts_on_destroy, Some(&state.links))
            .await
    }

    /// Bring the system from `state` to `spec`
    async fn update(
        &self,
        spec: &GenericSystemSpec,
        state: &GenericSystemState,
        cancel: &CancellationToken,
    ) -> Outcome<GenericSystemState> {
        match self.update_inner(spec, state, cancel).await {
            Ok((new_state, changes, warnings)) => Outcome::applied(new_state, changes, warnings),
            Err(e) => Outcome::failed(None, e),
        }
    }

    /// Delete the system; absence is success
    async fn delete(&self, state: &GenericSystemState, cancel: &CancellationToken) -> Result<()> {
        ensure_live(cancel)?;
        let bp = match self.client.blueprint(&state.blueprint_id).await {
            Ok(bp) => bp,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.context("open blueprint", state.blueprint_id.as_str(), None)),
        };
        let bp = bp.as_ref();
        let bp_id = state.blueprint_id.as_str();
        let id = &state.id;

        with_blueprint_lock(self.client.clone(), &state.blueprint_id, self.locking, cancel, move || async move {
            ensure_live(cancel)?;
            let link_ids = match bp.delete_generic_system(id).await {
                Ok(()) => {
                    info!(blueprint = %bp_id, system = %id, "deleted generic system");
                    return Ok(());
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(Error::TemplatesAssigned { link_ids }) if state.clear_cts_on_destroy => link_ids,
                Err(e) => return Err(e.context("delete generic system", bp_id, Some(id.to_string()))),
            };

            info!(system = %id, links = link_ids.len(), "clearing connectivity templates before deleting generic system");
            let link_ids: Vec<ObjectId> = link_ids.into_iter().map(ObjectId::new).collect();
            clear_link_templates(bp, &link_ids).await?;

            ensure_live(cancel)?;
            match bp.delete_generic_system(id).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e.context("delete generic system", bp_id, Some(id.to_string()))),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryFabric;
    use crate::model::LagMode;

    fn setup() -> (MemoryFabric, GenericSystemResource) {
        let fabric = MemoryFabric::new();
        fabric.add_blueprint("bp");
        fabric.add_switch("bp", "leaf1", &["xe-0/0/1", "xe-0/0/2", "xe-0/0/3"]);
        fabric.add_switch("bp", "leaf2", &["xe-0/0/1"]);
        let resource = GenericSystemResource::new(Arc::new(fabric.clone()), true);
        (fabric, resource)
    }

    fn spec(links: Vec<DesiredLink>) -> GenericSystemSpec {
        let mut spec = GenericSystemSpec::new("bp", links);
        spec.name = Some("web01".into());
        spec.hostname = Some("web01.example.com".into());
        spec
    }

    #[test]
    fn loopbacks_must_be_cidrs_of_their_family() {
        let mut s = spec(vec![DesiredLink::new("leaf1", "xe-0/0/1")]);

        for bad in ["10.0.0.1/33", "10.0.0.256/32", "10.0.0.1/", "fd00::1/64"] {
            s.loopback_ipv4 = Some(bad.into());
            let err = s.validate().unwrap_err();
            assert!(err.is_validation(), "{bad}: {err}");
            assert!(err.to_string().contains("loopback_ipv4"), "{bad}: {err}");
        }
        s.loopback_ipv4 = Some("192.0.2.10/31".into());
        s.validate().unwrap();

        for bad in ["fd00::1/129", "fd00::zz/64", "fd00::1"] {
            s.loopback_ipv6 = Some(bad.into());
            assert!(s.validate().is_err(), "{bad}");
        }
        s.loopback_ipv6 = Some("2001:db8::1/64".into());
        s.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_input() {
        assert!(spec(Vec::new()).validate().is_err());

        let mut s = spec(vec![DesiredLink::new("leaf1", "xe-0/0/1")]);
        s.validate().unwrap();

        s.loopback_ipv4 = Some("10.0.0.1".into());
        assert!(s.validate().is_err());
        s.loopback_ipv4 = Some("10.0.0.1/32".into());
        s.loopback_ipv6 = Some("10.0.0.1/128".into());
        assert!(s.validate().is_err());
        s.loopback_ipv6 = Some("fd00::1/128".into());
        s.validate().unwrap();

        s.port_channel_id_min = 10;
        assert!(s.validate().is_err());
        s.port_channel_id_max = 5;
        assert!(s.validate().is_err());
        s.port_channel_id_max = 20;
        s.validate().unwrap();

        s.deploy_mode = Some("on".into());
        assert!(s.validate().is_err());
    }

    #[tokio::test]
    async fn create_then_read_round_trip() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let mut s = spec(vec![
            DesiredLink::new("leaf1", "xe-0/0/1").with_group("bond0", LagMode::LacpActive),
            DesiredLink::new("leaf2", "xe-0/0/1").with_group("bond0", LagMode::LacpActive),
        ]);
        s.asn = Some(65001);
        s.deploy_mode = Some("ready".into());

        let state = resource.create(&s, &cancel).await.into_result().unwrap();
        assert_eq!(state.name, "web01");
        assert_eq!(state.asn, Some(65001));
        assert_eq!(state.deploy_mode, "ready");
        assert_eq!(state.links.len(), 2);
        assert!(!fabric.is_locked("bp"));

        let read = resource.read(&state, &cancel).await.unwrap().unwrap();
        assert_eq!(read, state);
    }

    #[tokio::test]
    async fn invalid_spec_makes_no_remote_calls() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let s = spec(vec![DesiredLink::new("leaf1", "xe-0/0/1"), DesiredLink::new("leaf1", "xe-0/0/1")]);

        let outcome = resource.create(&s, &cancel).await;
        assert!(outcome.state.is_none());
        assert!(outcome.error.unwrap().is_validation());
        assert!(fabric.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_property_keeps_provisional_state() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let mut s = spec(vec![DesiredLink::new("leaf1", "xe-0/0/1")]);
        s.asn = Some(65001);
        fabric.fail_next("set_system_asn", "ASN pool exhausted");

        let outcome = resource.create(&s, &cancel).await;
        assert!(outcome.error.is_some());
        let provisional = outcome.state.unwrap();
        assert!(!provisional.id.is_empty());
        assert!(!fabric.is_locked("bp"));
    }

    #[tokio::test]
    async fn update_moves_links_between_groups() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let s = spec(vec![
            DesiredLink::new("leaf1", "xe-0/0/1").with_group("a", LagMode::LacpActive),
            DesiredLink::new("leaf1", "xe-0/0/2").with_group("a", LagMode::LacpActive),
        ]);
        let state = resource.create(&s, &cancel).await.into_result().unwrap();
        let before: Vec<ObjectId> = state.links.iter().map(|l| l.id.clone()).collect();

        let s2 = spec(vec![
            DesiredLink::new("leaf1", "xe-0/0/1").with_group("b", LagMode::Static),
            DesiredLink::new("leaf1", "xe-0/0/2").with_group("b", LagMode::Static),
        ]);
        let outcome = resource.update(&s2, &state, &cancel).await;
        assert!(outcome.is_ok(), "{:?}", outcome.error);
        let changes = outcome.changes;
        let updated = outcome.into_result().unwrap();

        let after: Vec<ObjectId> = updated.links.iter().map(|l| l.id.clone()).collect();
        assert_eq!(before, after);
        assert_eq!(changes, 4);
        assert_eq!(fabric.lag_labels("bp", state.id.as_str()), vec!["b"]);
    }

    #[tokio::test]
    async fn retry_after_failed_member_create_converges() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let state = resource
            .create(&spec(vec![DesiredLink::new("leaf1", "xe-0/0/2")]), &cancel)
            .await
            .into_result()
            .unwrap();

        let grown = spec(vec![
            DesiredLink::new("leaf1", "xe-0/0/1").with_group("bond0", LagMode::LacpActive),
            DesiredLink::new("leaf1", "xe-0/0/2"),
        ]);
        fabric.fail_next("create_link", "port is administratively locked");
        let outcome = resource.update(&grown, &state, &cancel).await;
        assert!(
            matches!(outcome.error, Some(Error::PartialApply { succeeded: 1, .. })),
            "{:?}",
            outcome.error
        );
        assert_eq!(fabric.lag_labels("bp", state.id.as_str()), vec!["bond0"]);
        assert!(!fabric.is_locked("bp"));

        let state = resource.read(&state, &cancel).await.unwrap().unwrap();
        fabric.clear_calls();
        let outcome = resource.update(&grown, &state, &cancel).await;
        assert!(outcome.is_ok(), "{:?}", outcome.error);

        let calls = fabric.calls();
        assert!(!calls.iter().any(|c| c.starts_with("create_lag")), "{calls:?}");
        assert!(calls.contains(&"create_link leaf1:xe-0/0/1".to_string()), "{calls:?}");
        let state = outcome.into_result().unwrap();
        assert_eq!(state.links.len(), 2);
    }

    #[tokio::test]
    async fn memberless_aggregate_is_removed_on_update() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let s = spec(vec![DesiredLink::new("leaf1", "xe-0/0/1")]);
        let state = resource.create(&s, &cancel).await.into_result().unwrap();

        let bp = fabric.blueprint(&ObjectId::new("bp")).await.unwrap();
        bp.create_lag(&state.id, "orphan", LagMode::Static).await.unwrap();
        assert_eq!(fabric.lag_labels("bp", state.id.as_str()), vec!["orphan"]);

        let outcome = resource.update(&s, &state, &cancel).await;
        assert!(outcome.is_ok(), "{:?}", outcome.error);
        assert_eq!(outcome.changes, 1);
        assert!(fabric.lag_labels("bp", state.id.as_str()).is_empty());
    }

    #[tokio::test]
    async fn unchanged_spec_issues_no_mutations() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let mut s = spec(vec![DesiredLink::new("leaf1", "xe-0/0/1").with_tags(["prod"])]);
        s.tags = ["web".to_string()].into();
        let state = resource.create(&s, &cancel).await.into_result().unwrap();
        fabric.clear_calls();

        let outcome = resource.update(&s, &state, &cancel).await;
        assert_eq!(outcome.changes, 0);
        assert_eq!(fabric.calls(), vec!["lock bp", "unlock bp"]);
    }

    #[tokio::test]
    async fn read_drops_vanished_system() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let state = resource
            .create(&spec(vec![DesiredLink::new("leaf1", "xe-0/0/1")]), &cancel)
            .await
            .into_result()
            .unwrap();

        fabric.remove_system("bp", state.id.as_str());
        assert!(resource.read(&state, &cancel).await.unwrap().is_none());

        fabric.remove_blueprint("bp");
        assert!(resource.read(&state, &cancel).await.unwrap().is_none());
    }

    #[test]
    fn read_keeps_unset_group_label_unset() {
        let observed = vec![ObservedLink {
            id: ObjectId::new("l1"),
            key: LinkKey::new("leaf1", "xe-0/0/1"),
            transform_id: Some(1),
            group_label: Some("auto-1".into()),
            lag_mode: None,
            tags: BTreeSet::new(),
            interface_id: None,
            lag_id: None,
            port_channel_id: None,
        }];
        let mut prior = observed.clone();
        prior[0].group_label = None;

        let normalized = normalize_links(observed.clone(), Some(&prior));
        assert_eq!(normalized[0].group_label, None);
        assert_eq!(normalize_links(observed, None)[0].group_label.as_deref(), Some("auto-1"));
    }

    #[tokio::test]
    async fn delete_clears_templates_when_asked() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let mut s = spec(vec![DesiredLink::new("leaf1", "xe-0/0/1")]);
        let state = resource.create(&s, &cancel).await.into_result().unwrap();
        let ap = state.links[0].interface_id.clone().unwrap();
        fabric.assign_template("bp", ap.as_str(), "ct-1");

        let err = resource.delete(&state, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::TemplatesAssigned { .. }));
        assert!(!fabric.is_locked("bp"));

        s.clear_cts_on_destroy = true;
        let state = resource.update(&s, &state, &cancel).await.into_result().unwrap();
        assert!(state.clear_cts_on_destroy);
        resource.delete(&state, &cancel).await.unwrap();
        assert_eq!(fabric.system_count("bp"), 0);

        resource.delete(&state, &cancel).await.unwrap();
    }
}
