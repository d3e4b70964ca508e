// # Memory Fabric
//
// In-memory implementation of FabricClient and BlueprintClient.
//
// ## Purpose
//
// Models the parts of a controller blueprint this crate manages: fabric
// switches and their ports, generic systems, links, LAG aggregates, tags
// and connectivity-template assignments. It enforces the same constraints
// the controller does, so ordering mistakes show up as errors:
//
// - a link needs a free switch port
// - a LAG member needs its aggregate to exist
// - an aggregate with members cannot be deleted
// - a link with templates on its switch port cannot be deleted
//
// Graph queries are answered by building a `query::Graph` from the current
// data on every call.
//
// ## Test Hooks
//
// - `calls()` lists successful mutations and lock operations in order
// - `fail_next(op, msg)` makes the next call of `op` fail
// - `lock_transform`, `assign_template`, `remove_system` change state out
//   of band

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{ClientConfig, MemorySeed};
use crate::error::{Error, Result};
use crate::model::{DesiredLink, LagMode, LinkKey, ObjectId, ObservedLink};
use crate::query::{Graph, PathQuery};
use crate::traits::{BlueprintClient, FabricClient, FabricClientFactory, LinkParams, SystemInfo, SystemRequest};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory fabric controller
///
/// Cloning is cheap; clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryFabric {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<FabricState>,
    unlocked: Notify,
    lock_timeout: Duration,
}

#[derive(Debug, Default)]
struct FabricState {
    blueprints: BTreeMap<ObjectId, BlueprintData>,
    locked: BTreeSet<ObjectId>,
    calls: Vec<String>,
    failures: BTreeMap<String, String>,
    next_id: u64,
}

#[derive(Debug, Default)]
struct BlueprintData {
    switches: BTreeMap<ObjectId, BTreeMap<String, SwitchPort>>,
    systems: BTreeMap<ObjectId, SystemInfo>,
    links: BTreeMap<ObjectId, LinkRecord>,
    lags: BTreeMap<ObjectId, LagRecord>,
    templates: BTreeMap<ObjectId, BTreeSet<ObjectId>>,
    tags: BTreeMap<ObjectId, BTreeSet<String>>,
}

#[derive(Debug, Clone)]
struct SwitchPort {
    interface_id: ObjectId,
    transform_id: u32,
    transform_locked: bool,
}

#[derive(Debug, Clone)]
struct LinkRecord {
    system_id: ObjectId,
    key: LinkKey,
    system_if_id: ObjectId,
    group_label: Option<String>,
    lag_mode: Option<LagMode>,
}

impl LinkRecord {
    fn lag_group(&self) -> Option<&str> {
        match (&self.group_label, self.lag_mode) {
            (Some(label), Some(_)) => Some(label),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct LagRecord {
    system_id: ObjectId,
    label: String,
    port_channel_id: u32,
    system_if_id: ObjectId,
}

fn next_id(counter: &mut u64, prefix: &str) -> ObjectId {
    *counter += 1;
    ObjectId::new(format!("{prefix}-{counter}"))
}

impl BlueprintData {
    fn port(&self, key: &LinkKey) -> Option<&SwitchPort> {
        self.switches.get(&key.switch_id)?.get(&key.if_name)
    }

    fn port_by_interface(&self, interface_id: &ObjectId) -> Option<&SwitchPort> {
        self.switches
            .values()
            .flat_map(|ports| ports.values())
            .find(|p| &p.interface_id == interface_id)
    }

    fn lag_for(&self, system_id: &ObjectId, label: &str) -> Option<(&ObjectId, &LagRecord)> {
        self.lags
            .iter()
            .find(|(_, lag)| &lag.system_id == system_id && lag.label == label)
    }

    fn has_templates(&self, link: &LinkRecord) -> bool {
        self.port(&link.key)
            .and_then(|p| self.templates.get(&p.interface_id))
            .is_some_and(|cts| !cts.is_empty())
    }

    fn is_application_point(&self, id: &ObjectId) -> bool {
        self.port_by_interface(id).is_some()
            || self.systems.contains_key(id)
            || self.links.values().any(|l| &l.system_if_id == id)
            || self.lags.values().any(|l| &l.system_if_id == id)
    }

    fn check_link_slot(&self, system_id: &ObjectId, link: &DesiredLink) -> Result<()> {
        let object = Some(link.key.to_string());
        if self.port(&link.key).is_none() {
            return Err(Error::remote("create link", "", object, "switch interface does not exist"));
        }
        if self.links.values().any(|l| l.key == link.key) {
            return Err(Error::remote("create link", "", object, "switch interface already in use"));
        }
        if let Some(label) = link.lag_group()
            && self.lag_for(system_id, label).is_none()
        {
            return Err(Error::remote(
                "create link",
                "",
                object,
                format!("LAG group {label:?} does not exist"),
            ));
        }
        Ok(())
    }

    fn insert_link(&mut self, counter: &mut u64, system_id: &ObjectId, link: &DesiredLink) -> ObjectId {
        let id = next_id(counter, "link");
        let system_if_id = next_id(counter, "if");
        if let Some(transform_id) = link.transform_id
            && let Some(port) = self
                .switches
                .get_mut(&link.key.switch_id)
                .and_then(|ports| ports.get_mut(&link.key.if_name))
            && !port.transform_locked
        {
            port.transform_id = transform_id;
        }
        self.links.insert(
            id.clone(),
            LinkRecord {
                system_id: system_id.clone(),
                key: link.key.clone(),
                system_if_id,
                group_label: link.group_label.clone(),
                lag_mode: link.lag_mode,
            },
        );
        if !link.tags.is_empty() {
            self.tags.insert(id.clone(), link.tags.clone());
        }
        id
    }

    fn insert_lag(&mut self, counter: &mut u64, system_id: &ObjectId, label: &str) -> Result<ObjectId> {
        let Some(system) = self.systems.get(system_id) else {
            return Err(Error::not_found(format!("generic system {system_id}")));
        };
        if self.lag_for(system_id, label).is_some() {
            return Err(Error::remote(
                "create LAG",
                "",
                Some(label.to_string()),
                "a LAG with this label already exists",
            ));
        }

        let used: BTreeSet<u32> = self
            .lags
            .values()
            .filter(|l| &l.system_id == system_id)
            .map(|l| l.port_channel_id)
            .collect();
        let min = system.port_channel_id_min.max(1);
        let max = if system.port_channel_id_max == 0 {
            4096
        } else {
            system.port_channel_id_max
        };
        let port_channel_id = (min..=max).find(|n| !used.contains(n)).ok_or_else(|| {
            Error::remote(
                "create LAG",
                "",
                Some(label.to_string()),
                "port-channel range exhausted",
            )
        })?;

        let id = next_id(counter, "lag");
        let system_if_id = next_id(counter, "if");
        self.lags.insert(
            id.clone(),
            LagRecord {
                system_id: system_id.clone(),
                label: label.to_string(),
                port_channel_id,
                system_if_id,
            },
        );
        Ok(id)
    }

    fn observed_link(&self, id: &ObjectId, link: &LinkRecord) -> ObservedLink {
        let port = self.port(&link.key);
        let lag = link
            .lag_group()
            .and_then(|label| self.lag_for(&link.system_id, label));
        ObservedLink {
            id: id.clone(),
            key: link.key.clone(),
            transform_id: port.map(|p| p.transform_id),
            group_label: link.group_label.clone(),
            lag_mode: link.lag_mode,
            tags: self.tags.get(id).cloned().unwrap_or_default(),
            interface_id: port.map(|p| p.interface_id.clone()),
            lag_id: lag.map(|(lag_id, _)| lag_id.clone()),
            port_channel_id: lag.map(|(_, l)| l.port_channel_id),
        }
    }

    fn graph(&self) -> Graph {
        let mut g = Graph::new();

        for (switch_id, ports) in &self.switches {
            g.add_node(switch_id.as_str(), "system", [("system_type", "switch")]);
            for (name, port) in ports {
                g.add_node(
                    port.interface_id.as_str(),
                    "interface",
                    [("if_name", name.as_str()), ("if_type", "ethernet")],
                );
                g.add_edge("hosted_interfaces", switch_id.as_str(), port.interface_id.as_str());
            }
        }

        for (id, system) in &self.systems {
            g.add_node(
                id.as_str(),
                "system",
                [
                    ("system_type", "server"),
                    ("label", system.label.as_str()),
                    ("hostname", system.hostname.as_str()),
                ],
            );
        }

        for (id, link) in &self.links {
            g.add_node(link.system_if_id.as_str(), "interface", [("if_type", "ethernet")]);
            g.add_edge("hosted_interfaces", link.system_id.as_str(), link.system_if_id.as_str());

            let mut attrs = vec![("link_type", "ethernet")];
            if let Some(label) = &link.group_label {
                attrs.push(("group_label", label.as_str()));
            }
            g.add_node(id.as_str(), "link", attrs);
            g.add_edge("link", link.system_if_id.as_str(), id.as_str());
            if let Some(port) = self.port(&link.key) {
                g.add_edge("link", port.interface_id.as_str(), id.as_str());
            }
        }

        for (id, lag) in &self.lags {
            g.add_node(lag.system_if_id.as_str(), "interface", [("if_type", "port_channel")]);
            g.add_edge("hosted_interfaces", lag.system_id.as_str(), lag.system_if_id.as_str());
            g.add_node(
                id.as_str(),
                "link",
                [("link_type", "aggregate_link"), ("group_label", lag.label.as_str())],
            );
            g.add_edge("link", lag.system_if_id.as_str(), id.as_str());
        }

        g
    }
}

impl MemoryFabric {
    /// Empty fabric with no blueprints
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Empty fabric whose blueprint mutex waits at most `timeout`
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FabricState::default()),
                unlocked: Notify::new(),
                lock_timeout: timeout,
            }),
        }
    }

    /// Fabric pre-populated with blueprints and switch ports
    pub fn seeded(seeds: &[MemorySeed]) -> Self {
        let fabric = Self::new();
        for seed in seeds {
            fabric.add_blueprint(&seed.id);
            for (switch, ports) in &seed.switches {
                let ports: Vec<&str> = ports.iter().map(String::as_str).collect();
                fabric.add_switch(&seed.id, switch, &ports);
            }
        }
        fabric
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an empty blueprint
    pub fn add_blueprint(&self, blueprint_id: &str) {
        self.state()
            .blueprints
            .entry(ObjectId::new(blueprint_id))
            .or_default();
    }

    /// Remove a blueprint and everything in it
    pub fn remove_blueprint(&self, blueprint_id: &str) {
        self.state().blueprints.remove(&ObjectId::new(blueprint_id));
    }

    /// Add a fabric switch with the given ports (transform 1 on each)
    pub fn add_switch(&self, blueprint_id: &str, switch_id: &str, ports: &[&str]) {
        let mut state = self.state();
        let FabricState {
            blueprints, next_id: counter, ..
        } = &mut *state;
        let bp = blueprints.entry(ObjectId::new(blueprint_id)).or_default();
        let entry = bp.switches.entry(ObjectId::new(switch_id)).or_default();
        for name in ports {
            entry.entry(name.to_string()).or_insert_with(|| SwitchPort {
                interface_id: next_id(counter, "if"),
                transform_id: 1,
                transform_locked: false,
            });
        }
    }

    /// Make the controller refuse transform changes on a port
    pub fn lock_transform(&self, blueprint_id: &str, switch_id: &str, if_name: &str) {
        let mut state = self.state();
        if let Some(port) = state
            .blueprints
            .get_mut(&ObjectId::new(blueprint_id))
            .and_then(|bp| bp.switches.get_mut(&ObjectId::new(switch_id)))
            .and_then(|ports| ports.get_mut(if_name))
        {
            port.transform_locked = true;
        }
    }

    /// Attach a connectivity template out of band
    pub fn assign_template(&self, blueprint_id: &str, application_point_id: &str, template_id: &str) {
        let mut state = self.state();
        if let Some(bp) = state.blueprints.get_mut(&ObjectId::new(blueprint_id)) {
            bp.templates
                .entry(ObjectId::new(application_point_id))
                .or_default()
                .insert(ObjectId::new(template_id));
        }
    }

    /// Delete a generic system out of band, links and aggregates included
    pub fn remove_system(&self, blueprint_id: &str, system_id: &str) {
        let mut state = self.state();
        if let Some(bp) = state.blueprints.get_mut(&ObjectId::new(blueprint_id)) {
            let system_id = ObjectId::new(system_id);
            bp.systems.remove(&system_id);
            bp.links.retain(|_, l| l.system_id != system_id);
            bp.lags.retain(|_, l| l.system_id != system_id);
        }
    }

    /// Number of generic systems in a blueprint
    pub fn system_count(&self, blueprint_id: &str) -> usize {
        self.state()
            .blueprints
            .get(&ObjectId::new(blueprint_id))
            .map_or(0, |bp| bp.systems.len())
    }

    /// Labels of the aggregates that exist for a generic system
    pub fn lag_labels(&self, blueprint_id: &str, system_id: &str) -> Vec<String> {
        let system_id = ObjectId::new(system_id);
        self.state()
            .blueprints
            .get(&ObjectId::new(blueprint_id))
            .map(|bp| {
                bp.lags
                    .values()
                    .filter(|l| l.system_id == system_id)
                    .map(|l| l.label.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Make the next call named `operation` fail with `message`
    pub fn fail_next(&self, operation: &str, message: &str) {
        self.state()
            .failures
            .insert(operation.to_string(), message.to_string());
    }

    /// Successful mutations and lock operations, oldest first
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Whether a blueprint mutex is held
    pub fn is_locked(&self, blueprint_id: &str) -> bool {
        self.state().locked.contains(&ObjectId::new(blueprint_id))
    }
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FabricClient for MemoryFabric {
    async fn blueprint(&self, blueprint_id: &ObjectId) -> Result<Arc<dyn BlueprintClient>> {
        if !self.state().blueprints.contains_key(blueprint_id) {
            return Err(Error::not_found(format!("blueprint {blueprint_id}")));
        }
        Ok(Arc::new(MemoryBlueprint {
            fabric: self.clone(),
            id: blueprint_id.clone(),
        }))
    }

    async fn lock_blueprint(&self, blueprint_id: &ObjectId, cancel: &CancellationToken) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.inner.lock_timeout;
        loop {
            let notified = self.inner.unlocked.notified();
            {
                let mut state = self.state();
                if let Some(msg) = state.failures.remove("lock") {
                    return Err(Error::lock(blueprint_id.as_str(), msg));
                }
                if state.locked.insert(blueprint_id.clone()) {
                    state.calls.push(format!("lock {blueprint_id}"));
                    return Ok(());
                }
            }
            trace!(blueprint = %blueprint_id, "waiting for blueprint mutex");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                waited = tokio::time::timeout_at(deadline, notified) => {
                    if waited.is_err() {
                        return Err(Error::lock(
                            blueprint_id.as_str(),
                            format!("timed out after {:?}", self.inner.lock_timeout),
                        ));
                    }
                }
            }
        }
    }

    async fn unlock_blueprint(&self, blueprint_id: &ObjectId) -> Result<()> {
        {
            let mut state = self.state();
            if state.locked.remove(blueprint_id) {
                state.calls.push(format!("unlock {blueprint_id}"));
            }
        }
        self.inner.unlocked.notify_waiters();
        Ok(())
    }

    fn client_name(&self) -> &'static str {
        "memory"
    }
}

/// Blueprint-scoped view of a [`MemoryFabric`]
#[derive(Debug)]
struct MemoryBlueprint {
    fabric: MemoryFabric,
    id: ObjectId,
}

impl MemoryBlueprint {
    fn read<T>(&self, operation: &str, f: impl FnOnce(&BlueprintData) -> Result<T>) -> Result<T> {
        let mut state = self.fabric.state();
        if let Some(msg) = state.failures.remove(operation) {
            return Err(Error::remote(operation, self.id.as_str(), None, msg));
        }
        let bp = state
            .blueprints
            .get(&self.id)
            .ok_or_else(|| Error::not_found(format!("blueprint {}", self.id)))?;
        f(bp)
    }

    fn mutate<T>(
        &self,
        operation: &str,
        object: &str,
        f: impl FnOnce(&mut BlueprintData, &mut u64) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.fabric.state();
        if let Some(msg) = state.failures.remove(operation) {
            return Err(Error::remote(operation, self.id.as_str(), Some(object.to_string()), msg));
        }
        let FabricState {
            blueprints,
            next_id: counter,
            calls,
            ..
        } = &mut *state;
        let bp = blueprints
            .get_mut(&self.id)
            .ok_or_else(|| Error::not_found(format!("blueprint {}", self.id)))?;
        let value = f(bp, counter).map_err(|e| match e {
            Error::Remote {
                operation,
                object,
                message,
                ..
            } => Error::remote(operation, self.id.as_str(), object, message),
            other => other,
        })?;
        debug!(blueprint = %self.id, operation, object, "memory fabric mutation");
        calls.push(format!("{operation} {object}"));
        Ok(value)
    }

    fn system_mut<'a>(bp: &'a mut BlueprintData, id: &ObjectId) -> Result<&'a mut SystemInfo> {
        bp.systems
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("generic system {id}")))
    }
}

#[async_trait]
impl BlueprintClient for MemoryBlueprint {
    fn blueprint_id(&self) -> &ObjectId {
        &self.id
    }

    async fn create_generic_system(&self, system: &SystemRequest, links: &[DesiredLink]) -> Result<ObjectId> {
        let label = system.label.clone().unwrap_or_default();
        self.mutate("create_generic_system", &label, |bp, counter| {
            let id = next_id(counter, "gs");
            let info = SystemInfo {
                id: id.clone(),
                hostname: system.hostname.clone().unwrap_or_else(|| id.to_string()),
                label: system.label.clone().unwrap_or_else(|| id.to_string()),
                external: system.external,
                asn: None,
                loopback_ipv4: None,
                loopback_ipv6: None,
                port_channel_id_min: system.port_channel_id_min,
                port_channel_id_max: system.port_channel_id_max,
                deploy_mode: "deploy".to_string(),
            };

            // Everything is validated before anything is inserted.
            let mut staged = BlueprintData {
                switches: bp.switches.clone(),
                links: bp.links.clone(),
                ..BlueprintData::default()
            };
            staged.systems.insert(id.clone(), info.clone());
            let mut scratch = *counter;
            let mut labels = BTreeSet::new();
            for link in links {
                if let Some(label) = link.lag_group()
                    && labels.insert(label)
                {
                    staged.insert_lag(&mut scratch, &id, label)?;
                }
                staged.check_link_slot(&id, link)?;
                staged.insert_link(&mut scratch, &id, link);
            }

            bp.systems.insert(id.clone(), info);
            if !system.tags.is_empty() {
                bp.tags.insert(id.clone(), system.tags.clone());
            }
            let mut created = BTreeSet::new();
            for link in links {
                if let Some(label) = link.lag_group()
                    && created.insert(label)
                {
                    bp.insert_lag(counter, &id, label)?;
                }
                bp.insert_link(counter, &id, link);
            }
            Ok(id)
        })
    }

    async fn get_generic_system(&self, system_id: &ObjectId) -> Result<SystemInfo> {
        self.read("get_generic_system", |bp| {
            bp.systems
                .get(system_id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("generic system {system_id}")))
        })
    }

    async fn set_system_names(&self, system_id: &ObjectId, hostname: &str, label: &str) -> Result<()> {
        self.mutate("set_system_names", system_id.as_str(), |bp, _| {
            let system = Self::system_mut(bp, system_id)?;
            system.hostname = hostname.to_string();
            system.label = label.to_string();
            Ok(())
        })
    }

    async fn set_system_asn(&self, system_id: &ObjectId, asn: Option<u32>) -> Result<()> {
        self.mutate("set_system_asn", system_id.as_str(), |bp, _| {
            Self::system_mut(bp, system_id)?.asn = asn;
            Ok(())
        })
    }

    async fn set_system_loopbacks(
        &self,
        system_id: &ObjectId,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
    ) -> Result<()> {
        self.mutate("set_system_loopbacks", system_id.as_str(), |bp, _| {
            let system = Self::system_mut(bp, system_id)?;
            system.loopback_ipv4 = ipv4.map(str::to_string);
            system.loopback_ipv6 = ipv6.map(str::to_string);
            Ok(())
        })
    }

    async fn set_port_channel_range(&self, system_id: &ObjectId, min: u32, max: u32) -> Result<()> {
        self.mutate("set_port_channel_range", system_id.as_str(), |bp, _| {
            let in_use = bp
                .lags
                .values()
                .filter(|l| &l.system_id == system_id)
                .any(|l| (min > 0 && l.port_channel_id < min) || (max > 0 && l.port_channel_id > max));
            if in_use {
                return Err(Error::remote(
                    "set port-channel range",
                    "",
                    Some(system_id.to_string()),
                    "existing port-channel numbers fall outside the new range",
                ));
            }
            let system = Self::system_mut(bp, system_id)?;
            system.port_channel_id_min = min;
            system.port_channel_id_max = max;
            Ok(())
        })
    }

    async fn set_deploy_mode(&self, system_id: &ObjectId, mode: &str) -> Result<()> {
        self.mutate("set_deploy_mode", system_id.as_str(), |bp, _| {
            Self::system_mut(bp, system_id)?.deploy_mode = mode.to_string();
            Ok(())
        })
    }

    async fn get_node_tags(&self, node_id: &ObjectId) -> Result<BTreeSet<String>> {
        self.read("get_node_tags", |bp| {
            if !bp.systems.contains_key(node_id) && !bp.links.contains_key(node_id) {
                return Err(Error::not_found(format!("node {node_id}")));
            }
            Ok(bp.tags.get(node_id).cloned().unwrap_or_default())
        })
    }

    async fn set_node_tags(&self, node_id: &ObjectId, tags: &BTreeSet<String>) -> Result<()> {
        self.mutate("set_node_tags", node_id.as_str(), |bp, _| {
            if !bp.systems.contains_key(node_id) && !bp.links.contains_key(node_id) {
                return Err(Error::not_found(format!("node {node_id}")));
            }
            if tags.is_empty() {
                bp.tags.remove(node_id);
            } else {
                bp.tags.insert(node_id.clone(), tags.clone());
            }
            Ok(())
        })
    }

    async fn delete_generic_system(&self, system_id: &ObjectId) -> Result<()> {
        self.mutate("delete_generic_system", system_id.as_str(), |bp, _| {
            if !bp.systems.contains_key(system_id) {
                return Err(Error::not_found(format!("generic system {system_id}")));
            }
            let blocked: Vec<String> = bp
                .links
                .iter()
                .filter(|(_, l)| &l.system_id == system_id && bp.has_templates(l))
                .map(|(id, _)| id.to_string())
                .collect();
            if !blocked.is_empty() {
                return Err(Error::TemplatesAssigned { link_ids: blocked });
            }

            let link_ids: Vec<ObjectId> = bp
                .links
                .iter()
                .filter(|(_, l)| &l.system_id == system_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &link_ids {
                bp.links.remove(id);
                bp.tags.remove(id);
            }
            bp.lags.retain(|_, l| &l.system_id != system_id);
            bp.tags.remove(system_id);
            bp.systems.remove(system_id);
            Ok(())
        })
    }

    async fn list_links(&self, system_id: &ObjectId) -> Result<Vec<ObservedLink>> {
        self.read("list_links", |bp| {
            if !bp.systems.contains_key(system_id) {
                return Err(Error::not_found(format!("generic system {system_id}")));
            }
            Ok(bp
                .links
                .iter()
                .filter(|(_, l)| &l.system_id == system_id)
                .map(|(id, l)| bp.observed_link(id, l))
                .collect())
        })
    }

    async fn create_link(&self, system_id: &ObjectId, link: &DesiredLink) -> Result<ObjectId> {
        self.mutate("create_link", &link.key.to_string(), |bp, counter| {
            if !bp.systems.contains_key(system_id) {
                return Err(Error::not_found(format!("generic system {system_id}")));
            }
            bp.check_link_slot(system_id, link)?;
            Ok(bp.insert_link(counter, system_id, link))
        })
    }

    async fn update_link(&self, link_id: &ObjectId, params: &LinkParams) -> Result<()> {
        self.mutate("update_link", link_id.as_str(), |bp, _| {
            let Some(system_id) = bp.links.get(link_id).map(|l| l.system_id.clone()) else {
                return Err(Error::not_found(format!("link {link_id}")));
            };
            if let (Some(label), Some(_)) = (&params.group_label, params.lag_mode)
                && bp.lag_for(&system_id, label).is_none()
            {
                return Err(Error::remote(
                    "update link",
                    "",
                    Some(link_id.to_string()),
                    format!("LAG group {label:?} does not exist"),
                ));
            }
            if let Some(link) = bp.links.get_mut(link_id) {
                link.group_label = params.group_label.clone();
                link.lag_mode = params.lag_mode;
            }
            if params.tags.is_empty() {
                bp.tags.remove(link_id);
            } else {
                bp.tags.insert(link_id.clone(), params.tags.clone());
            }
            Ok(())
        })
    }

    async fn set_transform(&self, key: &LinkKey, transform_id: u32) -> Result<()> {
        self.mutate("set_transform", &key.to_string(), |bp, _| {
            let port = bp
                .switches
                .get_mut(&key.switch_id)
                .and_then(|ports| ports.get_mut(&key.if_name))
                .ok_or_else(|| Error::not_found(format!("switch interface {key}")))?;
            if port.transform_locked && port.transform_id != transform_id {
                return Err(Error::TransformImmutable(format!(
                    "interface {key} is in use; transform stays {}",
                    port.transform_id
                )));
            }
            port.transform_id = transform_id;
            Ok(())
        })
    }

    async fn delete_link(&self, link_id: &ObjectId) -> Result<()> {
        self.mutate("delete_link", link_id.as_str(), |bp, _| {
            let link = bp
                .links
                .get(link_id)
                .ok_or_else(|| Error::not_found(format!("link {link_id}")))?;
            if bp.has_templates(link) {
                return Err(Error::TemplatesAssigned {
                    link_ids: vec![link_id.to_string()],
                });
            }
            bp.links.remove(link_id);
            bp.tags.remove(link_id);
            Ok(())
        })
    }

    async fn create_lag(&self, system_id: &ObjectId, label: &str, _mode: LagMode) -> Result<ObjectId> {
        self.mutate("create_lag", label, |bp, counter| bp.insert_lag(counter, system_id, label))
    }

    async fn delete_lag(&self, lag_id: &ObjectId) -> Result<()> {
        self.mutate("delete_lag", lag_id.as_str(), |bp, _| {
            let lag = bp
                .lags
                .get(lag_id)
                .ok_or_else(|| Error::not_found(format!("LAG {lag_id}")))?;
            let members = bp
                .links
                .values()
                .filter(|l| l.system_id == lag.system_id && l.lag_group() == Some(lag.label.as_str()))
                .count();
            if members > 0 {
                return Err(Error::remote(
                    "delete LAG",
                    "",
                    Some(lag_id.to_string()),
                    format!("{members} links still belong to {:?}", lag.label),
                ));
            }
            bp.lags.remove(lag_id);
            Ok(())
        })
    }

    async fn get_application_point_templates(&self, application_point_id: &ObjectId) -> Result<BTreeSet<ObjectId>> {
        self.read("get_application_point_templates", |bp| {
            if !bp.is_application_point(application_point_id) {
                return Err(Error::not_found(format!("application point {application_point_id}")));
            }
            Ok(bp.templates.get(application_point_id).cloned().unwrap_or_default())
        })
    }

    async fn set_application_point_templates(
        &self,
        application_point_id: &ObjectId,
        assignments: &BTreeMap<ObjectId, bool>,
    ) -> Result<()> {
        self.mutate(
            "set_application_point_templates",
            application_point_id.as_str(),
            |bp, _| {
                if !bp.is_application_point(application_point_id) {
                    return Err(Error::not_found(format!("application point {application_point_id}")));
                }
                let current = bp.templates.entry(application_point_id.clone()).or_default();
                for (template_id, assigned) in assignments {
                    if *assigned {
                        current.insert(template_id.clone());
                    } else {
                        current.remove(template_id);
                    }
                }
                Ok(())
            },
        )
    }

    async fn query(&self, query: &PathQuery) -> Result<Vec<serde_json::Value>> {
        let graph = self.read("query", |bp| Ok(bp.graph()))?;
        trace!(blueprint = %self.id, %query, nodes = graph.node_count(), "evaluating graph query");
        graph.evaluate(query)
    }
}

/// Factory registered under "memory"
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryFabricFactory;

impl FabricClientFactory for MemoryFabricFactory {
    fn create(&self, config: &ClientConfig) -> Result<Arc<dyn FabricClient>> {
        match config {
            ClientConfig::Memory { blueprints } => Ok(Arc::new(MemoryFabric::seeded(blueprints))),
            other => Err(Error::config(format!(
                "memory client factory cannot build a '{}' client",
                other.type_name()
            ))),
        }
    }
}
