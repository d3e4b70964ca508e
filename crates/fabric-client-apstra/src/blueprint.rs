//! Blueprint-scoped Apstra calls
//!
//! Node reads and property changes go through `/nodes/{id}` and the system
//! sub-resources; link membership, LAG membership and tags are read with
//! graph queries (`/qe`) because no single endpoint returns them together.

use async_trait::async_trait;
use fabric_core::model::{DesiredLink, LagMode, LinkKey, ObjectId, ObservedLink};
use fabric_core::query::{PathQuery, attr, attr_in, named, of_type};
use fabric_core::traits::{BlueprintClient, LinkParams, SystemInfo, SystemRequest};
use fabric_core::{Error, Result};
use reqwest::Method;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::session::{Session, Target, error_detail, parse_body, status_error};

/// Client for one Apstra blueprint
pub struct ApstraBlueprint {
    session: Arc<Session>,
    id: ObjectId,
}

impl ApstraBlueprint {
    pub(crate) fn new(session: Arc<Session>, id: ObjectId) -> Self {
        Self { session, id }
    }

    fn target<'a>(&'a self, operation: &'a str, object: Option<&'a str>) -> Target<'a> {
        Target {
            operation,
            blueprint: self.id.as_str(),
            object,
        }
    }

    fn path(&self, suffix: &str) -> String {
        format!("/api/blueprints/{}{suffix}", self.id)
    }

    async fn node(&self, node_id: &ObjectId) -> Result<Value> {
        self.session
            .call(
                Method::GET,
                &self.path(&format!("/nodes/{node_id}")),
                None,
                self.target("get node", Some(node_id.as_str())),
            )
            .await
    }

    async fn patch_node(&self, operation: &str, node_id: &ObjectId, body: Value) -> Result<()> {
        self.session
            .call(
                Method::PATCH,
                &self.path(&format!("/nodes/{node_id}")),
                Some(&body),
                self.target(operation, Some(node_id.as_str())),
            )
            .await
            .map(drop)
    }

    /// POST /switch-system-links; returns the new link IDs
    async fn create_links(&self, operation: &str, body: Value) -> Result<Vec<ObjectId>> {
        let response = self
            .session
            .call(
                Method::POST,
                &self.path("/switch-system-links"),
                Some(&body),
                self.target(operation, None),
            )
            .await?;
        let ids: Vec<ObjectId> = response["ids"]
            .as_array()
            .map(|ids| ids.iter().filter_map(Value::as_str).map(ObjectId::from).collect())
            .unwrap_or_default();
        if ids.is_empty() {
            return Err(self
                .target(operation, None)
                .error("Invalid response format: no link IDs returned"));
        }
        Ok(ids)
    }

    /// POST /delete-switch-system-links
    ///
    /// The controller refuses with 422 when connectivity templates are still
    /// attached to any of the links.
    async fn delete_links(&self, operation: &str, object: &ObjectId, link_ids: &[ObjectId]) -> Result<()> {
        let target = self.target(operation, Some(object.as_str()));
        let body = json!({ "link_ids": link_ids });
        let (status, text) = self
            .session
            .send(Method::POST, &self.path("/delete-switch-system-links"), Some(&body), target)
            .await?;

        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 422 && mentions_templates(&text) {
            return Err(Error::TemplatesAssigned {
                link_ids: link_ids.iter().map(ToString::to_string).collect(),
            });
        }
        Err(status_error(status, &text, target))
    }

    async fn link_ids_of(&self, system_id: &ObjectId) -> Result<Vec<ObjectId>> {
        let query = PathQuery::new()
            .node([of_type("system"), attr("id", system_id.as_str())])
            .out([of_type("hosted_interfaces")])
            .node([of_type("interface"), attr("if_type", "ethernet")])
            .out([of_type("link")])
            .node([of_type("link"), attr("link_type", "ethernet"), named("n_link")]);
        let items = self.query(&query).await?;
        let mut ids: Vec<ObjectId> = items
            .iter()
            .filter_map(|item| item["n_link"]["id"].as_str())
            .map(ObjectId::from)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn system_of_link(&self, link_id: &ObjectId) -> Result<ObjectId> {
        let query = PathQuery::new()
            .node([of_type("link"), attr("id", link_id.as_str())])
            .in_([of_type("link")])
            .node([of_type("interface")])
            .in_([of_type("hosted_interfaces")])
            .node([of_type("system"), attr("system_type", "server"), named("n_system")]);
        let items = self.query(&query).await?;
        items
            .iter()
            .find_map(|item| item["n_system"]["id"].as_str())
            .map(ObjectId::from)
            .ok_or_else(|| {
                self.target("find generic system", Some(link_id.as_str()))
                    .error("No generic system found behind the new link")
            })
    }

    /// LAG membership of a system's links: link ID -> (po interface, lag link)
    async fn lag_memberships(&self, system_id: &ObjectId) -> Result<HashMap<String, LagMembership>> {
        let members = PathQuery::new()
            .node([of_type("system"), attr("id", system_id.as_str())])
            .out([of_type("hosted_interfaces")])
            .node([of_type("interface"), attr("if_type", "port_channel"), named("n_po")])
            .out([of_type("composed_of")])
            .node([of_type("interface")])
            .out([of_type("link")])
            .node([of_type("link"), attr("link_type", "ethernet"), named("n_link")]);
        let aggregates = PathQuery::new()
            .node([of_type("system"), attr("id", system_id.as_str())])
            .out([of_type("hosted_interfaces")])
            .node([of_type("interface"), attr("if_type", "port_channel"), named("n_po")])
            .out([of_type("link")])
            .node([of_type("link"), attr("link_type", "aggregate_link"), named("n_lag")]);

        let lag_by_po: HashMap<String, String> = self
            .query(&aggregates)
            .await?
            .iter()
            .filter_map(|item| {
                Some((
                    item["n_po"]["id"].as_str()?.to_string(),
                    item["n_lag"]["id"].as_str()?.to_string(),
                ))
            })
            .collect();

        let mut memberships = HashMap::new();
        for item in self.query(&members).await? {
            let (Some(link_id), Some(po_id)) = (item["n_link"]["id"].as_str(), item["n_po"]["id"].as_str()) else {
                continue;
            };
            let lag_mode = match str_field(&item["n_po"], "lag_mode") {
                Some(mode) => Some(mode.parse::<LagMode>()?),
                None => None,
            };
            memberships.insert(
                link_id.to_string(),
                LagMembership {
                    lag_id: lag_by_po.get(po_id).map(|id| ObjectId::new(id.as_str())),
                    lag_mode,
                    port_channel_id: u32_field(&item["n_po"], "port_channel_id"),
                },
            );
        }
        Ok(memberships)
    }

    /// Tags of several nodes in one query
    async fn tags_of(&self, node_ids: &[&str]) -> Result<HashMap<String, BTreeSet<String>>> {
        let mut tags: HashMap<String, BTreeSet<String>> = HashMap::new();
        if node_ids.is_empty() {
            return Ok(tags);
        }
        let query = PathQuery::new()
            .node([of_type("tag"), named("n_tag")])
            .out([of_type("tag")])
            .node([attr_in("id", node_ids.iter().copied()), named("n_node")]);
        for item in self.query(&query).await? {
            if let (Some(node), Some(label)) = (item["n_node"]["id"].as_str(), item["n_tag"]["label"].as_str()) {
                tags.entry(node.to_string()).or_default().insert(label.to_string());
            }
        }
        Ok(tags)
    }

    async fn system_asn(&self, system_id: &ObjectId) -> Result<Option<u32>> {
        let query = PathQuery::new()
            .node([of_type("domain"), attr("domain_type", "autonomous_system"), named("n_domain")])
            .out([of_type("composed_of_systems")])
            .node([of_type("system"), attr("id", system_id.as_str())]);
        let items = self.query(&query).await?;
        Ok(items.iter().find_map(|item| u32_field(&item["n_domain"], "domain_id")))
    }

    async fn system_loopbacks(&self, system_id: &ObjectId) -> Result<(Option<String>, Option<String>)> {
        let query = PathQuery::new()
            .node([of_type("system"), attr("id", system_id.as_str())])
            .out([of_type("hosted_interfaces")])
            .node([of_type("interface"), attr("if_type", "loopback"), named("n_loopback")]);
        let items = self.query(&query).await?;
        Ok(items
            .first()
            .map(|item| {
                (
                    str_field(&item["n_loopback"], "ipv4_addr"),
                    str_field(&item["n_loopback"], "ipv6_addr"),
                )
            })
            .unwrap_or_default())
    }
}

struct LagMembership {
    lag_id: Option<ObjectId>,
    lag_mode: Option<LagMode>,
    port_channel_id: Option<u32>,
}

fn mentions_templates(body: &str) -> bool {
    let detail = error_detail(body).to_lowercase();
    detail.contains("connectivity template") || detail.contains("ct assigned")
}

/// Non-empty string attribute
fn str_field(node: &Value, key: &str) -> Option<String> {
    node.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Integer attribute, reported either as a number or as a string
fn u32_field(node: &Value, key: &str) -> Option<u32> {
    match node.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn link_request(system: Value, link: &DesiredLink) -> Value {
    json!({
        "lag_mode": link.lag_mode.map(|m| m.as_str()),
        "group_label": link.group_label,
        "tags": link.tags,
        "switch": {
            "system_id": link.key.switch_id,
            "if_name": link.key.if_name,
            "transformation_id": link.transform_id,
        },
        "system": system,
    })
}

#[async_trait]
impl BlueprintClient for ApstraBlueprint {
    fn blueprint_id(&self) -> &ObjectId {
        &self.id
    }

    async fn create_generic_system(&self, system: &SystemRequest, links: &[DesiredLink]) -> Result<ObjectId> {
        let mut new_system = json!({
            "system_type": "server",
            "external": system.external,
            "hostname": system.hostname,
            "label": system.label,
            "tags": system.tags,
        });
        if system.port_channel_id_min != 0 || system.port_channel_id_max != 0 {
            new_system["port_channel_id_min"] = json!(system.port_channel_id_min);
            new_system["port_channel_id_max"] = json!(system.port_channel_id_max);
        }
        let body = json!({
            "links": links
                .iter()
                .map(|link| link_request(json!({ "system_id": null }), link))
                .collect::<Vec<_>>(),
            "new_systems": [new_system],
        });

        let link_ids = self.create_links("create generic system", body).await?;
        let system_id = self.system_of_link(&link_ids[0]).await?;
        tracing::info!(blueprint = %self.id, system = %system_id, links = link_ids.len(), "Created generic system");
        Ok(system_id)
    }

    async fn get_generic_system(&self, system_id: &ObjectId) -> Result<SystemInfo> {
        let node = self.node(system_id).await?;
        if node["type"].as_str().is_some_and(|t| t != "system") {
            return Err(Error::not_found(format!("generic system {system_id}")));
        }
        let asn = self.system_asn(system_id).await?;
        let (loopback_ipv4, loopback_ipv6) = self.system_loopbacks(system_id).await?;

        Ok(SystemInfo {
            id: system_id.clone(),
            hostname: str_field(&node, "hostname").unwrap_or_default(),
            label: str_field(&node, "label").unwrap_or_default(),
            external: node["external"].as_bool().unwrap_or(false),
            asn,
            loopback_ipv4,
            loopback_ipv6,
            port_channel_id_min: u32_field(&node, "port_channel_id_min").unwrap_or(0),
            port_channel_id_max: u32_field(&node, "port_channel_id_max").unwrap_or(0),
            deploy_mode: str_field(&node, "deploy_mode").unwrap_or_else(|| "deploy".to_string()),
        })
    }

    async fn set_system_names(&self, system_id: &ObjectId, hostname: &str, label: &str) -> Result<()> {
        self.patch_node(
            "set system names",
            system_id,
            json!({ "hostname": hostname, "label": label }),
        )
        .await
    }

    async fn set_system_asn(&self, system_id: &ObjectId, asn: Option<u32>) -> Result<()> {
        let body = json!({ "domain_id": asn.map(|a| a.to_string()) });
        self.session
            .call(
                Method::PATCH,
                &self.path(&format!("/systems/{system_id}/domain")),
                Some(&body),
                self.target("set system ASN", Some(system_id.as_str())),
            )
            .await
            .map(drop)
    }

    async fn set_system_loopbacks(
        &self,
        system_id: &ObjectId,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
    ) -> Result<()> {
        let body = json!({ "ipv4_addr": ipv4, "ipv6_addr": ipv6 });
        self.session
            .call(
                Method::PATCH,
                &self.path(&format!("/systems/{system_id}/loopback/0")),
                Some(&body),
                self.target("set system loopbacks", Some(system_id.as_str())),
            )
            .await
            .map(drop)
    }

    async fn set_port_channel_range(&self, system_id: &ObjectId, min: u32, max: u32) -> Result<()> {
        self.patch_node(
            "set port channel range",
            system_id,
            json!({ "port_channel_id_min": min, "port_channel_id_max": max }),
        )
        .await
    }

    async fn set_deploy_mode(&self, system_id: &ObjectId, mode: &str) -> Result<()> {
        self.patch_node("set deploy mode", system_id, json!({ "deploy_mode": mode }))
            .await
    }

    async fn get_node_tags(&self, node_id: &ObjectId) -> Result<BTreeSet<String>> {
        let mut tags = self.tags_of(&[node_id.as_str()]).await?;
        Ok(tags.remove(node_id.as_str()).unwrap_or_default())
    }

    async fn set_node_tags(&self, node_id: &ObjectId, tags: &BTreeSet<String>) -> Result<()> {
        let current = self.get_node_tags(node_id).await?;
        let add: Vec<&String> = tags.difference(&current).collect();
        let remove: Vec<&String> = current.difference(tags).collect();
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }

        let body = json!({ "nodes": [node_id], "add": add, "remove": remove });
        self.session
            .call(
                Method::POST,
                &self.path("/tagging"),
                Some(&body),
                self.target("set node tags", Some(node_id.as_str())),
            )
            .await
            .map(drop)
    }

    async fn delete_generic_system(&self, system_id: &ObjectId) -> Result<()> {
        let link_ids = self.link_ids_of(system_id).await?;
        if link_ids.is_empty() {
            // A system without links is removed as a plain node.
            self.node(system_id).await?;
            return self
                .session
                .call(
                    Method::DELETE,
                    &self.path(&format!("/nodes/{system_id}")),
                    None,
                    self.target("delete generic system", Some(system_id.as_str())),
                )
                .await
                .map(drop);
        }
        self.delete_links("delete generic system", system_id, &link_ids).await?;
        tracing::info!(blueprint = %self.id, system = %system_id, "Deleted generic system");
        Ok(())
    }

    async fn list_links(&self, system_id: &ObjectId) -> Result<Vec<ObservedLink>> {
        let query = PathQuery::new()
            .node([of_type("system"), attr("id", system_id.as_str())])
            .out([of_type("hosted_interfaces")])
            .node([of_type("interface"), attr("if_type", "ethernet")])
            .out([of_type("link")])
            .node([of_type("link"), attr("link_type", "ethernet"), named("n_link")])
            .in_([of_type("link")])
            .node([of_type("interface"), named("n_switch_if")])
            .in_([of_type("hosted_interfaces")])
            .node([of_type("system"), attr("system_type", "switch"), named("n_switch")]);
        let items = self.query(&query).await?;
        if items.is_empty() {
            // Distinguish "no links" from "no such system".
            self.node(system_id).await?;
            return Ok(Vec::new());
        }

        let mut memberships = self.lag_memberships(system_id).await?;
        let link_ids: Vec<&str> = items.iter().filter_map(|item| item["n_link"]["id"].as_str()).collect();
        let mut tags = self.tags_of(&link_ids).await?;

        let mut links = Vec::with_capacity(items.len());
        for item in &items {
            let link = &item["n_link"];
            let switch_if = &item["n_switch_if"];
            let (Some(id), Some(switch_id), Some(if_name)) = (
                link["id"].as_str(),
                item["n_switch"]["id"].as_str(),
                switch_if["if_name"].as_str(),
            ) else {
                tracing::warn!(blueprint = %self.id, system = %system_id, "Skipping incomplete link in query result");
                continue;
            };
            let membership = memberships.remove(id);
            links.push(ObservedLink {
                id: ObjectId::new(id),
                key: LinkKey::new(switch_id, if_name),
                transform_id: u32_field(switch_if, "transformation_id"),
                group_label: str_field(link, "group_label"),
                lag_mode: membership.as_ref().and_then(|m| m.lag_mode),
                tags: tags.remove(id).unwrap_or_default(),
                interface_id: switch_if["id"].as_str().map(ObjectId::from),
                lag_id: membership.as_ref().and_then(|m| m.lag_id.clone()),
                port_channel_id: membership.and_then(|m| m.port_channel_id),
            });
        }
        links.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.id.cmp(&b.id)));
        Ok(links)
    }

    async fn create_link(&self, system_id: &ObjectId, link: &DesiredLink) -> Result<ObjectId> {
        let body = json!({
            "links": [link_request(json!({ "system_id": system_id }), link)],
        });
        let mut ids = self.create_links("create link", body).await?;
        Ok(ids.swap_remove(0))
    }

    async fn update_link(&self, link_id: &ObjectId, params: &LinkParams) -> Result<()> {
        let mut links = serde_json::Map::new();
        links.insert(
            link_id.to_string(),
            json!({
                "group_label": params.group_label,
                "lag_mode": params.lag_mode.map(|m| m.as_str()),
                "tags": params.tags,
            }),
        );
        let body = json!({ "links": links });
        self.session
            .call(
                Method::PATCH,
                &self.path("/leaf-server-link-labels"),
                Some(&body),
                self.target("update link", Some(link_id.as_str())),
            )
            .await
            .map(drop)
    }

    async fn set_transform(&self, key: &LinkKey, transform_id: u32) -> Result<()> {
        let object = key.to_string();
        let target = self.target("set interface transform", Some(object.as_str()));
        let body = json!({
            "system_id": key.switch_id,
            "if_name": key.if_name,
            "transformation_id": transform_id,
        });
        let (status, text) = self
            .session
            .send(Method::PATCH, &self.path("/switch-interface-transforms"), Some(&body), target)
            .await?;

        match status.as_u16() {
            200..=299 => parse_body(&text, target).map(drop),
            422 => Err(Error::TransformImmutable(format!("{object}: {}", error_detail(&text)))),
            _ => Err(status_error(status, &text, target)),
        }
    }

    async fn delete_link(&self, link_id: &ObjectId) -> Result<()> {
        self.delete_links("delete link", link_id, std::slice::from_ref(link_id))
            .await
    }

    async fn create_lag(&self, system_id: &ObjectId, label: &str, mode: LagMode) -> Result<ObjectId> {
        // Apstra materializes the aggregate once members carry the label and
        // mode, so there is nothing to create up front.
        tracing::debug!(blueprint = %self.id, system = %system_id, label, mode = %mode, "LAG created with its members");
        Ok(ObjectId::new(format!("{system_id}:{label}")))
    }

    async fn delete_lag(&self, lag_id: &ObjectId) -> Result<()> {
        tracing::debug!(blueprint = %self.id, lag = %lag_id, "LAG removed with its last member");
        Ok(())
    }

    async fn get_application_point_templates(&self, application_point_id: &ObjectId) -> Result<BTreeSet<ObjectId>> {
        let response = self
            .session
            .call(
                Method::GET,
                &self.path(&format!("/obj-policy-application-points/{application_point_id}")),
                None,
                self.target("get application point", Some(application_point_id.as_str())),
            )
            .await?;

        Ok(response["policies"]
            .as_array()
            .map(|policies| {
                policies
                    .iter()
                    .filter(|p| p["state"].as_str() == Some("used_directly"))
                    .filter_map(|p| p["policy"].as_str())
                    .map(ObjectId::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_application_point_templates(
        &self,
        application_point_id: &ObjectId,
        assignments: &BTreeMap<ObjectId, bool>,
    ) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }
        let policies: Vec<Value> = assignments
            .iter()
            .map(|(policy, used)| json!({ "policy": policy, "used": used }))
            .collect();
        let body = json!({
            "application_points": [{ "id": application_point_id, "policies": policies }],
        });
        self.session
            .call(
                Method::PATCH,
                &self.path("/obj-policy-batch-apply"),
                Some(&body),
                self.target("assign connectivity templates", Some(application_point_id.as_str())),
            )
            .await
            .map(drop)
    }

    async fn query(&self, query: &PathQuery) -> Result<Vec<Value>> {
        let body = json!({ "query": query.to_string() });
        let response = self
            .session
            .call(Method::POST, &self.path("/qe"), Some(&body), self.target("graph query", None))
            .await?;
        match response.get("items") {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(self
                .target("graph query", None)
                .error("Invalid response format: items is not an array")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_attributes_accept_numbers_and_strings() {
        let node = json!({ "a": 65001, "b": "65002", "c": null, "d": -1 });
        assert_eq!(u32_field(&node, "a"), Some(65001));
        assert_eq!(u32_field(&node, "b"), Some(65002));
        assert_eq!(u32_field(&node, "c"), None);
        assert_eq!(u32_field(&node, "d"), None);
        assert_eq!(u32_field(&node, "missing"), None);
    }

    #[test]
    fn empty_strings_read_as_absent() {
        let node = json!({ "group_label": "", "hostname": "web1" });
        assert_eq!(str_field(&node, "group_label"), None);
        assert_eq!(str_field(&node, "hostname").as_deref(), Some("web1"));
    }

    #[test]
    fn link_request_carries_lag_and_transform() {
        let link = DesiredLink::new("leaf1", "xe-0/0/1")
            .with_group("bond0", LagMode::LacpActive)
            .with_transform(2)
            .with_tags(["prod"]);
        let body = link_request(json!({ "system_id": "gs-1" }), &link);

        assert_eq!(body["lag_mode"], "lacp_active");
        assert_eq!(body["group_label"], "bond0");
        assert_eq!(body["tags"], json!(["prod"]));
        assert_eq!(body["switch"]["system_id"], "leaf1");
        assert_eq!(body["switch"]["if_name"], "xe-0/0/1");
        assert_eq!(body["switch"]["transformation_id"], 2);
        assert_eq!(body["system"]["system_id"], "gs-1");
    }

    #[test]
    fn template_conflicts_are_recognized() {
        assert!(mentions_templates(
            r#"{"errors": "Link is in use by Connectivity Templates"}"#
        ));
        assert!(!mentions_templates(r#"{"errors": "link not found"}"#));
    }
}
