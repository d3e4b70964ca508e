//! Graph lookups for IDs that CRUD endpoints do not return

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::ObjectId;
use crate::query::{PathQuery, attr, attr_in, ids_named, named, of_type};
use crate::traits::BlueprintClient;

/// Aggregate link carrying `label` on a generic system, if any
pub async fn lag_id_for_label(
    client: &dyn BlueprintClient,
    system_id: &ObjectId,
    label: &str,
) -> Result<Option<ObjectId>> {
    let query = PathQuery::new()
        .node([attr("id", system_id.as_str())])
        .out([of_type("hosted_interfaces")])
        .node([of_type("interface"), attr("if_type", "port_channel")])
        .out([of_type("link")])
        .node([
            of_type("link"),
            attr("group_label", label),
            attr("link_type", "aggregate_link"),
            named("n_link"),
        ]);

    let items = client.query(&query).await?;
    let mut ids = ids_named(&items, "n_link");
    ids.sort();
    ids.dedup();
    debug!(system = %system_id, label, found = ids.len(), "looked up LAG by label");
    Ok(ids.into_iter().next().map(ObjectId::new))
}

/// Aggregate links of a generic system, keyed by group label
///
/// Aggregates without any member link are included. When a label has more
/// than one aggregate the lowest ID wins.
pub async fn lags_of_system(client: &dyn BlueprintClient, system_id: &ObjectId) -> Result<BTreeMap<String, ObjectId>> {
    let query = PathQuery::new()
        .node([attr("id", system_id.as_str())])
        .out([of_type("hosted_interfaces")])
        .node([of_type("interface"), attr("if_type", "port_channel")])
        .out([of_type("link")])
        .node([of_type("link"), attr("link_type", "aggregate_link"), named("n_link")]);

    let mut lags: BTreeMap<String, ObjectId> = BTreeMap::new();
    for item in client.query(&query).await? {
        let Some(node) = item.get("n_link") else {
            continue;
        };
        let (Some(id), Some(label)) = (
            node.get("id").and_then(|v| v.as_str()),
            node.get("group_label").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        let id = ObjectId::new(id);
        lags.entry(label.to_string())
            .and_modify(|current| {
                if id < *current {
                    *current = id.clone();
                }
            })
            .or_insert(id);
    }
    debug!(system = %system_id, found = lags.len(), "listed LAGs");
    Ok(lags)
}

/// Switch-side interfaces (application points) of the given links
pub async fn switch_interfaces_for_links(
    client: &dyn BlueprintClient,
    link_ids: &[ObjectId],
) -> Result<Vec<ObjectId>> {
    if link_ids.is_empty() {
        return Ok(Vec::new());
    }

    let query = PathQuery::new()
        .node([of_type("link"), attr_in("id", link_ids.iter().map(ObjectId::as_str))])
        .in_([of_type("link")])
        .node([of_type("interface"), named("n_interface")])
        .in_([of_type("hosted_interfaces")])
        .node([of_type("system"), attr("system_type", "switch")]);

    let items = client.query(&query).await?;
    let mut ids = ids_named(&items, "n_interface");
    ids.sort();
    ids.dedup();
    Ok(ids.into_iter().map(ObjectId::new).collect())
}

/// Detach every connectivity template from the switch ports of `link_ids`
pub async fn clear_link_templates(client: &dyn BlueprintClient, link_ids: &[ObjectId]) -> Result<()> {
    let bp_id = client.blueprint_id().as_str();
    let interfaces = switch_interfaces_for_links(client, link_ids)
        .await
        .map_err(|e| e.context("find link interfaces", bp_id, None))?;

    for interface in interfaces {
        let templates = match client.get_application_point_templates(&interface).await {
            Ok(templates) => templates,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.context("read connectivity templates", bp_id, Some(interface.to_string()))),
        };
        if templates.is_empty() {
            continue;
        }

        let assignments: BTreeMap<ObjectId, bool> = templates.into_iter().map(|t| (t, false)).collect();
        client
            .set_application_point_templates(&interface, &assignments)
            .await
            .map_err(|e| e.context("clear connectivity templates", bp_id, Some(interface.to_string())))?;
        info!(interface = %interface, templates = assignments.len(), "cleared connectivity templates");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryFabric;
    use crate::model::{DesiredLink, LagMode};
    use crate::traits::{FabricClient, SystemRequest};

    #[tokio::test]
    async fn empty_aggregate_is_listed() {
        let fabric = MemoryFabric::new();
        fabric.add_blueprint("bp");
        fabric.add_switch("bp", "sw1", &["xe-0/0/1", "xe-0/0/2"]);
        let bp = fabric.blueprint(&ObjectId::new("bp")).await.unwrap();
        let system = bp
            .create_generic_system(
                &SystemRequest::default(),
                &[DesiredLink::new("sw1", "xe-0/0/1").with_group("bond0", LagMode::LacpActive)],
            )
            .await
            .unwrap();
        let bond1 = bp.create_lag(&system, "bond1", LagMode::Static).await.unwrap();

        let lags = lags_of_system(bp.as_ref(), &system).await.unwrap();
        assert_eq!(lags.keys().collect::<Vec<_>>(), vec!["bond0", "bond1"]);
        assert_eq!(lags["bond1"], bond1);
    }

    #[tokio::test]
    async fn clearing_templates_detaches_switch_ports_only() {
        let fabric = MemoryFabric::new();
        fabric.add_blueprint("bp");
        fabric.add_switch("bp", "sw1", &["xe-0/0/1"]);
        let bp = fabric.blueprint(&ObjectId::new("bp")).await.unwrap();
        let system = bp
            .create_generic_system(&SystemRequest::default(), &[DesiredLink::new("sw1", "xe-0/0/1")])
            .await
            .unwrap();
        let link = bp.list_links(&system).await.unwrap().remove(0);
        let interface = link.interface_id.clone().unwrap();
        fabric.assign_template("bp", interface.as_str(), "ct-1");

        clear_link_templates(bp.as_ref(), &[link.id]).await.unwrap();
        assert!(bp.get_application_point_templates(&interface).await.unwrap().is_empty());

        clear_link_templates(bp.as_ref(), &[]).await.unwrap();
    }
}
