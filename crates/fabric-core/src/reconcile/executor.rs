//! Apply executor
//!
//! Turns a link plan plus a group plan into an ordered list of
//! [`Operation`]s and issues them one at a time through a
//! [`BlueprintClient`]. Execution stops at the first failure; nothing is
//! rolled back and nothing is retried. The caller re-reads remote state and
//! plans again.
//!
//! Emission order:
//!
//! 1. create groups (aggregates must exist before members join)
//! 2. delete links (frees switch ports reused by the creates below)
//! 3. create links
//! 4. update links (group moves included)
//! 5. delete groups (only once no member references them)

use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::groups::GroupPlan;
use super::lookup::{clear_link_templates, lag_id_for_label};
use super::matcher::ReconciliationPlan;
use crate::error::{Error, Result};
use crate::model::{DesiredLink, LagMode, LinkKey, ObjectId, ObservedLink};
use crate::traits::{BlueprintClient, LinkParams};

/// One remote mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Create the aggregate for a LAG group
    CreateGroup {
        /// Group label
        label: String,
        /// LAG mode of the aggregate
        lag_mode: LagMode,
    },
    /// Delete a link that is no longer desired
    DeleteLink {
        /// Remote link ID
        id: ObjectId,
        /// Where the link landed
        key: LinkKey,
    },
    /// Create a new link
    CreateLink {
        /// Link to create
        link: DesiredLink,
    },
    /// Modify an existing link in place
    UpdateLink {
        /// Remote link ID
        id: ObjectId,
        /// Target configuration
        link: DesiredLink,
        /// Whether the switch interface transform must change
        transform: bool,
        /// Whether label, mode or tags must change
        params: bool,
    },
    /// Delete the aggregate of a LAG group with no members left
    DeleteGroup {
        /// Group label
        label: String,
        /// Aggregate ID, when already known
        lag_id: Option<ObjectId>,
    },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateGroup { label, lag_mode } => write!(f, "create group {label} ({lag_mode})"),
            Operation::DeleteLink { id, key } => write!(f, "delete link {key} ({id})"),
            Operation::CreateLink { link } => write!(f, "create link {}", link.key),
            Operation::UpdateLink { id, link, .. } => write!(f, "update link {} ({id})", link.key),
            Operation::DeleteGroup { label, .. } => write!(f, "delete group {label}"),
        }
    }
}

/// Result of one successful operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// The call went through; carries the new ID for creations
    Applied(Option<ObjectId>),
    /// A delete found nothing to delete
    AlreadyAbsent,
    /// Applied, except for a change the controller refused without failing
    /// the operation
    Warned(String),
}

/// Outcome of a batch
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Operations that completed, in order
    pub succeeded: Vec<(Operation, OperationOutcome)>,
    /// The operation that stopped the batch
    pub failed: Option<(Operation, Error)>,
    /// Operations never attempted
    pub skipped: Vec<Operation>,
}

impl ApplyReport {
    /// Whether every operation completed
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Number of operations in the batch
    pub fn total(&self) -> usize {
        self.succeeded.len() + usize::from(self.failed.is_some()) + self.skipped.len()
    }

    /// Warning messages from completed operations
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.succeeded.iter().filter_map(|(_, outcome)| match outcome {
            OperationOutcome::Warned(msg) => Some(msg.as_str()),
            _ => None,
        })
    }

    /// Completed operations, or `Error::PartialApply` naming the failure
    pub fn into_result(self) -> Result<Vec<(Operation, OperationOutcome)>> {
        let total = self.total();
        match self.failed {
            None => Ok(self.succeeded),
            Some((op, source)) => Err(Error::PartialApply {
                succeeded: self.succeeded.len(),
                total,
                failed_operation: op.to_string(),
                source: Box::new(source),
            }),
        }
    }
}

/// Order the operations implied by a link plan and its group plan
pub fn order_operations(
    plan: &ReconciliationPlan<DesiredLink, ObservedLink>,
    groups: &GroupPlan,
) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(plan.len() + groups.changes.len());

    ops.extend(groups.creates().filter_map(|g| {
        g.lag_mode.map(|lag_mode| Operation::CreateGroup {
            label: g.label.clone(),
            lag_mode,
        })
    }));

    ops.extend(plan.to_delete.iter().map(|o| Operation::DeleteLink {
        id: o.id.clone(),
        key: o.key.clone(),
    }));

    ops.extend(plan.to_create.iter().map(|d| Operation::CreateLink { link: d.clone() }));

    ops.extend(plan.to_update.iter().map(|pair| Operation::UpdateLink {
        id: pair.observed.id.clone(),
        link: pair.desired.clone(),
        transform: pair.desired.transform_differs(&pair.observed),
        params: pair.desired.lag_params_differ(&pair.observed),
    }));

    ops.extend(groups.deletes().map(|g| Operation::DeleteGroup {
        label: g.label.clone(),
        lag_id: g.lag_id.clone(),
    }));

    ops
}

/// Issues operations for one generic system
pub struct ApplyExecutor<'a> {
    client: &'a dyn BlueprintClient,
    system_id: &'a ObjectId,
    cancel: &'a CancellationToken,
    clear_templates: bool,
}

impl<'a> ApplyExecutor<'a> {
    /// Executor for links of `system_id`
    pub fn new(client: &'a dyn BlueprintClient, system_id: &'a ObjectId, cancel: &'a CancellationToken) -> Self {
        Self {
            client,
            system_id,
            cancel,
            clear_templates: false,
        }
    }

    /// Detach connectivity templates from a link when they block its
    /// deletion, then try once more
    pub fn clear_templates_on_delete(mut self, enabled: bool) -> Self {
        self.clear_templates = enabled;
        self
    }

    /// Run `operations` in order, stopping at the first failure
    pub async fn execute(&self, operations: Vec<Operation>) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut pending = operations.into_iter();

        while let Some(op) = pending.next() {
            if self.cancel.is_cancelled() {
                warn!(system = %self.system_id, operation = %op, "apply cancelled");
                report.failed = Some((op, Error::Cancelled));
                report.skipped.extend(pending.by_ref());
                break;
            }

            match self.apply(&op).await {
                Ok(outcome) => {
                    debug!(system = %self.system_id, operation = %op, ?outcome, "operation applied");
                    report.succeeded.push((op, outcome));
                }
                Err(e) => {
                    error!(system = %self.system_id, operation = %op, error = %e, "operation failed");
                    report.failed = Some((op, e));
                    report.skipped.extend(pending.by_ref());
                    break;
                }
            }
        }

        if report.is_success() && !report.succeeded.is_empty() {
            info!(
                system = %self.system_id,
                operations = report.succeeded.len(),
                "applied link changes"
            );
        }
        report
    }

    async fn apply(&self, op: &Operation) -> Result<OperationOutcome> {
        let bp = self.client.blueprint_id().as_str();

        match op {
            Operation::CreateGroup { label, lag_mode } => self
                .client
                .create_lag(self.system_id, label, *lag_mode)
                .await
                .map(|id| OperationOutcome::Applied(Some(id)))
                .map_err(|e| e.context(op.to_string(), bp, Some(self.system_id.to_string()))),

            Operation::DeleteLink { id, .. } => self.delete_link(id).await,

            Operation::CreateLink { link } => self
                .client
                .create_link(self.system_id, link)
                .await
                .map(|id| OperationOutcome::Applied(Some(id)))
                .map_err(|e| e.context(op.to_string(), bp, Some(link.key.to_string()))),

            Operation::UpdateLink {
                id,
                link,
                transform,
                params,
            } => {
                let mut warning = None;
                if *transform && let Some(transform_id) = link.transform_id {
                    match self.client.set_transform(&link.key, transform_id).await {
                        Ok(()) => {}
                        Err(Error::TransformImmutable(msg)) => {
                            warn!(link = %link.key, transform_id, "controller kept the current transform: {msg}");
                            warning = Some(format!("transform of {} not changed: {msg}", link.key));
                        }
                        Err(e) => return Err(e.context(op.to_string(), bp, Some(id.to_string()))),
                    }
                }
                if *params {
                    self.client
                        .update_link(id, &LinkParams::from(link))
                        .await
                        .map_err(|e| e.context(op.to_string(), bp, Some(id.to_string())))?;
                }
                Ok(warning.map_or(OperationOutcome::Applied(None), OperationOutcome::Warned))
            }

            Operation::DeleteGroup { label, lag_id } => {
                let lag_id = match lag_id {
                    Some(id) => id.clone(),
                    None => match lag_id_for_label(self.client, self.system_id, label).await? {
                        Some(id) => id,
                        None => return Ok(OperationOutcome::AlreadyAbsent),
                    },
                };
                match self.client.delete_lag(&lag_id).await {
                    Ok(()) => Ok(OperationOutcome::Applied(None)),
                    Err(e) if e.is_not_found() => Ok(OperationOutcome::AlreadyAbsent),
                    Err(e) => Err(e.context(op.to_string(), bp, Some(lag_id.to_string()))),
                }
            }
        }
    }

    async fn delete_link(&self, id: &ObjectId) -> Result<OperationOutcome> {
        let bp = self.client.blueprint_id().as_str();
        let first = match self.client.delete_link(id).await {
            Ok(()) => return Ok(OperationOutcome::Applied(None)),
            Err(e) if e.is_not_found() => return Ok(OperationOutcome::AlreadyAbsent),
            Err(e) => e,
        };

        if !(self.clear_templates && matches!(first, Error::TemplatesAssigned { .. })) {
            return Err(first.context("delete link", bp, Some(id.to_string())));
        }

        info!(link = %id, "clearing connectivity templates before deleting link");
        clear_link_templates(self.client, std::slice::from_ref(id)).await?;

        match self.client.delete_link(id).await {
            Ok(()) => Ok(OperationOutcome::Applied(None)),
            Err(e) if e.is_not_found() => Ok(OperationOutcome::AlreadyAbsent),
            Err(e) => Err(e.context("delete link", bp, Some(id.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryFabric;
    use crate::model::LagMode;
    use crate::reconcile::lookup::lags_of_system;
    use crate::reconcile::{compute_plan, resolve_groups};
    use crate::query::PathQuery;
    use crate::traits::{FabricClient, SystemInfo, SystemRequest};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Forwards to a real blueprint and cancels `token` once `after` links
    /// have been created
    struct CancelAfterCreates {
        inner: Arc<dyn BlueprintClient>,
        token: CancellationToken,
        after: usize,
        created: AtomicUsize,
    }

    #[async_trait]
    impl BlueprintClient for CancelAfterCreates {
        fn blueprint_id(&self) -> &ObjectId {
            self.inner.blueprint_id()
        }
        async fn create_generic_system(&self, system: &SystemRequest, links: &[DesiredLink]) -> Result<ObjectId> {
            self.inner.create_generic_system(system, links).await
        }
        async fn get_generic_system(&self, system_id: &ObjectId) -> Result<SystemInfo> {
            self.inner.get_generic_system(system_id).await
        }
        async fn set_system_names(&self, system_id: &ObjectId, hostname: &str, label: &str) -> Result<()> {
            self.inner.set_system_names(system_id, hostname, label).await
        }
        async fn set_system_asn(&self, system_id: &ObjectId, asn: Option<u32>) -> Result<()> {
            self.inner.set_system_asn(system_id, asn).await
        }
        async fn set_system_loopbacks(&self, system_id: &ObjectId, ipv4: Option<&str>, ipv6: Option<&str>) -> Result<()> {
            self.inner.set_system_loopbacks(system_id, ipv4, ipv6).await
        }
        async fn set_port_channel_range(&self, system_id: &ObjectId, min: u32, max: u32) -> Result<()> {
            self.inner.set_port_channel_range(system_id, min, max).await
        }
        async fn set_deploy_mode(&self, system_id: &ObjectId, mode: &str) -> Result<()> {
            self.inner.set_deploy_mode(system_id, mode).await
        }
        async fn get_node_tags(&self, node_id: &ObjectId) -> Result<BTreeSet<String>> {
            self.inner.get_node_tags(node_id).await
        }
        async fn set_node_tags(&self, node_id: &ObjectId, tags: &BTreeSet<String>) -> Result<()> {
            self.inner.set_node_tags(node_id, tags).await
        }
        async fn delete_generic_system(&self, system_id: &ObjectId) -> Result<()> {
            self.inner.delete_generic_system(system_id).await
        }
        async fn list_links(&self, system_id: &ObjectId) -> Result<Vec<ObservedLink>> {
            self.inner.list_links(system_id).await
        }
        async fn create_link(&self, system_id: &ObjectId, link: &DesiredLink) -> Result<ObjectId> {
            let id = self.inner.create_link(system_id, link).await?;
            if self.created.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.token.cancel();
            }
            Ok(id)
        }
        async fn update_link(&self, link_id: &ObjectId, params: &LinkParams) -> Result<()> {
            self.inner.update_link(link_id, params).await
        }
        async fn set_transform(&self, key: &LinkKey, transform_id: u32) -> Result<()> {
            self.inner.set_transform(key, transform_id).await
        }
        async fn delete_link(&self, link_id: &ObjectId) -> Result<()> {
            self.inner.delete_link(link_id).await
        }
        async fn create_lag(&self, system_id: &ObjectId, label: &str, mode: LagMode) -> Result<ObjectId> {
            self.inner.create_lag(system_id, label, mode).await
        }
        async fn delete_lag(&self, lag_id: &ObjectId) -> Result<()> {
            self.inner.delete_lag(lag_id).await
        }
        async fn get_application_point_templates(&self, application_point_id: &ObjectId) -> Result<BTreeSet<ObjectId>> {
            self.inner.get_application_point_templates(application_point_id).await
        }
        async fn set_application_point_templates(
            &self,
            application_point_id: &ObjectId,
            assignments: &BTreeMap<ObjectId, bool>,
        ) -> Result<()> {
            self.inner
                .set_application_point_templates(application_point_id, assignments)
                .await
        }
        async fn query(&self, query: &PathQuery) -> Result<Vec<serde_json::Value>> {
            self.inner.query(query).await
        }
    }

    async fn fixture() -> (MemoryFabric, Arc<dyn BlueprintClient>, ObjectId) {
        let fabric = MemoryFabric::new();
        fabric.add_blueprint("bp");
        fabric.add_switch("bp", "sw1", &["xe-0/0/1", "xe-0/0/2", "xe-0/0/3"]);
        let bp = fabric.blueprint(&ObjectId::new("bp")).await.unwrap();
        let system = bp
            .create_generic_system(&SystemRequest::default(), &[DesiredLink::new("sw1", "xe-0/0/3")])
            .await
            .unwrap();
        fabric.clear_calls();
        (fabric, bp, system)
    }

    async fn plan_for(
        bp: &Arc<dyn BlueprintClient>,
        system: &ObjectId,
        desired: Vec<DesiredLink>,
    ) -> Vec<Operation> {
        let observed = bp.list_links(system).await.unwrap();
        let lags = lags_of_system(bp.as_ref(), system).await.unwrap();
        let groups = resolve_groups(&desired, &observed, &lags);
        let plan = compute_plan("links", desired, observed).unwrap();
        order_operations(&plan, &groups)
    }

    #[tokio::test]
    async fn group_is_created_before_members() {
        let (fabric, bp, system) = fixture().await;
        let desired = vec![
            DesiredLink::new("sw1", "xe-0/0/1").with_group("bond0", LagMode::LacpActive),
            DesiredLink::new("sw1", "xe-0/0/2").with_group("bond0", LagMode::LacpActive),
            DesiredLink::new("sw1", "xe-0/0/3"),
        ];

        let ops = plan_for(&bp, &system, desired).await;
        assert!(matches!(ops[0], Operation::CreateGroup { .. }));
        assert!(matches!(ops[1], Operation::CreateLink { .. }));
        assert!(matches!(ops[2], Operation::CreateLink { .. }));

        let cancel = CancellationToken::new();
        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel).execute(ops).await;
        assert!(report.is_success());
        assert_eq!(
            fabric.calls(),
            vec![
                "create_lag bond0",
                "create_link sw1:xe-0/0/1",
                "create_link sw1:xe-0/0/2",
            ]
        );
    }

    #[tokio::test]
    async fn members_leave_before_group_is_deleted() {
        let (fabric, bp, system) = fixture().await;
        let grouped = vec![
            DesiredLink::new("sw1", "xe-0/0/1").with_group("bond0", LagMode::Static),
            DesiredLink::new("sw1", "xe-0/0/3"),
        ];
        let cancel = CancellationToken::new();
        let ops = plan_for(&bp, &system, grouped).await;
        ApplyExecutor::new(bp.as_ref(), &system, &cancel)
            .execute(ops)
            .await
            .into_result()
            .unwrap();
        fabric.clear_calls();

        let ungrouped = vec![DesiredLink::new("sw1", "xe-0/0/1"), DesiredLink::new("sw1", "xe-0/0/3")];
        let ops = plan_for(&bp, &system, ungrouped).await;
        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel).execute(ops).await;
        assert!(report.is_success(), "{:?}", report.failed);

        let calls = fabric.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("update_link"));
        assert!(calls[1].starts_with("delete_lag"));
    }

    #[tokio::test]
    async fn delete_of_absent_link_succeeds() {
        let (_fabric, bp, system) = fixture().await;
        let cancel = CancellationToken::new();
        let ops = vec![Operation::DeleteLink {
            id: ObjectId::new("no-such-link"),
            key: LinkKey::new("sw1", "xe-0/0/9"),
        }];

        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel).execute(ops).await;
        assert!(report.is_success());
        assert_eq!(report.succeeded[0].1, OperationOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn failure_stops_batch_and_reports_progress() {
        let (fabric, bp, system) = fixture().await;
        fabric.fail_next("create_link", "port is administratively locked");

        let ops = vec![
            Operation::CreateLink {
                link: DesiredLink::new("sw1", "xe-0/0/1"),
            },
            Operation::CreateLink {
                link: DesiredLink::new("sw1", "xe-0/0/2"),
            },
        ];
        let cancel = CancellationToken::new();
        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel).execute(ops).await;

        assert!(report.succeeded.is_empty());
        assert_eq!(report.skipped.len(), 1);
        let err = report.into_result().unwrap_err();
        match err {
            Error::PartialApply {
                succeeded,
                total,
                failed_operation,
                ..
            } => {
                assert_eq!((succeeded, total), (0, 2));
                assert_eq!(failed_operation, "create link sw1:xe-0/0/1");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(fabric.calls().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_issues_no_calls() {
        let (fabric, bp, system) = fixture().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ops = vec![Operation::CreateLink {
            link: DesiredLink::new("sw1", "xe-0/0/1"),
        }];
        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel).execute(ops).await;

        assert!(matches!(report.failed, Some((_, Error::Cancelled))));
        assert!(fabric.calls().is_empty());
    }

    #[tokio::test]
    async fn immutable_transform_is_a_warning() {
        let (fabric, bp, system) = fixture().await;
        fabric.lock_transform("bp", "sw1", "xe-0/0/3");

        let ops = plan_for(&bp, &system, vec![DesiredLink::new("sw1", "xe-0/0/3").with_transform(2)]).await;
        let cancel = CancellationToken::new();
        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel).execute(ops).await;

        assert!(report.is_success());
        assert_eq!(report.warnings().count(), 1);
    }

    #[tokio::test]
    async fn assigned_templates_are_cleared_when_allowed() {
        let (fabric, bp, system) = fixture().await;
        let link = bp.list_links(&system).await.unwrap().remove(0);
        let interface = link.interface_id.clone().unwrap();
        fabric.assign_template("bp", interface.as_str(), "ct-1");

        let ops = vec![Operation::DeleteLink {
            id: link.id.clone(),
            key: link.key.clone(),
        }];
        let cancel = CancellationToken::new();

        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel)
            .execute(ops.clone())
            .await;
        assert!(matches!(report.failed, Some((_, Error::TemplatesAssigned { .. }))));

        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel)
            .clear_templates_on_delete(true)
            .execute(ops)
            .await;
        assert!(report.is_success(), "{:?}", report.failed);
        assert!(bp.get_application_point_templates(&interface).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_batch_stops_further_calls() {
        let (fabric, bp, system) = fixture().await;
        let cancel = CancellationToken::new();
        let client = CancelAfterCreates {
            inner: bp.clone(),
            token: cancel.clone(),
            after: 1,
            created: AtomicUsize::new(0),
        };
        let desired = vec![
            DesiredLink::new("sw1", "xe-0/0/1").with_group("bond0", LagMode::LacpActive),
            DesiredLink::new("sw1", "xe-0/0/2").with_group("bond0", LagMode::LacpActive),
            DesiredLink::new("sw1", "xe-0/0/3"),
        ];
        let ops = plan_for(&bp, &system, desired).await;
        assert_eq!(ops.len(), 3);

        let report = ApplyExecutor::new(&client, &system, &cancel).execute(ops).await;

        assert_eq!(report.succeeded.len(), 2);
        assert!(matches!(report.succeeded[0].0, Operation::CreateGroup { .. }));
        assert!(matches!(report.failed, Some((Operation::CreateLink { .. }, Error::Cancelled))));
        assert!(report.skipped.is_empty());
        assert_eq!(report.total(), 3);
        assert_eq!(fabric.calls(), vec!["create_lag bond0", "create_link sw1:xe-0/0/1"]);

        match report.into_result().unwrap_err() {
            Error::PartialApply { succeeded, total, .. } => assert_eq!((succeeded, total), (2, 3)),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn replanning_after_partial_apply_finishes_the_work() {
        let (fabric, bp, system) = fixture().await;
        let desired = vec![
            DesiredLink::new("sw1", "xe-0/0/1").with_group("bond0", LagMode::LacpActive),
            DesiredLink::new("sw1", "xe-0/0/3"),
        ];
        let cancel = CancellationToken::new();
        fabric.fail_next("create_link", "port is administratively locked");

        let ops = plan_for(&bp, &system, desired.clone()).await;
        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel).execute(ops).await;
        assert_eq!(report.succeeded.len(), 1);
        assert!(report.failed.is_some());
        fabric.clear_calls();

        let ops = plan_for(&bp, &system, desired.clone()).await;
        assert_eq!(ops, vec![Operation::CreateLink { link: desired[0].clone() }]);
        let report = ApplyExecutor::new(bp.as_ref(), &system, &cancel).execute(ops).await;
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(fabric.calls(), vec!["create_link sw1:xe-0/0/1"]);

        assert!(plan_for(&bp, &system, desired).await.is_empty());
    }
}
