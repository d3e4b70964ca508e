//! Connectivity-template assignment resource
//!
//! Tracks which connectivity templates are attached to one application
//! point. Templates attached by someone else are left alone: only the IDs
//! this resource assigned, or is asked to assign, are ever touched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Outcome, Resource, ensure_live};
use crate::error::{Error, Result};
use crate::lock::with_blueprint_lock;
use crate::model::{ObjectId, ObservedBinding, TemplateBinding};
use crate::reconcile::compute_plan;
use crate::traits::{BlueprintClient, FabricClient, ResourceKind};

/// Desired templates on an application point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateAssignmentSpec {
    /// Blueprint the application point lives in
    pub blueprint_id: ObjectId,
    /// Interface or system node
    pub application_point_id: ObjectId,
    /// Connectivity template IDs
    pub template_ids: BTreeSet<ObjectId>,
}

impl TemplateAssignmentSpec {
    /// Desired templates on `application_point_id` in `blueprint_id`
    pub fn new<I, S>(blueprint_id: impl Into<ObjectId>, application_point_id: impl Into<ObjectId>, template_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ObjectId>,
    {
        Self {
            blueprint_id: blueprint_id.into(),
            application_point_id: application_point_id.into(),
            template_ids: template_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Check the desired state without contacting the controller
    pub fn validate(&self) -> Result<()> {
        if self.blueprint_id.is_empty() {
            return Err(Error::validation("blueprint_id", "must not be empty"));
        }
        if self.application_point_id.is_empty() {
            return Err(Error::validation("application_point_id", "must not be empty"));
        }
        if self.template_ids.is_empty() {
            return Err(Error::validation("template_ids", "at least one template is required"));
        }
        if self.template_ids.iter().any(ObjectId::is_empty) {
            return Err(Error::validation("template_ids", "template IDs must not be empty"));
        }
        Ok(())
    }

    /// Whether moving from `state` to this spec needs a new assignment
    pub fn requires_replace(&self, state: &TemplateAssignmentState) -> bool {
        self.blueprint_id != state.blueprint_id || self.application_point_id != state.application_point_id
    }

    fn bindings(&self) -> Vec<TemplateBinding> {
        self.template_ids
            .iter()
            .map(|t| TemplateBinding::new(self.application_point_id.clone(), t.clone()))
            .collect()
    }
}

/// Tracked template assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateAssignmentState {
    /// Blueprint the application point lives in
    pub blueprint_id: ObjectId,
    /// Interface or system node the templates are attached to
    pub application_point_id: ObjectId,
    /// Templates this resource assigned and still finds attached
    pub template_ids: BTreeSet<ObjectId>,
}

/// Lifecycle of template assignments
pub struct TemplateAssignmentResource {
    client: Arc<dyn FabricClient>,
    locking: bool,
}

impl TemplateAssignmentResource {
    /// `locking == false` skips the blueprint mutex
    pub fn new(client: Arc<dyn FabricClient>, locking: bool) -> Self {
        Self { client, locking }
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

    async fn attached(&self, state: &TemplateAssignmentState) -> Result<BTreeSet<ObjectId>> {
        let bp = self.client.blueprint(&state.blueprint_id).await?;
        bp.get_application_point_templates(&state.application_point_id)
            .await
            .map_err(|e| {
                e.context(
                    "read connectivity templates",
                    state.blueprint_id.as_str(),
                    Some(state.application_point_id.to_string()),
                )
            })
    }
}

#[async_trait]
impl Resource for TemplateAssignmentResource {
    type Spec = TemplateAssignmentSpec;
    type State = TemplateAssignmentState;

    const KIND: ResourceKind = ResourceKind::TemplateAssignment;

    fn requires_replace(spec: &Self::Spec, state: &Self::State) -> bool {
        spec.requires_replace(state)
    }

    /// Attach every template in `spec`
    async fn create(
        &self,
        spec: &TemplateAssignmentSpec,
        cancel: &CancellationToken,
    ) -> Outcome<TemplateAssignmentState> {
        let result: Result<()> = async {
            spec.validate()?;
            ensure_live(cancel)?;
            let bp = self.open(&spec.blueprint_id).await?;
            let bp = bp.as_ref();

            with_blueprint_lock(self.client.clone(), &spec.blueprint_id, self.locking, cancel, move || async move {
                ensure_live(cancel)?;
                let assignments: BTreeMap<ObjectId, bool> =
                    spec.template_ids.iter().map(|t| (t.clone(), true)).collect();
                bp.set_application_point_templates(&spec.application_point_id, &assignments)
                    .await
                    .map_err(|e| {
                        e.context(
                            "assign connectivity templates",
                            spec.blueprint_id.as_str(),
                            Some(spec.application_point_id.to_string()),
                        )
                    })?;
                info!(
                    application_point = %spec.application_point_id,
                    templates = assignments.len(),
                    "assigned connectivity templates"
                );
                Ok(())
            })
            .await
        }
        .await;

        match result {
            Ok(()) => Outcome::applied(
                TemplateAssignmentState {
                    blueprint_id: spec.blueprint_id.clone(),
                    application_point_id: spec.application_point_id.clone(),
                    template_ids: spec.template_ids.clone(),
                },
                1,
                Vec::new(),
            ),
            Err(e) => Outcome::failed(None, e),
        }
    }

    /// Templates from `state` that are still attached; `None` when the
    /// blueprint or application point is gone
    async fn read(
        &self,
        state: &TemplateAssignmentState,
        cancel: &CancellationToken,
    ) -> Result<Option<TemplateAssignmentState>> {
        ensure_live(cancel)?;
        let attached = match self.attached(state).await {
            Ok(attached) => attached,
            Err(e) if e.is_not_found() => {
                warn!(
                    blueprint = %state.blueprint_id,
                    application_point = %state.application_point_id,
                    "application point not found; dropping template assignment from state"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        Ok(Some(TemplateAssignmentState {
            template_ids: state.template_ids.intersection(&attached).cloned().collect(),
            ..state.clone()
        }))
    }

    /// Attach and detach templates so the tracked set equals `spec`
    async fn update(
        &self,
        spec: &TemplateAssignmentSpec,
        state: &TemplateAssignmentState,
        cancel: &CancellationToken,
    ) -> Outcome<TemplateAssignmentState> {
        let result: Result<usize> = async {
            spec.validate()?;
            if spec.requires_replace(state) {
                return Err(Error::validation(
                    "application_point_id",
                    "blueprint_id and application_point_id cannot change in place",
                ));
            }
            ensure_live(cancel)?;
            let bp = self.open(&spec.blueprint_id).await?;
            let bp = bp.as_ref();

            with_blueprint_lock(self.client.clone(), &spec.blueprint_id, self.locking, cancel, move || async move {
                let attached = self.attached(state).await?;
                let observed: Vec<ObservedBinding> = attached
                    .iter()
                    .filter(|t| state.template_ids.contains(*t) || spec.template_ids.contains(*t))
                    .map(|t| ObservedBinding::new(TemplateBinding::new(spec.application_point_id.clone(), t.clone())))
                    .collect();

                let plan = compute_plan("template_ids", spec.bindings(), observed)?;
                if plan.is_empty() {
                    debug!(application_point = %spec.application_point_id, "connectivity templates up to date");
                    return Ok(0);
                }

                let mut assignments = BTreeMap::new();
                assignments.extend(plan.to_create.iter().map(|b| (b.template_id.clone(), true)));
                assignments.extend(plan.to_delete.iter().map(|o| (o.binding().template_id.clone(), false)));

                ensure_live(cancel)?;
                bp.set_application_point_templates(&spec.application_point_id, &assignments)
                    .await
                    .map_err(|e| {
                        e.context(
                            "update connectivity templates",
                            spec.blueprint_id.as_str(),
                            Some(spec.application_point_id.to_string()),
                        )
                    })?;
                info!(
                    application_point = %spec.application_point_id,
                    assigned = plan.to_create.len(),
                    unassigned = plan.to_delete.len(),
                    "updated connectivity templates"
                );
                Ok(1)
            })
            .await
        }
        .await;

        match result {
            Ok(changes) => Outcome::applied(
                TemplateAssignmentState {
                    blueprint_id: spec.blueprint_id.clone(),
                    application_point_id: spec.application_point_id.clone(),
                    template_ids: spec.template_ids.clone(),
                },
                changes,
                Vec::new(),
            ),
            Err(e) => Outcome::failed(None, e),
        }
    }

    /// Detach the tracked templates; absence is success
    async fn delete(&self, state: &TemplateAssignmentState, cancel: &CancellationToken) -> Result<()> {
        if state.template_ids.is_empty() {
            return Ok(());
        }
        ensure_live(cancel)?;
        let bp = match self.client.blueprint(&state.blueprint_id).await {
            Ok(bp) => bp,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.context("open blueprint", state.blueprint_id.as_str(), None)),
        };
        let bp = bp.as_ref();

        with_blueprint_lock(self.client.clone(), &state.blueprint_id, self.locking, cancel, move || async move {
            ensure_live(cancel)?;
            let assignments: BTreeMap<ObjectId, bool> =
                state.template_ids.iter().map(|t| (t.clone(), false)).collect();
            match bp
                .set_application_point_templates(&state.application_point_id, &assignments)
                .await
            {
                Ok(()) => {
                    info!(application_point = %state.application_point_id, "unassigned connectivity templates");
                    Ok(())
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e.context(
                    "unassign connectivity templates",
                    state.blueprint_id.as_str(),
                    Some(state.application_point_id.to_string()),
                )),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryFabric;

    fn setup() -> (MemoryFabric, TemplateAssignmentResource) {
        let fabric = MemoryFabric::new();
        fabric.add_switch("bp", "leaf1", &["xe-0/0/1"]);
        let resource = TemplateAssignmentResource::new(Arc::new(fabric.clone()), true);
        (fabric, resource)
    }

    // The first port added to a fresh fabric gets interface ID "if-1".
    const AP: &str = "if-1";

    #[tokio::test]
    async fn create_assigns_all_templates() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let spec = TemplateAssignmentSpec::new("bp", AP, ["ct-1", "ct-2"]);

        let state = resource.create(&spec, &cancel).await.into_result().unwrap();
        assert_eq!(state.template_ids.len(), 2);
        assert_eq!(
            fabric.calls(),
            vec!["lock bp", "set_application_point_templates if-1", "unlock bp"]
        );
    }

    #[tokio::test]
    async fn foreign_templates_are_left_alone() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        fabric.assign_template("bp", AP, "ct-foreign");

        let state = resource
            .create(&TemplateAssignmentSpec::new("bp", AP, ["ct-1"]), &cancel)
            .await
            .into_result()
            .unwrap();
        let read = resource.read(&state, &cancel).await.unwrap().unwrap();
        assert_eq!(read.template_ids, state.template_ids);

        let spec = TemplateAssignmentSpec::new("bp", AP, ["ct-2"]);
        let state = resource.update(&spec, &state, &cancel).await.into_result().unwrap();
        let bp = resource.client.blueprint(&ObjectId::new("bp")).await.unwrap();
        let attached = bp.get_application_point_templates(&ObjectId::new(AP)).await.unwrap();
        assert_eq!(
            attached,
            BTreeSet::from([ObjectId::new("ct-2"), ObjectId::new("ct-foreign")])
        );

        resource.delete(&state, &cancel).await.unwrap();
        let attached = bp.get_application_point_templates(&ObjectId::new(AP)).await.unwrap();
        assert_eq!(attached, BTreeSet::from([ObjectId::new("ct-foreign")]));
    }

    #[tokio::test]
    async fn unchanged_set_makes_no_calls() {
        let (fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let spec = TemplateAssignmentSpec::new("bp", AP, ["ct-1"]);
        let state = resource.create(&spec, &cancel).await.into_result().unwrap();
        fabric.clear_calls();

        let outcome = resource.update(&spec, &state, &cancel).await;
        assert_eq!(outcome.changes, 0);
        assert_eq!(fabric.calls(), vec!["lock bp", "unlock bp"]);
    }

    #[tokio::test]
    async fn missing_application_point() {
        let (_fabric, resource) = setup();
        let cancel = CancellationToken::new();
        let state = TemplateAssignmentState {
            blueprint_id: ObjectId::new("bp"),
            application_point_id: ObjectId::new("if-404"),
            template_ids: [ObjectId::new("ct-1")].into(),
        };

        assert!(resource.read(&state, &cancel).await.unwrap().is_none());
        resource.delete(&state, &cancel).await.unwrap();

        let spec = TemplateAssignmentSpec::new("bp", "if-404", ["ct-1"]);
        let err = resource.create(&spec, &cancel).await.into_result().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn empty_template_set_is_invalid() {
        let spec = TemplateAssignmentSpec::new("bp", AP, Vec::<String>::new());
        assert!(spec.validate().unwrap_err().is_validation());
    }
}
