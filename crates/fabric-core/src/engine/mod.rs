//! Core reconciliation engine
//!
//! The FabricEngine is responsible for:
//! - Matching configured resources against tracked state
//! - Creating, updating, replacing and deleting them through a FabricClient
//! - Persisting the state read back after every apply
//! - Reporting progress as events
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!  resources ────▶ │   FabricEngine   │ ────▶ EngineEvent (bounded channel)
//!                  └──────────────────┘
//!                           │
//!         ┌─────────────────┼──────────────────┐
//!         ▼                 ▼                  ▼
//! ┌──────────────┐  ┌───────────────┐  ┌──────────────┐
//! │  StateStore  │  │   Resource    │  │ FabricClient │
//! │ (tracked)    │  │ (CRUD + lock) │  │ (controller) │
//! └──────────────┘  └───────────────┘  └──────────────┘
//! ```
//!
//! ## Apply Flow
//!
//! For every configured address:
//!
//! 1. Untracked: create
//! 2. Tracked under another kind, or an immutable field changed: delete,
//!    then create
//! 3. Tracked: read; if the object is gone, create it again, otherwise
//!    update
//!
//! Tracked addresses missing from the configuration are deleted last,
//! template assignments before generic systems.
//!
//! A failure is recorded against its address and the engine moves on to the
//! next one. Cancellation stops the run after the current remote call.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, ResourceConfig, ResourceSpec};
use crate::error::{Error, Result};
use crate::resources::{GenericSystemResource, Resource, TemplateAssignmentResource};
use crate::traits::{FabricClient, ResourceKind, ResourceRecord, StateStore};

/// What the engine is about to do with one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    /// Nothing tracked yet
    Create,
    /// Tracked; refresh and reconcile
    Update,
    /// Tracked, but the object must be recreated
    Replace,
    /// Tracked, no longer configured
    Delete,
}

/// Events emitted by the FabricEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Run started
    Started {
        resources_count: usize,
    },

    /// Action chosen for an address
    PlanComputed {
        address: String,
        action: PlannedAction,
    },

    /// Object created (or recreated)
    ResourceCreated {
        address: String,
    },

    /// Object changed in place
    ResourceUpdated {
        address: String,
        changes: usize,
    },

    /// Object already matched its configuration
    ResourceUnchanged {
        address: String,
    },

    /// Tracked object was found missing on the controller
    ResourceRemoved {
        address: String,
    },

    /// Object deleted
    ResourceDeleted {
        address: String,
    },

    /// Processing an address failed
    ResourceFailed {
        address: String,
        error: String,
    },

    /// Run finished
    Stopped {
        reason: String,
    },
}

/// Counts of what a run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Objects found missing on the controller
    pub removed: usize,
    /// Controller warnings that did not fail an address
    pub warnings: Vec<String>,
    /// (address, error message) per failed address
    pub failed: Vec<(String, String)>,
}

impl RunSummary {
    /// Whether every address was processed without error
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Applied {
    Created,
    Updated(usize),
    Unchanged,
}

/// Core reconciliation engine
///
/// ## Lifecycle
///
/// 1. Create with [`FabricEngine::new()`]
/// 2. Call [`apply`](FabricEngine::apply), [`refresh`](FabricEngine::refresh)
///    or [`destroy`](FabricEngine::destroy)
/// 3. Drain the event receiver as needed
///
/// ## Load Resistance
///
/// Events go through a bounded channel. When it is full, new events are
/// dropped with a warning instead of blocking the run.
pub struct FabricEngine {
    /// Controller client
    client: Arc<dyn FabricClient>,

    /// Tracked state
    state_store: Box<dyn StateStore>,

    systems: GenericSystemResource,
    assignments: TemplateAssignmentResource,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<EngineEvent>,
}

impl FabricEngine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        client: Arc<dyn FabricClient>,
        state_store: Box<dyn StateStore>,
        config: &EngineConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let locking = !config.blueprint_mutex_disabled;
        if !locking {
            warn!("blueprint mutex disabled; concurrent writers may interfere");
        }

        let engine = Self {
            systems: GenericSystemResource::new(client.clone(), locking),
            assignments: TemplateAssignmentResource::new(client.clone(), locking),
            client,
            state_store,
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// Name of the controller client in use
    pub fn client_name(&self) -> &'static str {
        self.client.client_name()
    }

    /// Make the controller match `resources`
    ///
    /// # Returns
    ///
    /// - `Ok(summary)`: every address was attempted; per-address failures
    ///   are listed in the summary
    /// - `Err(Error::Cancelled)`: the token fired; state of completed work
    ///   is still saved
    /// - `Err(Error)`: configuration or state store failure
    pub async fn apply(&self, resources: &[ResourceConfig], cancel: &CancellationToken) -> Result<RunSummary> {
        let mut seen = std::collections::BTreeSet::new();
        for resource in resources {
            if !seen.insert(resource.address.as_str()) {
                return Err(Error::config(format!("Resource address '{}' is used twice", resource.address)));
            }
            resource.spec.validate()?;
        }

        self.emit_event(EngineEvent::Started {
            resources_count: resources.len(),
        });
        let mut summary = RunSummary::default();

        for resource in resources {
            if cancel.is_cancelled() {
                return self.stop_cancelled().await;
            }
            let result = match &resource.spec {
                ResourceSpec::GenericSystem(spec) => {
                    self.apply_resource(&self.systems, &resource.address, spec, &mut summary, cancel)
                        .await
                }
                ResourceSpec::TemplateAssignment(spec) => {
                    self.apply_resource(&self.assignments, &resource.address, spec, &mut summary, cancel)
                        .await
                }
            };
            match result {
                Ok(Applied::Created) => {
                    summary.created += 1;
                    self.emit_event(EngineEvent::ResourceCreated {
                        address: resource.address.clone(),
                    });
                }
                Ok(Applied::Updated(changes)) => {
                    summary.updated += 1;
                    self.emit_event(EngineEvent::ResourceUpdated {
                        address: resource.address.clone(),
                        changes,
                    });
                }
                Ok(Applied::Unchanged) => {
                    summary.unchanged += 1;
                    self.emit_event(EngineEvent::ResourceUnchanged {
                        address: resource.address.clone(),
                    });
                }
                Err(Error::Cancelled) => return self.stop_cancelled().await,
                Err(e) => self.record_failure(&mut summary, &resource.address, &e),
            }
        }

        let mut orphans = Vec::new();
        for address in self.state_store.list_resources().await? {
            if !seen.contains(address.as_str())
                && let Some(record) = self.state_store.get_resource(&address).await?
            {
                orphans.push((address, record));
            }
        }
        self.delete_all(orphans, &mut summary, cancel).await?;

        self.finish(&summary, "apply complete").await?;
        Ok(summary)
    }

    /// Re-read every tracked resource and drop the ones that are gone
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let addresses = self.state_store.list_resources().await?;
        self.emit_event(EngineEvent::Started {
            resources_count: addresses.len(),
        });
        let mut summary = RunSummary::default();

        for address in addresses {
            if cancel.is_cancelled() {
                return self.stop_cancelled().await;
            }
            let Some(record) = self.state_store.get_resource(&address).await? else {
                continue;
            };
            let result = match record.kind {
                ResourceKind::GenericSystem => self.refresh_resource(&self.systems, &address, record, cancel).await,
                ResourceKind::TemplateAssignment => {
                    self.refresh_resource(&self.assignments, &address, record, cancel).await
                }
            };
            match result {
                Ok(true) => summary.unchanged += 1,
                Ok(false) => {
                    summary.removed += 1;
                    self.emit_event(EngineEvent::ResourceRemoved { address });
                }
                Err(Error::Cancelled) => return self.stop_cancelled().await,
                Err(e) => self.record_failure(&mut summary, &address, &e),
            }
        }

        self.finish(&summary, "refresh complete").await?;
        Ok(summary)
    }

    /// Delete every tracked resource
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let mut tracked = Vec::new();
        for address in self.state_store.list_resources().await? {
            if let Some(record) = self.state_store.get_resource(&address).await? {
                tracked.push((address, record));
            }
        }
        self.emit_event(EngineEvent::Started {
            resources_count: tracked.len(),
        });

        let mut summary = RunSummary::default();
        self.delete_all(tracked, &mut summary, cancel).await?;
        self.finish(&summary, "destroy complete").await?;
        Ok(summary)
    }

    async fn apply_resource<R: Resource>(
        &self,
        resource: &R,
        address: &str,
        spec: &R::Spec,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) -> Result<Applied> {
        let tracked = match self.state_store.get_resource(address).await? {
            Some(record) if record.kind == R::KIND => Some(decode::<R>(address, record)?),
            Some(record) => {
                info!(address, from = %record.kind, to = %R::KIND, "resource kind changed; replacing");
                self.emit_event(EngineEvent::PlanComputed {
                    address: address.to_string(),
                    action: PlannedAction::Replace,
                });
                self.delete_record(address, record, cancel).await?;
                None
            }
            None => None,
        };

        let current = match tracked {
            Some(state) if R::requires_replace(spec, &state) => {
                info!(address, "immutable attribute changed; replacing");
                self.emit_event(EngineEvent::PlanComputed {
                    address: address.to_string(),
                    action: PlannedAction::Replace,
                });
                resource.delete(&state, cancel).await?;
                self.state_store.delete_resource(address).await?;
                summary.deleted += 1;
                self.emit_event(EngineEvent::ResourceDeleted {
                    address: address.to_string(),
                });
                None
            }
            Some(state) => match resource.read(&state, cancel).await? {
                Some(fresh) => {
                    self.store::<R>(address, &fresh).await?;
                    Some(fresh)
                }
                None => {
                    warn!(address, "resource missing on the controller; recreating");
                    self.state_store.delete_resource(address).await?;
                    summary.removed += 1;
                    self.emit_event(EngineEvent::ResourceRemoved {
                        address: address.to_string(),
                    });
                    None
                }
            },
            None => None,
        };

        let outcome = match &current {
            Some(state) => {
                self.emit_event(EngineEvent::PlanComputed {
                    address: address.to_string(),
                    action: PlannedAction::Update,
                });
                resource.update(spec, state, cancel).await
            }
            None => {
                self.emit_event(EngineEvent::PlanComputed {
                    address: address.to_string(),
                    action: PlannedAction::Create,
                });
                resource.create(spec, cancel).await
            }
        };

        if let Some(state) = &outcome.state {
            self.store::<R>(address, state).await?;
        }
        for warning in &outcome.warnings {
            warn!(address, "{warning}");
        }
        summary.warnings.extend(outcome.warnings);
        if let Some(e) = outcome.error {
            return Err(e);
        }

        Ok(match (current, outcome.changes) {
            (None, _) => Applied::Created,
            (Some(_), 0) => Applied::Unchanged,
            (Some(_), changes) => Applied::Updated(changes),
        })
    }

    /// `Ok(false)` when the object is gone and has been dropped from state
    async fn refresh_resource<R: Resource>(
        &self,
        resource: &R,
        address: &str,
        record: ResourceRecord,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let state = decode::<R>(address, record)?;
        match resource.read(&state, cancel).await? {
            Some(fresh) => {
                self.store::<R>(address, &fresh).await?;
                Ok(true)
            }
            None => {
                self.state_store.delete_resource(address).await?;
                Ok(false)
            }
        }
    }

    async fn delete_all(
        &self,
        mut tracked: Vec<(String, ResourceRecord)>,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Templates on a link block deletion of its generic system.
        tracked.sort_by_key(|(address, record)| (record.kind == ResourceKind::GenericSystem, address.clone()));

        for (address, record) in tracked {
            if cancel.is_cancelled() {
                return self.stop_cancelled().await;
            }
            self.emit_event(EngineEvent::PlanComputed {
                address: address.clone(),
                action: PlannedAction::Delete,
            });
            match self.delete_record(&address, record, cancel).await {
                Ok(()) => summary.deleted += 1,
                Err(Error::Cancelled) => return self.stop_cancelled().await,
                Err(e) => self.record_failure(summary, &address, &e),
            }
        }
        Ok(())
    }

    async fn delete_record(&self, address: &str, record: ResourceRecord, cancel: &CancellationToken) -> Result<()> {
        match record.kind {
            ResourceKind::GenericSystem => {
                let state = decode::<GenericSystemResource>(address, record)?;
                self.systems.delete(&state, cancel).await?;
            }
            ResourceKind::TemplateAssignment => {
                let state = decode::<TemplateAssignmentResource>(address, record)?;
                self.assignments.delete(&state, cancel).await?;
            }
        }
        self.state_store.delete_resource(address).await?;
        info!(address, "deleted resource");
        self.emit_event(EngineEvent::ResourceDeleted {
            address: address.to_string(),
        });
        Ok(())
    }

    async fn store<R: Resource>(&self, address: &str, state: &R::State) -> Result<()> {
        let record = ResourceRecord::new(R::KIND, serde_json::to_value(state)?);
        self.state_store.set_resource(address, &record).await
    }

    fn record_failure(&self, summary: &mut RunSummary, address: &str, e: &Error) {
        error!(address, error = %e, "resource failed");
        summary.failed.push((address.to_string(), e.to_string()));
        self.emit_event(EngineEvent::ResourceFailed {
            address: address.to_string(),
            error: e.to_string(),
        });
    }

    async fn finish(&self, summary: &RunSummary, reason: &str) -> Result<()> {
        self.state_store.flush().await?;
        info!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            deleted = summary.deleted,
            failed = summary.failed.len(),
            "{reason}"
        );
        self.emit_event(EngineEvent::Stopped {
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn stop_cancelled<T>(&self) -> Result<T> {
        warn!("run cancelled");
        if let Err(e) = self.state_store.flush().await {
            error!(error = %e, "failed to flush state after cancellation");
        }
        self.emit_event(EngineEvent::Stopped {
            reason: "cancelled".to_string(),
        });
        Err(Error::Cancelled)
    }

    /// Emit an engine event
    fn emit_event(&self, event: EngineEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("event receiver dropped"),
        }
    }
}

fn decode<R: Resource>(address: &str, record: ResourceRecord) -> Result<R::State> {
    serde_json::from_value(record.state)
        .map_err(|e| Error::state_store(format!("tracked state of '{address}' is unreadable: {e}")))
}
