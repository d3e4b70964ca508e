//! Managed resources
//!
//! Each resource exposes the Create/Read/Update/Delete lifecycle. Create,
//! Update and Delete hold the blueprint mutex for their whole body; Read
//! never locks.
//!
//! - [`generic_system`]: a generic system, its tags, properties and links
//! - [`template_assignment`]: connectivity templates on an application point

pub mod generic_system;
pub mod template_assignment;

pub use generic_system::{GenericSystemResource, GenericSystemSpec, GenericSystemState};
pub use template_assignment::{TemplateAssignmentResource, TemplateAssignmentSpec, TemplateAssignmentState};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::traits::ResourceKind;

/// Create/Read/Update/Delete lifecycle of one kind of managed object
#[async_trait]
pub trait Resource: Send + Sync {
    /// Desired configuration
    type Spec: Send + Sync;
    /// Tracked state, persisted between runs
    type State: Serialize + DeserializeOwned + Send + Sync;

    /// Kind recorded in tracked state
    const KIND: ResourceKind;

    /// Whether `spec` can only be reached by deleting and recreating
    fn requires_replace(spec: &Self::Spec, state: &Self::State) -> bool;

    /// Create the object
    async fn create(&self, spec: &Self::Spec, cancel: &CancellationToken) -> Outcome<Self::State>;

    /// Re-read the object; `Ok(None)` when it no longer exists
    async fn read(&self, state: &Self::State, cancel: &CancellationToken) -> Result<Option<Self::State>>;

    /// Bring the object from `state` to `spec`
    async fn update(&self, spec: &Self::Spec, state: &Self::State, cancel: &CancellationToken) -> Outcome<Self::State>;

    /// Delete the object; absence is success
    async fn delete(&self, state: &Self::State, cancel: &CancellationToken) -> Result<()>;
}

/// Result of a Create or Update
///
/// A failed Create may still have produced a remote object; `state` then
/// carries what is known about it so it can be tracked and cleaned up.
#[derive(Debug)]
pub struct Outcome<S> {
    /// State to track, if any
    pub state: Option<S>,
    /// Number of remote mutations issued
    pub changes: usize,
    /// Non-fatal problems reported by the controller
    pub warnings: Vec<String>,
    /// Failure, if the call did not complete
    pub error: Option<Error>,
}

impl<S> Outcome<S> {
    /// Completed call
    pub fn applied(state: S, changes: usize, warnings: Vec<String>) -> Self {
        Self {
            state: Some(state),
            changes,
            warnings,
            error: None,
        }
    }

    /// Failed call
    pub fn failed(state: Option<S>, error: Error) -> Self {
        Self {
            state,
            changes: 0,
            warnings: Vec::new(),
            error: Some(error),
        }
    }

    /// Whether the call completed
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The new state, or the error
    pub fn into_result(self) -> Result<S> {
        match (self.error, self.state) {
            (Some(e), _) => Err(e),
            (None, Some(state)) => Ok(state),
            (None, None) => Err(Error::Other("operation produced no state".into())),
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
