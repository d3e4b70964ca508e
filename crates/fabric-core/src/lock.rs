//! Blueprint mutex guard
//!
//! Mutations of one blueprint are serialized through an advisory mutex held
//! by the controller. [`BlueprintGuard`] holds it for the lifetime of a
//! Create/Update/Delete body:
//!
//! ```rust,ignore
//! let guard = BlueprintGuard::acquire(client.clone(), &bp_id, true, &cancel).await?;
//! // ... mutate ...
//! guard.release().await?;
//! ```
//!
//! If the body returns early or panics before `release`, dropping the guard
//! schedules the unlock on the current tokio runtime.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::model::ObjectId;
use crate::traits::FabricClient;

/// Holds a blueprint mutex until released or dropped
pub struct BlueprintGuard {
    client: Arc<dyn FabricClient>,
    blueprint_id: ObjectId,
    held: bool,
}

impl BlueprintGuard {
    /// Acquire the mutex of `blueprint_id`
    ///
    /// With `enabled == false` no remote call is made and the guard is
    /// inert. A cancelled token ends the wait between attempts; a lock
    /// obtained by an attempt already in flight is released before
    /// `Error::Cancelled` is returned.
    pub async fn acquire(
        client: Arc<dyn FabricClient>,
        blueprint_id: &ObjectId,
        enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut guard = Self {
            client,
            blueprint_id: blueprint_id.clone(),
            held: false,
        };
        if !enabled {
            debug!(blueprint = %blueprint_id, "blueprint mutex disabled");
            return Ok(guard);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        guard
            .client
            .lock_blueprint(blueprint_id, cancel)
            .await
            .map_err(|e| match e {
                Error::Lock { .. } | Error::Cancelled => e,
                other => Error::lock(blueprint_id.as_str(), other.to_string()),
            })?;
        guard.held = true;
        debug!(blueprint = %blueprint_id, "blueprint mutex acquired");

        if cancel.is_cancelled() {
            guard.release().await?;
            return Err(Error::Cancelled);
        }
        Ok(guard)
    }

    /// Blueprint this guard covers
    pub fn blueprint_id(&self) -> &ObjectId {
        &self.blueprint_id
    }

    /// Whether the mutex is currently held by this guard
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Release the mutex now
    pub async fn release(mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        self.client
            .unlock_blueprint(&self.blueprint_id)
            .await
            .map_err(|e| Error::lock(self.blueprint_id.as_str(), format!("unlock failed: {e}")))?;
        debug!(blueprint = %self.blueprint_id, "blueprint mutex released");
        Ok(())
    }
}

impl Drop for BlueprintGuard {
    fn drop(&mut self) {
        if self.held {
            self.held = false;
            spawn_unlock(self.client.clone(), self.blueprint_id.clone());
        }
    }
}

fn spawn_unlock(client: Arc<dyn FabricClient>, blueprint_id: ObjectId) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match client.unlock_blueprint(&blueprint_id).await {
                    Ok(()) => debug!(blueprint = %blueprint_id, "blueprint mutex released on drop"),
                    Err(e) => error!(blueprint = %blueprint_id, error = %e, "failed to release blueprint mutex"),
                }
            });
        }
        Err(_) => warn!(
            blueprint = %blueprint_id,
            "no runtime to release blueprint mutex; it stays held until removed on the controller"
        ),
    }
}

/// Run `body` while holding the mutex of `blueprint_id`
///
/// The mutex is released on every exit path. An error from `body` wins over
/// an error from the release.
pub async fn with_blueprint_lock<T, F, Fut>(
    client: Arc<dyn FabricClient>,
    blueprint_id: &ObjectId,
    enabled: bool,
    cancel: &CancellationToken,
    body: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let guard = BlueprintGuard::acquire(client, blueprint_id, enabled, cancel).await?;
    let result = body().await;
    let released = guard.release().await;

    match (result, released) {
        (Err(e), Err(unlock)) => {
            warn!(blueprint = %blueprint_id, error = %unlock, "unlock failed after error");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(unlock)) => Err(unlock),
        (Ok(value), Ok(())) => Ok(value),
    }
}
