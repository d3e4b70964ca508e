// # Apstra Fabric Client
//
// This crate provides the Apstra controller client for the fabric
// reconciliation system.
//
// ## Implementation Status
//
// - ✅ Session login (`POST /api/aaa/login`, `AuthToken` header), reused per client
// - ✅ HTTP timeout and optional TLS validation bypass
// - ✅ Specific error mapping for HTTP status codes (401/403, 404, 409/422, 5xx)
// - ✅ Blueprint mutex as an exclusive design tag, polled until the lock timeout
// - ✅ Graph queries (`POST /api/blueprints/{id}/qe`)
// - ❌ NO retry logic (a failed call is reported once)
// - ❌ NO caching beyond the session token
// - ❌ NO background tasks
//
// ## Architectural Constraints
//
// ### Trust Level: Untrusted (Fabric Client)
//
// **Allowed Capabilities**:
// - ✅ Perform HTTP/HTTPS API calls to the configured controller only
// - ✅ Sleep between mutex attempts, bounded by the lock timeout
// - ✅ Parse controller-specific responses
//
// **Forbidden Capabilities**:
// - ❌ Retry failed mutations
// - ❌ Access the state store
// - ❌ Decide what to change (owned by fabric-core)
//
// ## Security Requirements
//
// - The password NEVER appears in logs or `Debug` output
// - Construction fails fast when credentials are missing
//
// ## API Reference
//
// - Login: POST `/api/aaa/login`
// - Nodes: GET/PATCH/DELETE `/api/blueprints/{bp}/nodes/{id}`
// - Links: POST `/api/blueprints/{bp}/switch-system-links`,
//   POST `/api/blueprints/{bp}/delete-switch-system-links`,
//   PATCH `/api/blueprints/{bp}/leaf-server-link-labels`
// - Connectivity templates: GET `/api/blueprints/{bp}/obj-policy-application-points/{id}`,
//   PATCH `/api/blueprints/{bp}/obj-policy-batch-apply`
// - Mutex tags: POST `/api/design/tags`, DELETE `/api/design/tags/{id}`

mod blueprint;
mod session;

pub use blueprint::ApstraBlueprint;

use async_trait::async_trait;
use fabric_core::config::ClientConfig;
use fabric_core::model::ObjectId;
use fabric_core::traits::{BlueprintClient, FabricClient, FabricClientFactory};
use fabric_core::{ClientRegistry, Error, Result};
use reqwest::Method;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use session::{Session, Target, error_detail, parse_body, status_error};

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for a blueprint mutex held elsewhere
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Default delay between mutex attempts
const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Label prefix of the design tag standing in for a blueprint mutex
const MUTEX_TAG_PREFIX: &str = "blueprint-mutex-";

/// Design tags endpoint
const TAGS_PATH: &str = "/api/design/tags";

/// Connection settings for [`ApstraClient`]
#[derive(Clone)]
pub struct ApstraSettings {
    /// Base URL, e.g. "https://apstra.example.com"
    pub url: String,
    /// Login user
    pub username: String,
    /// Login password
    /// ⚠️ NEVER log this value
    pub password: String,
    /// Skip TLS certificate validation
    pub tls_validation_disabled: bool,
    /// Per-request timeout
    pub timeout: Duration,
    /// How long to wait for a blueprint mutex held by someone else
    pub lock_timeout: Duration,
    /// Delay between mutex attempts
    pub lock_poll_interval: Duration,
}

impl ApstraSettings {
    /// Settings with default timeouts
    pub fn new(url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
            tls_validation_disabled: false,
            timeout: DEFAULT_HTTP_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}

// Custom Debug implementation that hides the password
impl std::fmt::Debug for ApstraSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApstraSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .field("tls_validation_disabled", &self.tls_validation_disabled)
            .field("timeout", &self.timeout)
            .field("lock_timeout", &self.lock_timeout)
            .field("lock_poll_interval", &self.lock_poll_interval)
            .finish()
    }
}

/// Apstra fabric client
///
/// # Trust Level: Untrusted
///
/// Stateless apart from the session token and the IDs of mutex tags this
/// client currently holds.
///
/// # Blueprint Mutex
///
/// Apstra has no lock endpoint. A blueprint is locked by creating a design
/// tag named `blueprint-mutex-<id>`; the controller rejects a second tag
/// with the same label, so only one holder can succeed. The tag description
/// records this client's owner ID.
pub struct ApstraClient {
    session: Arc<Session>,
    owner: String,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
    held: Mutex<HashMap<ObjectId, String>>,
}

impl std::fmt::Debug for ApstraClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApstraClient")
            .field("session", &self.session)
            .field("owner", &self.owner)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl ApstraClient {
    /// Create a client; no request is made until first use
    ///
    /// # Errors
    ///
    /// `Error::Config` when credentials are missing or the HTTP client
    /// cannot be built.
    pub fn new(settings: ApstraSettings) -> Result<Self> {
        if settings.username.is_empty() || settings.password.is_empty() {
            return Err(Error::config("Apstra username and password are required"));
        }
        if settings.tls_validation_disabled {
            tracing::warn!(url = %settings.url, "TLS certificate validation disabled for Apstra");
        }

        let session = Session::new(
            &settings.url,
            settings.username,
            settings.password,
            settings.timeout,
            settings.tls_validation_disabled,
        )?;

        Ok(Self {
            session: Arc::new(session),
            owner: uuid::Uuid::new_v4().to_string(),
            lock_timeout: settings.lock_timeout,
            lock_poll_interval: settings.lock_poll_interval,
            held: Mutex::new(HashMap::new()),
        })
    }

    fn mutex_label(blueprint_id: &ObjectId) -> String {
        format!("{MUTEX_TAG_PREFIX}{blueprint_id}")
    }

    /// One attempt at creating the mutex tag
    ///
    /// Returns `Ok(false)` when someone else holds it.
    async fn try_lock(&self, blueprint_id: &ObjectId) -> Result<bool> {
        let target = Target {
            operation: "lock blueprint",
            blueprint: blueprint_id.as_str(),
            object: None,
        };
        let body = json!({
            "label": Self::mutex_label(blueprint_id),
            "description": self.owner,
        });
        let (status, text) = self
            .session
            .send(Method::POST, TAGS_PATH, Some(&body), target)
            .await
            .map_err(|e| Error::lock(blueprint_id.as_str(), e.to_string()))?;

        match status.as_u16() {
            200..=299 => {
                let created =
                    parse_body(&text, target).map_err(|e| Error::lock(blueprint_id.as_str(), e.to_string()))?;
                let tag_id = created["id"]
                    .as_str()
                    .ok_or_else(|| Error::lock(blueprint_id.as_str(), "Invalid response format: tag id missing"))?;
                self.held
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(blueprint_id.clone(), tag_id.to_string());
                Ok(true)
            }
            409 | 422 => {
                tracing::debug!(blueprint = %blueprint_id, detail = %error_detail(&text), "Blueprint mutex busy");
                Ok(false)
            }
            _ => Err(Error::lock(
                blueprint_id.as_str(),
                status_error(status, &text, target).to_string(),
            )),
        }
    }
}

#[async_trait]
impl FabricClient for ApstraClient {
    /// GET /api/blueprints/{id}
    async fn blueprint(&self, blueprint_id: &ObjectId) -> Result<Arc<dyn BlueprintClient>> {
        self.session
            .call(
                Method::GET,
                &format!("/api/blueprints/{blueprint_id}"),
                None,
                Target {
                    operation: "get blueprint",
                    blueprint: blueprint_id.as_str(),
                    object: None,
                },
            )
            .await?;
        Ok(Arc::new(ApstraBlueprint::new(self.session.clone(), blueprint_id.clone())))
    }

    /// Polls POST /api/design/tags until the mutex tag is ours
    ///
    /// A request in flight is always completed so a created tag is recorded
    /// and can be deleted; cancellation only ends the sleep between polls.
    async fn lock_blueprint(&self, blueprint_id: &ObjectId, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            if self.try_lock(blueprint_id).await? {
                tracing::debug!(blueprint = %blueprint_id, owner = %self.owner, "Blueprint mutex acquired");
                return Ok(());
            }
            if Instant::now() + self.lock_poll_interval > deadline {
                return Err(Error::lock(
                    blueprint_id.as_str(),
                    format!("still held by another session after {}s", self.lock_timeout.as_secs()),
                ));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(blueprint = %blueprint_id, "Gave up waiting for blueprint mutex");
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.lock_poll_interval) => {}
            }
        }
    }

    async fn unlock_blueprint(&self, blueprint_id: &ObjectId) -> Result<()> {
        let tag_id = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(blueprint_id);
        let Some(tag_id) = tag_id else {
            tracing::warn!(blueprint = %blueprint_id, "Unlock requested for a mutex this client does not hold");
            return Ok(());
        };

        let target = Target {
            operation: "unlock blueprint",
            blueprint: blueprint_id.as_str(),
            object: Some(tag_id.as_str()),
        };
        match self
            .session
            .call(Method::DELETE, &format!("{TAGS_PATH}/{tag_id}"), None, target)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::lock(blueprint_id.as_str(), e.to_string())),
        }
    }

    fn client_name(&self) -> &'static str {
        "apstra"
    }
}

/// Factory for creating Apstra clients
pub struct ApstraClientFactory;

impl FabricClientFactory for ApstraClientFactory {
    fn create(&self, config: &ClientConfig) -> Result<Arc<dyn FabricClient>> {
        match config {
            ClientConfig::Apstra {
                url,
                username,
                password,
                tls_validation_disabled,
                timeout_secs,
                lock_timeout_secs,
                lock_poll_interval_ms,
            } => {
                let settings = ApstraSettings {
                    url: url.clone(),
                    username: username.clone(),
                    password: password.clone(),
                    tls_validation_disabled: *tls_validation_disabled,
                    timeout: Duration::from_secs(*timeout_secs),
                    lock_timeout: Duration::from_secs(*lock_timeout_secs),
                    lock_poll_interval: Duration::from_millis(*lock_poll_interval_ms),
                };
                Ok(Arc::new(ApstraClient::new(settings)?))
            }
            other => Err(Error::config(format!(
                "apstra client factory cannot build a '{}' client",
                other.type_name()
            ))),
        }
    }
}

/// Register the Apstra client with a registry
///
/// # Example
///
/// ```rust
/// use fabric_core::ClientRegistry;
///
/// let registry = ClientRegistry::with_defaults();
/// fabric_client_apstra::register(&registry);
/// assert!(registry.has_client("apstra"));
/// ```
pub fn register(registry: &ClientRegistry) {
    registry.register_client("apstra", Box::new(ApstraClientFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(password: &str) -> ClientConfig {
        ClientConfig::Apstra {
            url: "https://apstra.example.com".into(),
            username: "admin".into(),
            password: password.into(),
            tls_validation_disabled: false,
            timeout_secs: 30,
            lock_timeout_secs: 120,
            lock_poll_interval_ms: 500,
        }
    }

    #[test]
    fn factory_builds_apstra_client() {
        let client = ApstraClientFactory.create(&config("secret")).unwrap();
        assert_eq!(client.client_name(), "apstra");
    }

    #[test]
    fn factory_rejects_other_configs() {
        let result = ApstraClientFactory.create(&ClientConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn missing_password_is_rejected() {
        let result = ApstraClientFactory.create(&config(""));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn password_not_exposed_in_debug() {
        let settings = ApstraSettings::new("https://apstra.example.com", "admin", "secret_password_12345");
        assert!(!format!("{settings:?}").contains("secret_password_12345"));

        let client = ApstraClient::new(settings).unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret_password_12345"));
        assert!(debug.contains("ApstraClient"));
    }

    #[test]
    fn settings_use_default_timeouts() {
        let settings = ApstraSettings::new("https://apstra.example.com", "admin", "pw");
        assert_eq!(settings.timeout, DEFAULT_HTTP_TIMEOUT);
        assert_eq!(settings.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(settings.lock_poll_interval, DEFAULT_LOCK_POLL_INTERVAL);
    }

    #[test]
    fn register_adds_apstra() {
        let registry = ClientRegistry::with_defaults();
        register(&registry);
        assert!(registry.has_client("apstra"));
        assert!(registry.has_client("memory"));
    }

    #[tokio::test]
    async fn unlock_without_lock_is_a_no_op() {
        let client = ApstraClient::new(ApstraSettings::new("https://apstra.invalid", "admin", "pw")).unwrap();
        client.unlock_blueprint(&ObjectId::new("bp")).await.unwrap();
    }

    #[test]
    fn mutex_label_names_blueprint() {
        assert_eq!(ApstraClient::mutex_label(&ObjectId::new("bp-1")), "blueprint-mutex-bp-1");
    }
}
