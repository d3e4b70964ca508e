//! Authenticated HTTP session against one Apstra controller
//!
//! The session logs in lazily on the first request and reuses the token
//! for the lifetime of the client. Every request is sent exactly once.

use fabric_core::{Error, Result};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;

/// Header carrying the session token
const AUTH_HEADER: &str = "AuthToken";

/// Login endpoint
const LOGIN_PATH: &str = "/api/aaa/login";

/// What a request is for, used to build error context
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    pub operation: &'a str,
    pub blueprint: &'a str,
    pub object: Option<&'a str>,
}

impl Target<'_> {
    /// Remote error carrying this target's context
    pub(crate) fn error(&self, message: impl Into<String>) -> Error {
        Error::remote(
            self.operation,
            self.blueprint,
            self.object.map(str::to_string),
            message,
        )
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

pub(crate) struct Session {
    http: reqwest::Client,
    base_url: String,
    username: String,
    /// ⚠️ NEVER log this value
    password: String,
    token: RwLock<Option<String>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
        tls_validation_disabled: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(tls_validation_disabled)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: url.trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            token: RwLock::new(None),
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    /// POST /api/aaa/login
    async fn login(&self) -> Result<String> {
        tracing::debug!(url = %self.base_url, user = %self.username, "Logging in to Apstra");

        let target = Target {
            operation: "login",
            blueprint: "-",
            object: None,
        };
        let response = self
            .http
            .post(format!("{}{LOGIN_PATH}", self.base_url))
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(|e| target.error(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, target));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| target.error(format!("Failed to parse login response: {e}")))?;
        tracing::info!(url = %self.base_url, "Apstra session established");
        Ok(login.token)
    }

    /// Send one request and return the raw status and body
    ///
    /// Only transport failures are errors here; status handling is left to
    /// the caller.
    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        target: Target<'_>,
    ) -> Result<(StatusCode, String)> {
        let token = self.token().await?;
        tracing::debug!(method = %method, path, operation = target.operation, "Apstra request");

        let mut request = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .header(AUTH_HEADER, token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| target.error(format!("HTTP request failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| target.error(format!("Failed to read response: {e}")))?;
        Ok((status, text))
    }

    /// Send one request; non-2xx statuses become errors
    ///
    /// Returns `Value::Null` for an empty body.
    pub(crate) async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        target: Target<'_>,
    ) -> Result<Value> {
        let (status, text) = self.send(method, path, body, target).await?;
        if !status.is_success() {
            return Err(status_error(status, &text, target));
        }
        parse_body(&text, target)
    }
}

pub(crate) fn parse_body(text: &str, target: Target<'_>) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| target.error(format!("Failed to parse response: {e}")))
}

/// Map a non-success HTTP status to an error
///
/// 404 is the only status reported as `NotFound`. Nothing here is retried;
/// 5xx responses are labelled transient for the operator.
pub(crate) fn status_error(status: StatusCode, body: &str, target: Target<'_>) -> Error {
    let detail = error_detail(body);
    match status.as_u16() {
        404 => Error::not_found(match target.object {
            Some(object) => format!("{} {object} (blueprint {})", target.operation, target.blueprint),
            None => format!("{} (blueprint {})", target.operation, target.blueprint),
        }),
        401 | 403 => target.error(format!(
            "Authentication failed: invalid credentials or insufficient permissions. Status: {status}"
        )),
        409 | 422 => target.error(format!("Rejected by controller ({status}): {detail}")),
        500..=599 => target.error(format!("Apstra server error (transient): {status} - {detail}")),
        _ => target.error(format!("Unexpected status {status}: {detail}")),
    }
}

/// Human-readable part of an Apstra error body
///
/// Error bodies look like `{"errors": ...}` or `{"error": "..."}`; anything
/// else is returned trimmed.
pub(crate) fn error_detail(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => match value.get("errors").or_else(|| value.get("error")) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => value.to_string(),
        },
        Err(_) => body.trim().to_string(),
    }
}
