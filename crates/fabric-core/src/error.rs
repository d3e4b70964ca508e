//! Error types for the fabric reconciliation system
//!
//! This module defines all error types used throughout the crate.
//!
//! The variants follow the propagation rules of the reconciliation engine:
//! - [`Error::NotFound`] is recoverable: Read drops the object from tracked
//!   state, Delete treats it as success, Update reports it.
//! - [`Error::Validation`] is raised before any remote call is issued.
//! - [`Error::Remote`] and [`Error::Lock`] are surfaced verbatim and never
//!   retried by this crate.

use thiserror::Error;

/// Result type alias for fabric operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the fabric reconciliation system
#[derive(Error, Debug)]
pub enum Error {
    /// The targeted remote object no longer exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// Desired configuration is self-inconsistent
    #[error("Invalid value for '{field}': {message}")]
    Validation {
        /// Logical attribute the error is attributed to (e.g. "links")
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// Any other failure reported by the external API client
    #[error("{operation} failed (blueprint {blueprint}{}): {message}", object_suffix(.object))]
    Remote {
        /// Operation that was being performed (e.g. "create link")
        operation: String,
        /// Blueprint the operation was scoped to
        blueprint: String,
        /// Object the operation targeted, when there is one
        object: Option<String>,
        /// Message returned by the client
        message: String,
    },

    /// Blueprint mutex could not be acquired or released
    #[error("Failed to lock blueprint {blueprint} mutex: {message}")]
    Lock {
        /// Blueprint whose mutex was requested
        blueprint: String,
        /// Reason
        message: String,
    },

    /// Links could not be deleted because connectivity templates are attached
    #[error("Connectivity templates assigned to links: {link_ids:?}")]
    TemplatesAssigned {
        /// Link IDs reported by the controller
        link_ids: Vec<String>,
    },

    /// The controller refused to change an interface transform
    #[error("Cannot change interface transform: {0}")]
    TransformImmutable(String),

    /// The caller's cancellation token fired before the next remote call
    #[error("Operation cancelled")]
    Cancelled,

    /// A batch of operations stopped partway through
    #[error("Apply stopped after {succeeded} of {total} operations; '{failed_operation}' failed: {source}")]
    PartialApply {
        /// Number of operations that completed
        succeeded: usize,
        /// Number of operations in the batch
        total: usize,
        /// Description of the operation that failed
        failed_operation: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// State store-related errors
    #[error("State store error: {0}")]
    StateStore(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a validation error attributed to `field`
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a remote error with blueprint/object context
    pub fn remote(
        operation: impl Into<String>,
        blueprint: impl Into<String>,
        object: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Remote {
            operation: operation.into(),
            blueprint: blueprint.into(),
            object,
            message: message.into(),
        }
    }

    /// Create a lock error
    pub fn lock(blueprint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lock {
            blueprint: blueprint.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a state store error
    pub fn state_store(msg: impl Into<String>) -> Self {
        Self::StateStore(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Whether this is a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this error was raised before any remote call
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Wrap an error from a client call with the operation context.
    ///
    /// NotFound, cancellation and controller conditions the engine handles
    /// (assigned templates, immutable transforms) pass through unchanged so
    /// callers can still match on them.
    pub fn context(
        self,
        operation: impl Into<String>,
        blueprint: impl Into<String>,
        object: Option<String>,
    ) -> Self {
        match self {
            Self::NotFound(_)
            | Self::Cancelled
            | Self::TemplatesAssigned { .. }
            | Self::TransformImmutable(_)
            | Self::Validation { .. }
            | Self::Lock { .. }
            | Self::Remote { .. } => self,
            other => Self::remote(operation, blueprint, object, other.to_string()),
        }
    }
}

fn object_suffix(object: &Option<String>) -> String {
    object
        .as_ref()
        .map(|o| format!(", object {o}"))
        .unwrap_or_default()
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
