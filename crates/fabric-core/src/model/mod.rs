//! Typed endpoint models
//!
//! Every managed collection (links of a generic system, connectivity
//! templates bound to an application point) is decoded once into these
//! structs. Identity is always the natural key; remote object IDs are only
//! carried on the observed side.

pub mod binding;
pub mod link;

pub use binding::{ObservedBinding, TemplateBinding};
pub use link::{DesiredLink, LagMode, LinkKey, ObservedLink};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier assigned by the remote system
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wrap a remote identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Anything that carries a natural key
pub trait Endpoint {
    /// Composite key that determines identity
    type Key: Ord + Clone + fmt::Display;

    /// Natural key of this endpoint
    fn natural_key(&self) -> Self::Key;
}

/// An endpoint taken from the desired configuration
pub trait DesiredEndpoint: Endpoint {
    /// The remote representation matched against this endpoint
    type Observed: RemoteEndpoint<Key = Self::Key>;

    /// Whether any mutable attribute differs from the observed entry
    fn differs_from(&self, observed: &Self::Observed) -> bool;
}

/// An endpoint reported by the remote system
pub trait RemoteEndpoint: Endpoint {
    /// Remote-assigned identifier
    fn remote_id(&self) -> &ObjectId;
}
