//! Connectivity-template bindings on application points

use serde::{Deserialize, Serialize};

use super::{DesiredEndpoint, Endpoint, ObjectId, RemoteEndpoint};

/// A connectivity template that should be attached to an application point
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TemplateBinding {
    /// Interface or system node the template is applied to
    pub application_point_id: ObjectId,
    /// Connectivity template ID
    pub template_id: ObjectId,
}

impl TemplateBinding {
    /// Bind `template_id` to `application_point_id`
    pub fn new(application_point_id: impl Into<ObjectId>, template_id: impl Into<ObjectId>) -> Self {
        Self {
            application_point_id: application_point_id.into(),
            template_id: template_id.into(),
        }
    }
}

impl Endpoint for TemplateBinding {
    type Key = TemplateBinding;

    fn natural_key(&self) -> TemplateBinding {
        self.clone()
    }
}

impl std::fmt::Display for TemplateBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.template_id, self.application_point_id)
    }
}

impl DesiredEndpoint for TemplateBinding {
    type Observed = ObservedBinding;

    // A binding has no attributes besides its identity.
    fn differs_from(&self, _observed: &ObservedBinding) -> bool {
        false
    }
}

/// A binding reported by the remote system
///
/// The remote system does not assign the binding its own ID; the template
/// ID doubles as the remote identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedBinding {
    binding: TemplateBinding,
}

impl ObservedBinding {
    /// Wrap a binding read from the remote system
    pub fn new(binding: TemplateBinding) -> Self {
        Self { binding }
    }

    /// The binding itself
    pub fn binding(&self) -> &TemplateBinding {
        &self.binding
    }
}

impl Endpoint for ObservedBinding {
    type Key = TemplateBinding;

    fn natural_key(&self) -> TemplateBinding {
        self.binding.clone()
    }
}

impl RemoteEndpoint for ObservedBinding {
    fn remote_id(&self) -> &ObjectId {
        &self.binding.template_id
    }
}
