//! Generic system links
//!
//! A link attaches a generic system to one fabric switch interface. The
//! switch ID and interface name form the natural key; everything else may
//! change in place without replacing the link.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::{DesiredEndpoint, Endpoint, ObjectId, RemoteEndpoint};
use crate::error::Error;

/// Natural key of a link: the switch and the interface it lands on
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    /// Node ID of the fabric switch
    #[serde(rename = "target_switch_id")]
    pub switch_id: ObjectId,
    /// Interface name on that switch (e.g. "xe-0/0/1")
    #[serde(rename = "target_switch_if_name")]
    pub if_name: String,
}

impl LinkKey {
    /// Build a key from a switch ID and interface name
    pub fn new(switch_id: impl Into<ObjectId>, if_name: impl Into<String>) -> Self {
        Self {
            switch_id: switch_id.into(),
            if_name: if_name.into(),
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.switch_id, self.if_name)
    }
}

/// LAG mode applied to members of a link group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LagMode {
    /// LACP, actively negotiating
    #[serde(rename = "lacp_active")]
    LacpActive,
    /// LACP, passive
    #[serde(rename = "lacp_passive")]
    LacpPassive,
    /// Static aggregation without LACP
    #[serde(rename = "static_lag")]
    Static,
}

impl LagMode {
    /// Wire name of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            LagMode::LacpActive => "lacp_active",
            LagMode::LacpPassive => "lacp_passive",
            LagMode::Static => "static_lag",
        }
    }
}

impl fmt::Display for LagMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LagMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lacp_active" => Ok(LagMode::LacpActive),
            "lacp_passive" => Ok(LagMode::LacpPassive),
            "static_lag" => Ok(LagMode::Static),
            other => Err(Error::validation(
                "lag_mode",
                format!("unknown LAG mode {other:?}, expected lacp_active, lacp_passive or static_lag"),
            )),
        }
    }
}

/// A link as the configuration author wants it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLink {
    /// Switch and interface the link lands on
    #[serde(flatten)]
    pub key: LinkKey,
    /// Interface transform (speed/breakout) on the switch port
    #[serde(
        rename = "target_switch_if_transform_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub transform_id: Option<u32>,
    /// LAG group label; links sharing a label are aggregated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_label: Option<String>,
    /// LAG mode for the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag_mode: Option<LagMode>,
    /// Tags applied to the link
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl DesiredLink {
    /// A plain, ungrouped, untagged link
    pub fn new(switch_id: impl Into<ObjectId>, if_name: impl Into<String>) -> Self {
        Self {
            key: LinkKey::new(switch_id, if_name),
            transform_id: None,
            group_label: None,
            lag_mode: None,
            tags: BTreeSet::new(),
        }
    }

    /// Set the interface transform
    pub fn with_transform(mut self, transform_id: u32) -> Self {
        self.transform_id = Some(transform_id);
        self
    }

    /// Put the link into a LAG group
    pub fn with_group(mut self, label: impl Into<String>, mode: LagMode) -> Self {
        self.group_label = Some(label.into());
        self.lag_mode = Some(mode);
        self
    }

    /// Replace the tag set
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Label of the aggregate this link belongs to, if it is a LAG member
    pub fn lag_group(&self) -> Option<&str> {
        match (&self.group_label, self.lag_mode) {
            (Some(label), Some(_)) => Some(label.as_str()),
            _ => None,
        }
    }

    /// Whether only the transform differs from `observed`
    pub fn transform_differs(&self, observed: &ObservedLink) -> bool {
        self.transform_id.is_some() && self.transform_id != observed.transform_id
    }

    /// Whether label, mode or tags differ from `observed`
    pub fn lag_params_differ(&self, observed: &ObservedLink) -> bool {
        self.group_label != observed.group_label
            || self.lag_mode != observed.lag_mode
            || self.tags != observed.tags
    }
}

impl Endpoint for DesiredLink {
    type Key = LinkKey;

    fn natural_key(&self) -> LinkKey {
        self.key.clone()
    }
}

impl DesiredEndpoint for DesiredLink {
    type Observed = ObservedLink;

    fn differs_from(&self, observed: &ObservedLink) -> bool {
        self.transform_differs(observed) || self.lag_params_differ(observed)
    }
}

/// A link as reported by the remote system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedLink {
    /// Remote link ID
    pub id: ObjectId,
    /// Switch and interface the link lands on
    #[serde(flatten)]
    pub key: LinkKey,
    /// Current interface transform
    #[serde(default)]
    pub transform_id: Option<u32>,
    /// Current LAG group label
    #[serde(default)]
    pub group_label: Option<String>,
    /// Current LAG mode
    #[serde(default)]
    pub lag_mode: Option<LagMode>,
    /// Current tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Switch interface node ID, assigned by the remote system
    #[serde(default)]
    pub interface_id: Option<ObjectId>,
    /// Aggregate link ID when the link is a LAG member
    #[serde(default)]
    pub lag_id: Option<ObjectId>,
    /// Port-channel number computed for the aggregate
    #[serde(default)]
    pub port_channel_id: Option<u32>,
}

impl ObservedLink {
    /// Label of the aggregate this link belongs to, if it is a LAG member
    pub fn lag_group(&self) -> Option<&str> {
        match (&self.group_label, self.lag_mode) {
            (Some(label), Some(_)) => Some(label.as_str()),
            _ => None,
        }
    }

    /// The configuration that would reproduce this link exactly
    pub fn to_desired(&self) -> DesiredLink {
        DesiredLink {
            key: self.key.clone(),
            transform_id: self.transform_id,
            group_label: self.group_label.clone(),
            lag_mode: self.lag_mode,
            tags: self.tags.clone(),
        }
    }
}

impl Endpoint for ObservedLink {
    type Key = LinkKey;

    fn natural_key(&self) -> LinkKey {
        self.key.clone()
    }
}

impl RemoteEndpoint for ObservedLink {
    fn remote_id(&self) -> &ObjectId {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(id: &str, sw: &str, ifn: &str) -> ObservedLink {
        ObservedLink {
            id: ObjectId::new(id),
            key: LinkKey::new(sw, ifn),
            transform_id: Some(1),
            group_label: None,
            lag_mode: None,
            tags: BTreeSet::new(),
            interface_id: None,
            lag_id: None,
            port_channel_id: None,
        }
    }

    #[test]
    fn key_display_is_switch_colon_interface() {
        assert_eq!(LinkKey::new("sw1", "xe-0/0/1").to_string(), "sw1:xe-0/0/1");
    }

    #[test]
    fn unset_transform_is_not_drift() {
        let desired = DesiredLink::new("sw1", "xe-0/0/1");
        assert!(!desired.differs_from(&observed("l1", "sw1", "xe-0/0/1")));

        let desired = desired.with_transform(2);
        assert!(desired.differs_from(&observed("l1", "sw1", "xe-0/0/1")));
    }

    #[test]
    fn tag_change_is_drift() {
        let desired = DesiredLink::new("sw1", "xe-0/0/1").with_tags(["x"]);
        assert!(desired.lag_params_differ(&observed("l1", "sw1", "xe-0/0/1")));
    }

    #[test]
    fn group_requires_label_and_mode() {
        let mut link = DesiredLink::new("sw1", "xe-0/0/1");
        link.group_label = Some("a".into());
        assert_eq!(link.lag_group(), None);

        let link = link.with_group("a", LagMode::LacpActive);
        assert_eq!(link.lag_group(), Some("a"));
    }

    #[test]
    fn lag_mode_round_trips_wire_names() {
        for mode in [LagMode::LacpActive, LagMode::LacpPassive, LagMode::Static] {
            assert_eq!(mode.as_str().parse::<LagMode>().unwrap(), mode);
        }
        assert!("lacp".parse::<LagMode>().is_err());
    }

    #[test]
    fn desired_link_uses_attribute_names() {
        let link: DesiredLink = serde_json::from_value(serde_json::json!({
            "target_switch_id": "sw1",
            "target_switch_if_name": "xe-0/0/1",
            "target_switch_if_transform_id": 1,
            "group_label": "bond0",
            "lag_mode": "lacp_active",
            "tags": ["a", "b"]
        }))
        .unwrap();

        assert_eq!(link.key, LinkKey::new("sw1", "xe-0/0/1"));
        assert_eq!(link.transform_id, Some(1));
        assert_eq!(link.lag_group(), Some("bond0"));
        assert_eq!(link.tags.len(), 2);
    }
}
