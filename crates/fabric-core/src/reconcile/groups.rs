//! LAG group resolution
//!
//! The controller models a LAG as its own aggregate object, so group
//! membership is resolved before links are diffed: a label that appears
//! only in the desired set needs its aggregate created before any member
//! is assigned, a label that disappears needs its aggregate deleted after
//! the last member has left.
//!
//! Aggregates are taken from the controller as well as from member links,
//! so an aggregate left without members by an interrupted apply is kept when
//! still wanted and deleted otherwise.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::matcher::validate_unique;
use crate::error::{Error, Result};
use crate::model::{DesiredLink, LagMode, LinkKey, ObjectId, ObservedLink};

/// What happens to one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    /// New members appear under a label with no aggregate yet
    Create,
    /// Aggregate exists and stays
    Keep,
    /// Last member leaves
    Delete,
}

impl fmt::Display for GroupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GroupAction::Create => "create",
            GroupAction::Keep => "keep",
            GroupAction::Delete => "delete",
        })
    }
}

/// Group-level decision for one label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupChange {
    /// Group label
    pub label: String,
    /// Decision
    pub action: GroupAction,
    /// Desired LAG mode (absent for deletions)
    pub lag_mode: Option<LagMode>,
    /// Aggregate ID when the observed side knows it
    pub lag_id: Option<ObjectId>,
    /// Desired members
    pub members: BTreeSet<LinkKey>,
}

/// An existing link whose group changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMove {
    /// Link
    pub key: LinkKey,
    /// Group it leaves
    pub from: Option<String>,
    /// Group it joins
    pub to: Option<String>,
}

/// All group changes implied by a desired link set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPlan {
    /// One entry per label seen on either side, sorted by label
    pub changes: Vec<GroupChange>,
    /// Existing links that change group
    pub moves: Vec<GroupMove>,
}

impl GroupPlan {
    /// Groups that must be created
    pub fn creates(&self) -> impl Iterator<Item = &GroupChange> {
        self.changes.iter().filter(|c| c.action == GroupAction::Create)
    }

    /// Groups that must be deleted
    pub fn deletes(&self) -> impl Iterator<Item = &GroupChange> {
        self.changes.iter().filter(|c| c.action == GroupAction::Delete)
    }

    /// Whether no aggregate is created or deleted
    pub fn is_stable(&self) -> bool {
        self.changes.iter().all(|c| c.action == GroupAction::Keep)
    }
}

struct Side {
    lag_mode: Option<LagMode>,
    lag_id: Option<ObjectId>,
    members: BTreeSet<LinkKey>,
}

/// Work out which aggregates to create, keep or delete
///
/// `lags` maps group labels to the aggregates that exist on the system,
/// including those with no member links.
pub fn resolve_groups(
    desired: &[DesiredLink],
    observed: &[ObservedLink],
    lags: &BTreeMap<String, ObjectId>,
) -> GroupPlan {
    let mut wanted: BTreeMap<&str, Side> = BTreeMap::new();
    for link in desired {
        if let Some(label) = link.lag_group() {
            let side = wanted.entry(label).or_insert_with(|| Side {
                lag_mode: link.lag_mode,
                lag_id: None,
                members: BTreeSet::new(),
            });
            side.members.insert(link.key.clone());
        }
    }

    let mut present: BTreeMap<&str, Side> = lags
        .iter()
        .map(|(label, id)| {
            (
                label.as_str(),
                Side {
                    lag_mode: None,
                    lag_id: Some(id.clone()),
                    members: BTreeSet::new(),
                },
            )
        })
        .collect();
    for link in observed {
        if let Some(label) = link.lag_group() {
            let side = present.entry(label).or_insert_with(|| Side {
                lag_mode: link.lag_mode,
                lag_id: None,
                members: BTreeSet::new(),
            });
            if side.lag_id.is_none() {
                side.lag_id = link.lag_id.clone();
            }
            side.members.insert(link.key.clone());
        }
    }

    let labels: BTreeSet<&str> = wanted.keys().chain(present.keys()).copied().collect();
    let changes = labels
        .into_iter()
        .map(|label| {
            let (action, lag_mode, members) = match (wanted.remove(label), present.get(label)) {
                (Some(w), Some(_)) => (GroupAction::Keep, w.lag_mode, w.members),
                (Some(w), None) => (GroupAction::Create, w.lag_mode, w.members),
                (None, _) => (GroupAction::Delete, None, BTreeSet::new()),
            };
            GroupChange {
                label: label.to_string(),
                action,
                lag_mode,
                lag_id: present.get(label).and_then(|p| p.lag_id.clone()),
                members,
            }
        })
        .collect();

    let observed_groups: BTreeMap<&LinkKey, Option<&str>> =
        observed.iter().map(|l| (&l.key, l.lag_group())).collect();
    let moves = desired
        .iter()
        .filter_map(|link| {
            let from = *observed_groups.get(&link.key)?;
            let to = link.lag_group();
            (from != to).then(|| GroupMove {
                key: link.key.clone(),
                from: from.map(str::to_string),
                to: to.map(str::to_string),
            })
        })
        .collect();

    GroupPlan { changes, moves }
}

/// Validate a desired link set as a whole
///
/// - no two links on the same switch interface
/// - links sharing a group label all set `lag_mode`, and to the same value
pub fn validate_link_set(links: &[DesiredLink]) -> Result<()> {
    validate_unique("links", links)?;

    let mut modes: BTreeMap<&str, (&LinkKey, Option<LagMode>)> = BTreeMap::new();
    for link in links {
        let Some(label) = link.group_label.as_deref() else {
            continue;
        };
        match modes.get(label) {
            None => {
                modes.insert(label, (&link.key, link.lag_mode));
            }
            Some((first, mode)) => {
                if mode.is_none() || link.lag_mode.is_none() {
                    return Err(Error::validation(
                        "links",
                        format!(
                            "links {first} and {} share group_label {label:?}; lag_mode must be set on both",
                            link.key
                        ),
                    ));
                }
                if *mode != link.lag_mode {
                    return Err(Error::validation(
                        "links",
                        format!(
                            "links {first} and {} share group_label {label:?} but use different lag_mode values",
                            link.key
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(id: &str, ifn: &str, group: Option<(&str, &str)>) -> ObservedLink {
        ObservedLink {
            id: ObjectId::new(id),
            key: LinkKey::new("sw1", ifn),
            transform_id: None,
            group_label: group.map(|(l, _)| l.to_string()),
            lag_mode: group.map(|_| LagMode::LacpActive),
            tags: BTreeSet::new(),
            interface_id: None,
            lag_id: group.map(|(_, lag)| ObjectId::new(lag)),
            port_channel_id: None,
        }
    }

    fn lags_of(links: &[ObservedLink]) -> BTreeMap<String, ObjectId> {
        links
            .iter()
            .filter_map(|l| Some((l.group_label.clone()?, l.lag_id.clone()?)))
            .collect()
    }

    #[test]
    fn new_label_is_created_old_label_deleted() {
        let desired = vec![
            DesiredLink::new("sw1", "xe-0/0/1").with_group("new", LagMode::LacpActive),
            DesiredLink::new("sw1", "xe-0/0/2").with_group("new", LagMode::LacpActive),
        ];
        let current = vec![
            observed("1", "xe-0/0/1", Some(("old", "lag-old"))),
            observed("2", "xe-0/0/2", Some(("old", "lag-old"))),
        ];

        let plan = resolve_groups(&desired, &current, &lags_of(&current));

        let created: Vec<_> = plan.creates().map(|c| c.label.as_str()).collect();
        assert_eq!(created, vec!["new"]);
        let deleted: Vec<_> = plan.deletes().collect();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].label, "old");
        assert_eq!(deleted[0].lag_id, Some(ObjectId::new("lag-old")));
        assert_eq!(plan.moves.len(), 2);
        assert_eq!(plan.moves[0].from.as_deref(), Some("old"));
        assert_eq!(plan.moves[0].to.as_deref(), Some("new"));
    }

    #[test]
    fn unchanged_membership_keeps_group() {
        let desired = vec![DesiredLink::new("sw1", "xe-0/0/1").with_group("g", LagMode::LacpActive)];
        let current = vec![observed("1", "xe-0/0/1", Some(("g", "lag-1")))];

        let plan = resolve_groups(&desired, &current, &lags_of(&current));
        assert!(plan.is_stable());
        assert!(plan.moves.is_empty());
    }

    #[test]
    fn memberless_aggregate_is_kept_when_wanted() {
        let desired = vec![DesiredLink::new("sw1", "xe-0/0/1").with_group("bond0", LagMode::LacpActive)];
        let lags = BTreeMap::from([("bond0".to_string(), ObjectId::new("lag-7"))]);

        let plan = resolve_groups(&desired, &[], &lags);
        assert!(plan.is_stable());
        assert_eq!(plan.changes[0].lag_id, Some(ObjectId::new("lag-7")));
        assert_eq!(plan.changes[0].members.len(), 1);
    }

    #[test]
    fn memberless_aggregate_is_deleted_when_unwanted() {
        let desired = vec![DesiredLink::new("sw1", "xe-0/0/1")];
        let current = vec![observed("1", "xe-0/0/1", None)];
        let lags = BTreeMap::from([("stale".to_string(), ObjectId::new("lag-3"))]);

        let plan = resolve_groups(&desired, &current, &lags);
        let deleted: Vec<_> = plan.deletes().collect();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].label, "stale");
        assert_eq!(deleted[0].lag_id, Some(ObjectId::new("lag-3")));
        assert_eq!(plan.creates().count(), 0);
    }

    #[test]
    fn label_without_mode_is_not_a_group() {
        let mut link = DesiredLink::new("sw1", "xe-0/0/1");
        link.group_label = Some("plain".into());

        let plan = resolve_groups(&[link], &[], &BTreeMap::new());
        assert!(plan.changes.is_empty());
    }

    #[test]
    fn shared_label_requires_matching_modes() {
        let a = DesiredLink::new("sw1", "xe-0/0/1").with_group("g", LagMode::LacpActive);
        let b = DesiredLink::new("sw1", "xe-0/0/2").with_group("g", LagMode::Static);
        assert!(validate_link_set(&[a.clone(), b]).unwrap_err().is_validation());

        let mut c = DesiredLink::new("sw1", "xe-0/0/3");
        c.group_label = Some("g".into());
        assert!(validate_link_set(&[a.clone(), c]).is_err());

        let d = DesiredLink::new("sw1", "xe-0/0/4").with_group("g", LagMode::LacpActive);
        validate_link_set(&[a, d]).unwrap();
    }

    #[test]
    fn duplicate_interface_is_rejected() {
        let links = vec![DesiredLink::new("sw1", "xe-0/0/1"), DesiredLink::new("sw1", "xe-0/0/1")];
        assert!(validate_link_set(&links).is_err());
    }
}
