//! Natural-key matcher
//!
//! Pairs desired entries with observed ones by natural key and classifies
//! every entry into exactly one of create, update or delete. Remote IDs are
//! never consulted for matching; they only break ties when the remote side
//! reports the same key twice.

use std::collections::{BTreeMap, btree_map::Entry};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{DesiredEndpoint, Endpoint, RemoteEndpoint};

/// A desired entry matched to the observed entry it will modify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePair<D, O> {
    /// Target configuration
    pub desired: D,
    /// Current remote entry (carries the remote ID)
    pub observed: O,
}

/// Operations needed to make the observed set equal to the desired set
///
/// The three lists are disjoint and each is sorted by natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan<D, O> {
    /// Desired entries with no observed counterpart
    pub to_create: Vec<D>,
    /// Matched pairs whose mutable attributes differ
    pub to_update: Vec<UpdatePair<D, O>>,
    /// Observed entries with no desired counterpart
    pub to_delete: Vec<O>,
}

impl<D, O> ReconciliationPlan<D, O> {
    /// A plan with nothing to do
    pub fn empty() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
        }
    }

    /// Whether the plan has no operations
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Total number of planned operations
    pub fn len(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }
}

impl<D, O> Default for ReconciliationPlan<D, O> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Reject desired sets that contain the same natural key twice
///
/// `field` names the configuration attribute the entries came from and is
/// carried into the error.
pub fn validate_unique<D: Endpoint>(field: &str, desired: &[D]) -> Result<()> {
    let mut seen = BTreeMap::new();
    for (index, entry) in desired.iter().enumerate() {
        let key = entry.natural_key();
        if let Some(first) = seen.insert(key.clone(), index) {
            return Err(Error::validation(
                field,
                format!("entries {first} and {index} share the key {key}"),
            ));
        }
    }
    Ok(())
}

/// Compute the plan that turns `observed` into `desired`
///
/// Fails with a validation error, and produces no plan, when two desired
/// entries share a natural key.
pub fn compute_plan<D>(
    field: &str,
    desired: Vec<D>,
    observed: Vec<D::Observed>,
) -> Result<ReconciliationPlan<D, D::Observed>>
where
    D: DesiredEndpoint,
{
    validate_unique(field, &desired)?;

    let mut plan = ReconciliationPlan::empty();

    let mut observed = observed;
    observed.sort_by(|a, b| a.remote_id().cmp(b.remote_id()));

    let mut by_key: BTreeMap<D::Key, D::Observed> = BTreeMap::new();
    for entry in observed {
        match by_key.entry(entry.natural_key()) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
            Entry::Occupied(slot) => {
                warn!(
                    key = %slot.key(),
                    kept = %slot.get().remote_id(),
                    extra = %entry.remote_id(),
                    "remote reports duplicate key; extra entry will be deleted"
                );
                plan.to_delete.push(entry);
            }
        }
    }

    let mut desired = desired;
    desired.sort_by_key(|d| d.natural_key());

    for entry in desired {
        match by_key.remove(&entry.natural_key()) {
            Some(current) if entry.differs_from(&current) => plan.to_update.push(UpdatePair {
                desired: entry,
                observed: current,
            }),
            Some(_) => {}
            None => plan.to_create.push(entry),
        }
    }

    plan.to_delete.extend(by_key.into_values());
    plan.to_delete.sort_by_key(|o| o.natural_key());

    debug!(
        field,
        create = plan.to_create.len(),
        update = plan.to_update.len(),
        delete = plan.to_delete.len(),
        "computed reconciliation plan"
    );

    Ok(plan)
}
