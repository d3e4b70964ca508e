//! Reconciliation of keyed collections
//!
//! - [`matcher`]: desired vs observed by natural key, producing a
//!   [`ReconciliationPlan`]
//! - [`groups`]: LAG groups implied by a link set
//! - [`executor`]: ordering and applying the resulting operations
//! - [`lookup`]: graph lookups for IDs the CRUD endpoints do not expose

pub mod executor;
pub mod groups;
pub mod lookup;
pub mod matcher;

pub use executor::{ApplyExecutor, ApplyReport, Operation, OperationOutcome, order_operations};
pub use groups::{GroupAction, GroupChange, GroupMove, GroupPlan, resolve_groups, validate_link_set};
pub use matcher::{ReconciliationPlan, UpdatePair, compute_plan, validate_unique};
