//! The accounting storage collaborator.
//!
//! The association cache only ever reads full snapshots through this
//! trait. `StateStore` implements it over redb; tests substitute their own.

use crate::error::StateResult;
use crate::types::*;

pub trait AccountingStorage: Send + Sync {
    fn get_associations(&self, cond: &AssocCondition) -> StateResult<Vec<Association>>;

    fn get_users(&self, cond: &UserCondition) -> StateResult<Vec<User>>;

    fn get_qos(&self, cond: &QosCondition) -> StateResult<Vec<Qos>>;
}
