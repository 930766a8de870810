//! Point lookups over the cached lists.
//!
//! Callers hand in a partially filled record; a match fills the blanks and
//! leaves anything the caller set alone. A miss never touches the record.

use fairgrid_state::{AdminLevel, AssocId, AssocLimits, QosId, QosLimits};

use crate::lists::{QosList, UserList};
use crate::tree::AssocTree;

/// An association lookup key and fill-in target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialAssociation {
    pub id: Option<AssocId>,
    pub parent_id: Option<AssocId>,
    pub uid: Option<u32>,
    pub user: Option<String>,
    pub account: Option<String>,
    pub cluster: Option<String>,
    pub partition: Option<String>,
    pub limits: Option<AssocLimits>,
    pub qos: Option<Vec<String>>,
}

impl PartialAssociation {
    pub fn by_id(id: AssocId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_user(uid: u32, account: Option<&str>) -> Self {
        Self {
            uid: Some(uid),
            account: account.map(str::to_string),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialUser {
    pub name: Option<String>,
    pub uid: Option<u32>,
    pub default_account: Option<String>,
    pub admin_level: Option<AdminLevel>,
    pub coord_accounts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialQos {
    pub id: Option<QosId>,
    pub name: Option<String>,
    pub priority: Option<u32>,
    pub norm_priority: Option<f64>,
    pub limits: Option<QosLimits>,
    pub preemptees: Option<Vec<String>>,
    pub preemptors: Option<Vec<String>>,
}

fn same(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// The default account of the user behind `partial.uid`, when the caller
/// gave no account.
pub fn default_account_for(users: &UserList, partial: &PartialAssociation) -> Option<String> {
    if partial.account.is_some() {
        return None;
    }
    partial
        .uid
        .and_then(|uid| users.by_uid(uid))
        .and_then(|u| u.default_account.clone())
}

/// Find the association `partial` describes. `default_account` stands in
/// when the partial carries no account; with neither there is no match.
pub fn find_association(
    tree: &AssocTree,
    partial: &PartialAssociation,
    default_account: Option<&str>,
    local_cluster: &str,
) -> Option<AssocId> {
    if let Some(id) = partial.id {
        return tree.contains(id).then_some(id);
    }

    let account = partial.account.as_deref().or(default_account)?;
    let cluster = partial.cluster.as_deref().unwrap_or(local_cluster);

    let mut fallback = None;
    for assoc in tree.iter() {
        let uid_ok = match partial.uid {
            Some(uid) => assoc.uid == Some(uid),
            None => assoc.is_account_level(),
        };
        if !uid_ok || !same(&assoc.account, account) || !same(&assoc.cluster, cluster) {
            continue;
        }
        match (&partial.partition, &assoc.partition) {
            (Some(wanted), Some(have)) if same(wanted, have) => return Some(assoc.id),
            (_, None) => {
                if fallback.is_none() {
                    fallback = Some(assoc.id);
                }
            }
            _ => {}
        }
    }
    fallback
}

/// Copy the matched association's fields into `partial` where unset.
pub fn fill_association(tree: &AssocTree, id: AssocId, partial: &mut PartialAssociation) {
    let Some(assoc) = tree.get(id) else {
        return;
    };
    partial.id.get_or_insert(assoc.id);
    partial.parent_id.get_or_insert(assoc.parent_id);
    if partial.uid.is_none() {
        partial.uid = assoc.uid;
    }
    if partial.user.is_none() {
        partial.user = assoc.user.clone();
    }
    partial.account.get_or_insert_with(|| assoc.account.clone());
    partial.cluster.get_or_insert_with(|| assoc.cluster.clone());
    if partial.partition.is_none() {
        partial.partition = assoc.partition.clone();
    }
    partial.limits.get_or_insert_with(|| assoc.limits.clone());
    partial.qos.get_or_insert_with(|| tree.effective_qos(id));
}

/// Fill a user lookup. Returns false on a miss.
pub fn fill_user(users: &UserList, partial: &mut PartialUser) -> bool {
    let found = partial
        .uid
        .and_then(|uid| users.by_uid(uid))
        .or_else(|| partial.name.as_deref().and_then(|n| users.by_name(n)));
    let Some(user) = found else {
        return false;
    };
    partial.name.get_or_insert_with(|| user.name.clone());
    if partial.uid.is_none() {
        partial.uid = user.uid;
    }
    if partial.default_account.is_none() {
        partial.default_account = user.default_account.clone();
    }
    partial.admin_level.get_or_insert(user.admin_level);
    partial
        .coord_accounts
        .get_or_insert_with(|| user.coord_accounts.clone());
    true
}

/// Fill a QOS lookup. Returns false on a miss.
pub fn fill_qos(list: &QosList, partial: &mut PartialQos) -> bool {
    let found = partial
        .id
        .and_then(|id| list.get(id))
        .or_else(|| partial.name.as_deref().and_then(|n| list.by_name(n)));
    let Some(qos) = found else {
        return false;
    };
    partial.id.get_or_insert(qos.id);
    partial.name.get_or_insert_with(|| qos.name.clone());
    partial.priority.get_or_insert(qos.priority);
    partial.norm_priority.get_or_insert(qos.norm_priority);
    partial.limits.get_or_insert_with(|| qos.limits.clone());
    partial
        .preemptees
        .get_or_insert_with(|| qos.preemptees.clone());
    partial
        .preemptors
        .get_or_insert_with(|| qos.preemptors.clone());
    true
}
