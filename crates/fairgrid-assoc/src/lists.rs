//! User and QOS lists held by the cache.

use std::collections::BTreeMap;

use fairgrid_state::{Qos, QosId, User};

use crate::delta::{QosModify, UserModify};
use crate::error::{AssocError, AssocResult};

/// QOS definitions keyed by id.
#[derive(Debug, Default, Clone)]
pub struct QosList {
    entries: BTreeMap<QosId, Qos>,
}

impl QosList {
    pub fn from_rows(rows: Vec<Qos>) -> Self {
        let mut list = Self {
            entries: rows.into_iter().map(|q| (q.id, q)).collect(),
        };
        list.renormalize();
        list
    }

    /// Recompute `norm_priority = priority / max priority`.
    pub fn renormalize(&mut self) {
        let max = self.entries.values().map(|q| q.priority).max().unwrap_or(0);
        for qos in self.entries.values_mut() {
            qos.norm_priority = if max == 0 {
                0.0
            } else {
                f64::from(qos.priority) / f64::from(max)
            };
        }
    }

    pub fn get(&self, id: QosId) -> Option<&Qos> {
        self.entries.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Qos> {
        self.entries
            .values()
            .find(|q| q.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Qos> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_rows(&self) -> Vec<Qos> {
        self.entries.values().cloned().collect()
    }

    pub fn insert(&mut self, qos: Qos) -> AssocResult<()> {
        if self.entries.contains_key(&qos.id) {
            return Err(AssocError::Conflict(format!("qos {} already exists", qos.id)));
        }
        if self.by_name(&qos.name).is_some() {
            return Err(AssocError::Conflict(format!(
                "qos named {} already exists",
                qos.name
            )));
        }
        self.entries.insert(qos.id, qos);
        self.renormalize();
        Ok(())
    }

    pub fn modify(&mut self, change: &QosModify) -> AssocResult<()> {
        let qos = self
            .entries
            .get_mut(&change.id)
            .ok_or_else(|| AssocError::Conflict(format!("qos {} does not exist", change.id)))?;
        change.limits.apply_to(&mut qos.limits);
        if let Some(preemptees) = &change.preemptees {
            qos.preemptees = preemptees.clone();
        }
        if let Some(preemptors) = &change.preemptors {
            qos.preemptors = preemptors.clone();
        }
        if let Some(priority) = change.priority {
            qos.priority = priority;
            self.renormalize();
        }
        Ok(())
    }

    /// Remove a QOS; returns it so callers can purge its name elsewhere.
    pub fn remove(&mut self, id: QosId) -> Option<Qos> {
        let removed = self.entries.remove(&id);
        if removed.is_some() {
            self.renormalize();
        }
        removed
    }

    pub fn apply_decay(&mut self, factor: f64) {
        for qos in self.entries.values_mut() {
            qos.used_shares *= factor;
        }
    }

    /// Copy `used_shares` from `old` onto matching ids.
    pub fn reconcile_usage(&mut self, old: &QosList) {
        for (id, qos) in self.entries.iter_mut() {
            if let Some(prev) = old.entries.get(id) {
                qos.used_shares = prev.used_shares;
            }
        }
    }
}

/// Users keyed by name.
#[derive(Debug, Default, Clone)]
pub struct UserList {
    entries: BTreeMap<String, User>,
}

impl UserList {
    pub fn from_rows(rows: Vec<User>) -> Self {
        Self {
            entries: rows.into_iter().map(|u| (u.name.clone(), u)).collect(),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&User> {
        self.entries.get(name).or_else(|| {
            self.entries
                .values()
                .find(|u| u.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn by_uid(&self, uid: u32) -> Option<&User> {
        self.entries.values().find(|u| u.uid == Some(uid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_rows(&self) -> Vec<User> {
        self.entries.values().cloned().collect()
    }

    pub fn insert(&mut self, user: User) -> AssocResult<()> {
        if self.by_name(&user.name).is_some() {
            return Err(AssocError::Conflict(format!("user {} already exists", user.name)));
        }
        self.entries.insert(user.name.clone(), user);
        Ok(())
    }

    pub fn modify(&mut self, change: &UserModify) -> AssocResult<()> {
        let key = self
            .by_name(&change.name)
            .map(|u| u.name.clone())
            .ok_or_else(|| AssocError::Conflict(format!("user {} does not exist", change.name)))?;
        let Some(user) = self.entries.get_mut(&key) else {
            return Ok(());
        };
        change.default_account.apply_to(&mut user.default_account);
        if let Some(level) = change.admin_level {
            user.admin_level = level;
        }
        if let Some(accounts) = &change.coord_accounts {
            user.coord_accounts = accounts.clone();
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<User> {
        let key = self.by_name(name).map(|u| u.name.clone())?;
        self.entries.remove(&key)
    }

    pub(crate) fn resolve_uids<F>(&mut self, mut resolve: F)
    where
        F: FnMut(&str) -> Option<u32>,
    {
        for user in self.entries.values_mut() {
            user.uid = resolve(&user.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Setting;
    use fairgrid_state::AdminLevel;

    #[test]
    fn qos_priority_normalization() {
        let mut list = QosList::from_rows(vec![
            Qos::new(1, "normal", 10),
            Qos::new(2, "high", 40),
        ]);
        assert!((list.get(1).unwrap().norm_priority - 0.25).abs() < 1e-9);
        assert!((list.by_name("HIGH").unwrap().norm_priority - 1.0).abs() < 1e-9);

        list.modify(&QosModify {
            id: 1,
            priority: Some(80),
            ..QosModify::default()
        })
        .unwrap();
        assert!((list.get(2).unwrap().norm_priority - 0.5).abs() < 1e-9);

        list.remove(1);
        assert!((list.get(2).unwrap().norm_priority - 1.0).abs() < 1e-9);
    }

    #[test]
    fn qos_duplicate_names_conflict() {
        let mut list = QosList::from_rows(vec![Qos::new(1, "normal", 10)]);
        assert!(matches!(
            list.insert(Qos::new(2, "Normal", 5)),
            Err(AssocError::Conflict(_))
        ));
        assert!(matches!(
            list.modify(&QosModify {
                id: 9,
                ..QosModify::default()
            }),
            Err(AssocError::Conflict(_))
        ));
    }

    #[test]
    fn user_lookup_and_modify() {
        let mut list = UserList::from_rows(vec![User::new("Alice", "physics")]);
        list.resolve_uids(|name| (name == "Alice").then_some(1001));
        assert_eq!(list.by_uid(1001).unwrap().name, "Alice");
        assert!(list.by_name("alice").is_some());

        list.modify(&UserModify {
            name: "alice".into(),
            default_account: Setting::Set("chem".into()),
            admin_level: Some(AdminLevel::Operator),
            coord_accounts: None,
        })
        .unwrap();
        let alice = list.by_name("Alice").unwrap();
        assert_eq!(alice.default_account.as_deref(), Some("chem"));
        assert_eq!(alice.admin_level, AdminLevel::Operator);

        assert!(list.remove("ALICE").is_some());
        assert!(list.is_empty());
    }
}
