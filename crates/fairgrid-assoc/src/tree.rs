//! The association arena.
//!
//! Associations live in a flat map keyed by id. Parent links are ids, and
//! the children index is derived from them; nothing owns anything else, so
//! dropping the arena is the whole teardown.
//!
//! Fairshare values are derived top-down:
//!
//! ```text
//! level_shares(P)     = Σ fairshare(c) for c in children(P)
//! norm_shares(root)   = 1.0
//! norm_shares(C)      = norm_shares(P) × fairshare(C) / level_shares(P)
//! cpu_shares(X)       = root_cpu_shares × norm_shares(X)
//! level_cpu_shares(X) = cpu_shares(X) × level_shares(X)
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, warn};

use fairgrid_state::{AssocId, AssocUsage, Association};

use crate::delta::AssocModify;
use crate::error::{AssocError, AssocResult};
use crate::qos_delta::{apply_qos_delta, parse_qos_delta};

/// What a modify touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ModifyEffect {
    /// Parent changed.
    pub structural: bool,
    /// Fairshare weight changed.
    pub shares: bool,
}

#[derive(Debug, Default, Clone)]
pub struct AssocTree {
    nodes: BTreeMap<AssocId, Association>,
    children: BTreeMap<AssocId, Vec<AssocId>>,
    root_cpu_shares: f64,
    /// Last `(cpu_count, half_life)` passed to `set_capacity`.
    capacity: Option<(u32, u32)>,
}

/// Fairshare weights of zero are stored as one so every share stays positive.
pub(crate) fn normalize(assoc: &mut Association) {
    if assoc.fairshare == 0 {
        assoc.fairshare = 1;
    }
}

impl AssocTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from storage rows.
    ///
    /// Returns the tree plus the rows that could not be linked: duplicate
    /// ids, unknown parents, and anything caught in a parent cycle (or
    /// below one).
    pub fn from_rows(rows: Vec<Association>) -> (Self, Vec<Association>) {
        let mut rejected = Vec::new();
        let mut nodes = BTreeMap::new();
        for mut row in rows {
            normalize(&mut row);
            if nodes.contains_key(&row.id) || row.id == 0 || row.id == row.parent_id {
                rejected.push(row);
                continue;
            }
            nodes.insert(row.id, row);
        }

        let linked: BTreeSet<AssocId> = nodes
            .keys()
            .copied()
            .filter(|&id| reaches_root(&nodes, id))
            .collect();
        let unlinked: Vec<AssocId> = nodes
            .keys()
            .copied()
            .filter(|id| !linked.contains(id))
            .collect();
        for id in unlinked {
            if let Some(row) = nodes.remove(&id) {
                rejected.push(row);
            }
        }

        let mut tree = Self {
            nodes,
            ..Self::default()
        };
        tree.rebuild_children();
        (tree, rejected)
    }

    fn rebuild_children(&mut self) {
        self.children.clear();
        for assoc in self.nodes.values() {
            if !assoc.is_root() {
                self.children
                    .entry(assoc.parent_id)
                    .or_default()
                    .push(assoc.id);
            }
        }
    }

    pub fn get(&self, id: AssocId) -> Option<&Association> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: AssocId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All associations in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Association> {
        self.nodes.values()
    }

    /// Clone every row out (checkpointing).
    pub fn to_rows(&self) -> Vec<Association> {
        self.nodes.values().cloned().collect()
    }

    pub fn children(&self, id: AssocId) -> &[AssocId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn roots(&self) -> impl Iterator<Item = &Association> {
        self.nodes.values().filter(|a| a.is_root())
    }

    /// Ids on the path from `id`'s parent up to the root.
    pub fn ancestors(&self, id: AssocId) -> Vec<AssocId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(&id).map(|a| a.parent_id);
        while let Some(parent) = current {
            if parent == 0 || out.len() > self.nodes.len() {
                break;
            }
            out.push(parent);
            current = self.nodes.get(&parent).map(|a| a.parent_id);
        }
        out
    }

    /// True if `id` is `ancestor` or lies below it.
    pub fn is_within(&self, id: AssocId, ancestor: AssocId) -> bool {
        id == ancestor || self.ancestors(id).contains(&ancestor)
    }

    /// The QOS list in force: the node's own, or the nearest ancestor's.
    pub fn effective_qos(&self, id: AssocId) -> Vec<String> {
        let Some(assoc) = self.nodes.get(&id) else {
            return Vec::new();
        };
        if !assoc.qos.is_empty() {
            return assoc.qos.clone();
        }
        self.ancestors(id)
            .into_iter()
            .filter_map(|a| self.nodes.get(&a))
            .find(|a| !a.qos.is_empty())
            .map(|a| a.qos.clone())
            .unwrap_or_default()
    }

    // ── Structural changes ─────────────────────────────────────────

    /// Add a new association.
    pub fn insert(&mut self, mut assoc: Association) -> AssocResult<()> {
        normalize(&mut assoc);
        if assoc.id == 0 {
            return Err(AssocError::InvalidArgument("association id 0 is reserved".into()));
        }
        if self.nodes.contains_key(&assoc.id) {
            return Err(AssocError::Conflict(format!(
                "association {} already exists",
                assoc.id
            )));
        }
        if assoc.is_root() {
            if self
                .roots()
                .any(|r| r.cluster.eq_ignore_ascii_case(&assoc.cluster))
            {
                return Err(AssocError::Conflict(format!(
                    "cluster {} already has a root association",
                    assoc.cluster
                )));
            }
        } else if !self.nodes.contains_key(&assoc.parent_id) {
            return Err(AssocError::Conflict(format!(
                "parent {} of association {} does not exist",
                assoc.parent_id, assoc.id
            )));
        }

        if !assoc.is_root() {
            self.children
                .entry(assoc.parent_id)
                .or_default()
                .push(assoc.id);
        }
        debug!(assoc_id = assoc.id, parent_id = assoc.parent_id, "association added");
        self.nodes.insert(assoc.id, assoc);
        Ok(())
    }

    /// Remove an association and everything below it. Returns the removed
    /// rows, deepest first. Unknown ids remove nothing.
    pub fn remove_subtree(&mut self, id: AssocId) -> Vec<Association> {
        let Some(parent_id) = self.nodes.get(&id).map(|a| a.parent_id) else {
            return Vec::new();
        };

        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            order.push(current);
            stack.extend_from_slice(self.children(current));
        }

        let mut removed = Vec::with_capacity(order.len());
        for current in order.into_iter().rev() {
            self.children.remove(&current);
            if let Some(assoc) = self.nodes.remove(&current) {
                removed.push(assoc);
            }
        }
        if let Some(siblings) = self.children.get_mut(&parent_id) {
            siblings.retain(|&c| c != id);
        }
        debug!(assoc_id = id, removed = removed.len(), "association subtree removed");
        removed
    }

    /// Apply a modify delta. Validation happens before anything changes.
    pub fn modify(&mut self, change: &AssocModify) -> AssocResult<ModifyEffect> {
        let current_parent = match self.nodes.get(&change.id) {
            Some(assoc) => assoc.parent_id,
            None => {
                return Err(AssocError::Conflict(format!(
                    "association {} does not exist",
                    change.id
                )));
            }
        };

        let mut effect = ModifyEffect::default();
        if let Some(new_parent) = change.parent_id.filter(|&p| p != current_parent) {
            if new_parent == 0 {
                return Err(AssocError::Conflict(format!(
                    "association {} cannot become a root",
                    change.id
                )));
            }
            if !self.nodes.contains_key(&new_parent) {
                return Err(AssocError::Conflict(format!(
                    "parent {new_parent} does not exist"
                )));
            }
            if self.is_within(new_parent, change.id) {
                return Err(AssocError::Conflict(format!(
                    "moving {} under {new_parent} would create a cycle",
                    change.id
                )));
            }
            if let Some(siblings) = self.children.get_mut(&current_parent) {
                siblings.retain(|&c| c != change.id);
            }
            self.children.entry(new_parent).or_default().push(change.id);
            effect.structural = true;
        }

        let qos_ops = parse_qos_delta(&change.qos);
        let Some(assoc) = self.nodes.get_mut(&change.id) else {
            return Ok(effect);
        };
        if effect.structural {
            if let Some(new_parent) = change.parent_id {
                assoc.parent_id = new_parent;
            }
        }
        if let Some(fairshare) = change.fairshare {
            let fairshare = fairshare.max(1);
            if fairshare != assoc.fairshare {
                assoc.fairshare = fairshare;
                effect.shares = true;
            }
        }
        change.limits.apply_to(&mut assoc.limits);
        if apply_qos_delta(&mut assoc.qos, &qos_ops) {
            debug!(assoc_id = change.id, qos = ?assoc.qos, "association qos updated");
        }
        Ok(effect)
    }

    // ── Fairshare ──────────────────────────────────────────────────

    pub fn root_cpu_shares(&self) -> f64 {
        self.root_cpu_shares
    }

    /// Set the root's capacity input. Returns false (and does nothing) when
    /// neither value changed since the last call.
    pub fn set_capacity(&mut self, cpu_count: u32, half_life: u32) -> bool {
        if self.capacity == Some((cpu_count, half_life)) {
            return false;
        }
        self.capacity = Some((cpu_count, half_life));
        self.root_cpu_shares = f64::from(cpu_count) * f64::from(half_life) * 2.0;
        self.recompute_fairshare();
        true
    }

    /// Carry capacity settings over from a previous tree.
    pub(crate) fn inherit_capacity(&mut self, old: &AssocTree) {
        self.capacity = old.capacity;
        self.root_cpu_shares = old.root_cpu_shares;
    }

    /// Recompute every derived share value.
    pub fn recompute_fairshare(&mut self) {
        let levels: Vec<(AssocId, u64)> = self
            .nodes
            .keys()
            .map(|&id| {
                let sum = self
                    .children(id)
                    .iter()
                    .filter_map(|c| self.nodes.get(c))
                    .map(|c| u64::from(c.fairshare))
                    .sum();
                (id, sum)
            })
            .collect();
        for (id, level) in levels {
            if let Some(assoc) = self.nodes.get_mut(&id) {
                assoc.level_shares = level;
            }
        }

        let root_cpu = self.root_cpu_shares;
        let mut queue: VecDeque<(AssocId, f64)> =
            self.roots().map(|r| (r.id, 1.0)).collect();
        while let Some((id, norm)) = queue.pop_front() {
            let Some(assoc) = self.nodes.get_mut(&id) else {
                continue;
            };
            assoc.norm_shares = norm;
            assoc.cpu_shares = root_cpu * norm;
            let level = assoc.level_shares as f64;
            assoc.level_cpu_shares = assoc.cpu_shares * level;
            for child in self.children(id) {
                if let Some(c) = self.nodes.get(child) {
                    queue.push_back((*child, norm * f64::from(c.fairshare) / level));
                }
            }
        }
        debug!(associations = self.nodes.len(), root_cpu, "fairshare recomputed");
    }

    // ── Usage ──────────────────────────────────────────────────────

    /// Zero account-level usage; optionally rebuild it from the user
    /// associations beneath.
    pub fn reset_usage(&mut self, propagate: bool) {
        for assoc in self.nodes.values_mut().filter(|a| a.is_account_level()) {
            assoc.usage = AssocUsage::default();
        }
        if !propagate {
            return;
        }
        let contributions: Vec<(AssocId, AssocUsage)> = self
            .nodes
            .values()
            .filter(|a| !a.is_account_level() && !a.usage.is_zero())
            .map(|a| (a.id, a.usage.clone()))
            .collect();
        for (id, usage) in contributions {
            for ancestor in self.ancestors(id) {
                if let Some(assoc) = self.nodes.get_mut(&ancestor) {
                    if assoc.is_account_level() {
                        assoc.usage.add(&usage);
                    }
                }
            }
        }
    }

    pub fn apply_decay(&mut self, factor: f64) {
        for assoc in self.nodes.values_mut() {
            assoc.usage.used_shares *= factor;
        }
    }

    /// Record usage against a user association and every ancestor.
    pub fn charge(&mut self, id: AssocId, cpu_seconds: f64) -> bool {
        if !self.nodes.contains_key(&id) {
            return false;
        }
        let mut path = vec![id];
        path.extend(self.ancestors(id));
        for current in path {
            if let Some(assoc) = self.nodes.get_mut(&current) {
                assoc.usage.used_shares += cpu_seconds;
            }
        }
        true
    }

    /// Copy usage counters from `old` onto matching ids.
    pub fn reconcile_usage(&mut self, old: &AssocTree) -> usize {
        let mut matched = 0;
        for (id, assoc) in self.nodes.iter_mut() {
            if let Some(prev) = old.nodes.get(id) {
                assoc.usage = prev.usage.clone();
                matched += 1;
            }
        }
        matched
    }

    /// Set `used_shares` on a single association.
    pub fn set_used_shares(&mut self, id: AssocId, value: f64) -> bool {
        match self.nodes.get_mut(&id) {
            Some(assoc) => {
                assoc.usage.used_shares = value;
                true
            }
            None => false,
        }
    }

    /// Replace every `uid` from a resolver function.
    pub(crate) fn resolve_uids<F>(&mut self, mut resolve: F)
    where
        F: FnMut(&str) -> Option<u32>,
    {
        for assoc in self.nodes.values_mut() {
            assoc.uid = assoc.user.as_deref().and_then(&mut resolve);
            if assoc.user.is_some() && assoc.uid.is_none() {
                warn!(assoc_id = assoc.id, user = ?assoc.user, "user does not resolve to a uid");
            }
        }
    }

    /// Drop a QOS name from every association's list.
    pub fn purge_qos(&mut self, name: &str) -> usize {
        let mut touched = 0;
        for assoc in self.nodes.values_mut() {
            let before = assoc.qos.len();
            assoc.qos.retain(|q| !q.eq_ignore_ascii_case(name));
            if assoc.qos.len() != before {
                touched += 1;
            }
        }
        touched
    }
}

fn reaches_root(nodes: &BTreeMap<AssocId, Association>, id: AssocId) -> bool {
    let mut current = id;
    for _ in 0..=nodes.len() {
        match nodes.get(&current) {
            Some(assoc) if assoc.is_root() => return true,
            Some(assoc) => current = assoc.parent_id,
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{AssocModify, LimitsUpdate, Setting};

    const EPS: f64 = 1e-9;

    fn sample() -> AssocTree {
        let rows = vec![
            Association::account(1, 0, "hpc", "root", 1),
            Association::account(2, 1, "hpc", "a", 1),
            Association::account(3, 1, "hpc", "b", 3),
            Association::user(4, 3, "hpc", "b", "alice", 1),
            Association::user(5, 3, "hpc", "b", "bob", 4),
        ];
        let (mut tree, rejected) = AssocTree::from_rows(rows);
        assert!(rejected.is_empty());
        tree.recompute_fairshare();
        tree
    }

    fn assert_invariants(tree: &AssocTree) {
        for assoc in tree.iter() {
            let sum: u64 = tree
                .children(assoc.id)
                .iter()
                .map(|c| u64::from(tree.get(*c).unwrap().fairshare))
                .sum();
            assert_eq!(assoc.level_shares, sum, "level_shares of {}", assoc.id);
            assert!(assoc.norm_shares > 0.0 && assoc.norm_shares <= 1.0);

            let mut product = 1.0;
            let mut child = assoc.id;
            for parent in tree.ancestors(assoc.id) {
                let p = tree.get(parent).unwrap();
                product *= f64::from(tree.get(child).unwrap().fairshare) / p.level_shares as f64;
                child = parent;
            }
            assert!((assoc.norm_shares - product).abs() < EPS);
        }
    }

    #[test]
    fn norm_shares_from_weights() {
        let tree = sample();
        assert_eq!(tree.get(1).unwrap().level_shares, 4);
        assert!((tree.get(2).unwrap().norm_shares - 0.25).abs() < EPS);
        assert!((tree.get(3).unwrap().norm_shares - 0.75).abs() < EPS);
        assert!((tree.get(5).unwrap().norm_shares - 0.6).abs() < EPS);
        assert_invariants(&tree);
    }

    #[test]
    fn capacity_is_memoized() {
        let mut tree = sample();
        assert!(tree.set_capacity(100, 1000));
        assert!((tree.get(1).unwrap().cpu_shares - 200_000.0).abs() < EPS);
        assert!((tree.get(3).unwrap().cpu_shares - 150_000.0).abs() < EPS);
        assert!(
            (tree.get(3).unwrap().level_cpu_shares - 150_000.0 * 5.0).abs() < EPS
        );
        assert!(!tree.set_capacity(100, 1000));
        assert!(tree.set_capacity(50, 1000));
        assert!((tree.get(1).unwrap().cpu_shares - 100_000.0).abs() < EPS);
    }

    #[test]
    fn from_rows_rejects_orphans_duplicates_and_cycles() {
        let rows = vec![
            Association::account(1, 0, "hpc", "root", 1),
            Association::account(2, 1, "hpc", "a", 1),
            Association::account(2, 1, "hpc", "dup", 1),
            Association::account(3, 99, "hpc", "orphan", 1),
            Association::user(4, 3, "hpc", "orphan", "u", 1),
            Association::account(5, 6, "hpc", "x", 1),
            Association::account(6, 5, "hpc", "y", 1),
        ];
        let (tree, rejected) = AssocTree::from_rows(rows);
        let mut ids: Vec<AssocId> = rejected.iter().map(|a| a.id).collect();
        ids.sort();
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.children(1), &[2]);
    }

    #[test]
    fn zero_fairshare_is_normalized() {
        let rows = vec![
            Association::account(1, 0, "hpc", "root", 1),
            Association::account(2, 1, "hpc", "a", 0),
        ];
        let (mut tree, _) = AssocTree::from_rows(rows);
        tree.recompute_fairshare();
        assert_eq!(tree.get(2).unwrap().fairshare, 1);
        assert!((tree.get(2).unwrap().norm_shares - 1.0).abs() < EPS);
    }

    #[test]
    fn huge_sibling_weights_do_not_overflow() {
        let rows = vec![
            Association::account(1, 0, "hpc", "root", 1),
            Association::account(2, 1, "hpc", "a", 3_000_000_000),
            Association::account(3, 1, "hpc", "b", 3_000_000_000),
            Association::account(4, 1, "hpc", "c", u32::MAX),
        ];
        let (mut tree, rejected) = AssocTree::from_rows(rows);
        assert!(rejected.is_empty());
        tree.recompute_fairshare();
        let expected = 6_000_000_000u64 + u64::from(u32::MAX);
        assert_eq!(tree.get(1).unwrap().level_shares, expected);
        let a = tree.get(2).unwrap().norm_shares;
        assert!((a - 3_000_000_000f64 / expected as f64).abs() < EPS);
        assert_invariants(&tree);
    }

    #[test]
    fn insert_validates_links() {
        let mut tree = sample();
        let dup = Association::account(2, 1, "hpc", "again", 1);
        assert!(matches!(tree.insert(dup), Err(AssocError::Conflict(_))));
        let orphan = Association::account(9, 42, "hpc", "x", 1);
        assert!(matches!(tree.insert(orphan), Err(AssocError::Conflict(_))));
        let second_root = Association::account(9, 0, "hpc", "root2", 1);
        assert!(matches!(tree.insert(second_root), Err(AssocError::Conflict(_))));
        let other_cluster = Association::account(9, 0, "other", "root", 1);
        assert!(tree.insert(other_cluster).is_ok());
    }

    #[test]
    fn remove_subtree_drops_descendants() {
        let mut tree = sample();
        let removed: Vec<AssocId> = tree.remove_subtree(3).iter().map(|a| a.id).collect();
        assert_eq!(removed.len(), 3);
        assert_eq!(*removed.last().unwrap(), 3);
        assert!(!tree.contains(4));
        assert_eq!(tree.children(1), &[2]);
        assert!(tree.remove_subtree(3).is_empty());
        tree.recompute_fairshare();
        assert_invariants(&tree);
    }

    #[test]
    fn modify_reparent_and_cycle_guard() {
        let mut tree = sample();
        let mut change = AssocModify::new(3);
        change.parent_id = Some(5);
        assert!(matches!(tree.modify(&change), Err(AssocError::Conflict(_))));

        let mut change = AssocModify::new(5);
        change.parent_id = Some(2);
        change.fairshare = Some(2);
        let effect = tree.modify(&change).unwrap();
        assert!(effect.structural && effect.shares);
        assert_eq!(tree.children(2), &[5]);
        assert_eq!(tree.children(3), &[4]);
        tree.recompute_fairshare();
        assert_invariants(&tree);
    }

    #[test]
    fn modify_missing_is_conflict() {
        let mut tree = sample();
        assert!(matches!(
            tree.modify(&AssocModify::new(77)),
            Err(AssocError::Conflict(_))
        ));
    }

    #[test]
    fn modify_merges_limits_and_qos() {
        let mut tree = sample();
        let mut change = AssocModify::new(4);
        change.limits = LimitsUpdate {
            max_jobs: Setting::Set(3),
            ..LimitsUpdate::default()
        };
        change.qos = vec!["+standard".into()];
        let effect = tree.modify(&change).unwrap();
        assert_eq!(effect, ModifyEffect::default());
        let assoc = tree.get(4).unwrap();
        assert_eq!(assoc.limits.max_jobs, Some(3));
        assert_eq!(assoc.qos, vec!["standard"]);
    }

    #[test]
    fn effective_qos_inherits() {
        let mut tree = sample();
        let mut change = AssocModify::new(3);
        change.qos = vec!["normal".into(), "high".into()];
        tree.modify(&change).unwrap();
        assert_eq!(tree.effective_qos(4), vec!["normal", "high"]);
        assert!(tree.effective_qos(2).is_empty());
    }

    #[test]
    fn usage_reset_and_propagation() {
        let mut tree = sample();
        assert!(tree.charge(4, 10.0));
        assert!(tree.charge(5, 5.0));
        assert!((tree.get(1).unwrap().usage.used_shares - 15.0).abs() < EPS);

        tree.set_used_shares(3, 999.0);
        tree.reset_usage(true);
        assert!((tree.get(3).unwrap().usage.used_shares - 15.0).abs() < EPS);
        assert!((tree.get(4).unwrap().usage.used_shares - 10.0).abs() < EPS);

        tree.reset_usage(false);
        assert_eq!(tree.get(1).unwrap().usage.used_shares, 0.0);
        assert!((tree.get(5).unwrap().usage.used_shares - 5.0).abs() < EPS);
    }

    #[test]
    fn decay_scales_linearly() {
        let mut tree = sample();
        tree.charge(4, 8.0);
        tree.apply_decay(0.5);
        assert!((tree.get(4).unwrap().usage.used_shares - 4.0).abs() < EPS);
        assert!((tree.get(1).unwrap().usage.used_shares - 4.0).abs() < EPS);
    }

    #[test]
    fn purge_qos_everywhere() {
        let mut tree = sample();
        for id in [2, 4] {
            let mut change = AssocModify::new(id);
            change.qos = vec!["gone".into(), "+kept".into()];
            tree.modify(&change).unwrap();
        }
        assert_eq!(tree.purge_qos("GONE"), 2);
        assert_eq!(tree.get(4).unwrap().qos, vec!["kept"]);
    }
}
