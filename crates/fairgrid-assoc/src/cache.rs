//! AssocCache: the shared association, user and QOS state.
//!
//! Each list sits behind its own `RwLock`. No method holds two of them at
//! once, and none holds one across a storage fetch. Checkpoint file I/O is
//! serialized by `file_lock`, taken before any list lock.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use fairgrid_state::{
    AccountingStorage, AdminLevel, AssocCondition, AssocId, Association, Qos, QosCondition,
    User, UserCondition,
};

use crate::checkpoint::{
    decode_snapshot, decode_usage, encode_snapshot, encode_usage, unix_now, write_atomic,
};
use crate::delta::{AssocDelta, DeltaFailure, QosDelta, UpdateOptions, UpdateReport, UserDelta};
use crate::error::{AssocError, AssocResult};
use crate::identity::IdentityResolver;
use crate::lists::{QosList, UserList};
use crate::lookup::{
    PartialAssociation, PartialQos, PartialUser, default_account_for, fill_association,
    fill_qos, fill_user, find_association,
};
use crate::tree::AssocTree;

/// Called once per association removed by an update batch.
pub type RemoveNotify = Arc<dyn Fn(&Association) + Send + Sync>;

/// Deployment settings the cache needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Local cluster name; scopes loads and lookups.
    pub cluster: String,
    /// Fairshare accounting enabled.
    pub fairshare: bool,
}

impl CacheSettings {
    pub fn new(cluster: &str, fairshare: bool) -> Self {
        Self {
            cluster: cluster.to_string(),
            fairshare,
        }
    }
}

/// `0.5^(interval / half_life)`. A zero half-life disables decay.
pub fn decay_factor(interval: Duration, half_life: Duration) -> f64 {
    if half_life.is_zero() {
        return 1.0;
    }
    0.5f64.powf(interval.as_secs_f64() / half_life.as_secs_f64())
}

pub struct AssocCache {
    storage: Arc<dyn AccountingStorage>,
    identity: Arc<dyn IdentityResolver>,
    settings: CacheSettings,
    assocs: RwLock<AssocTree>,
    qos: RwLock<QosList>,
    users: RwLock<UserList>,
    file_lock: Mutex<()>,
    running_cached: AtomicBool,
    remove_notify: Option<RemoveNotify>,
}

/// Fetched rows, before they are linked.
struct Fetched {
    assocs: AssocResult<Vec<Association>>,
    users: AssocResult<Vec<User>>,
    qos: AssocResult<Vec<Qos>>,
}

impl AssocCache {
    pub fn new(
        storage: Arc<dyn AccountingStorage>,
        identity: Arc<dyn IdentityResolver>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            storage,
            identity,
            settings,
            assocs: RwLock::new(AssocTree::new()),
            qos: RwLock::new(QosList::default()),
            users: RwLock::new(UserList::default()),
            file_lock: Mutex::new(()),
            running_cached: AtomicBool::new(false),
            remove_notify: None,
        }
    }

    /// Install the removal callback.
    pub fn with_remove_notify(mut self, notify: RemoveNotify) -> Self {
        self.remove_notify = Some(notify);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn is_running_cached(&self) -> bool {
        self.running_cached.load(Ordering::Acquire)
    }

    // ── Load / Refresh ─────────────────────────────────────────────

    fn fetch(&self) -> Fetched {
        let unavailable = |e: fairgrid_state::StateError| AssocError::Unavailable(e.to_string());
        Fetched {
            assocs: self
                .storage
                .get_associations(&AssocCondition::cluster(&self.settings.cluster))
                .map_err(unavailable),
            users: self
                .storage
                .get_users(&UserCondition::default())
                .map_err(unavailable),
            qos: self
                .storage
                .get_qos(&QosCondition::default())
                .map_err(unavailable),
        }
    }

    fn build_tree(&self, rows: Vec<Association>, enforce: bool) -> AssocResult<AssocTree> {
        let (mut tree, rejected) = AssocTree::from_rows(rows);
        if !rejected.is_empty() {
            if enforce {
                let ids: Vec<AssocId> = rejected.iter().map(|a| a.id).collect();
                return Err(AssocError::Corrupt(format!(
                    "associations {ids:?} do not link to a root"
                )));
            }
            for row in &rejected {
                warn!(assoc_id = row.id, parent_id = row.parent_id, "dropping unlinked association");
            }
        }
        tree.resolve_uids(|name| self.identity.uid_from_name(name));
        Ok(tree)
    }

    fn build_users(&self, rows: Vec<User>) -> UserList {
        let mut users = UserList::from_rows(rows);
        users.resolve_uids(|name| {
            let uid = self.identity.uid_from_name(name);
            if uid.is_none() {
                debug!(user = name, "user does not resolve to a uid");
            }
            uid
        });
        users
    }

    /// Replace all three lists from storage.
    ///
    /// With `enforce` off, a failed fetch or an unlinkable association is
    /// logged and the cache comes up with what it could get.
    pub async fn load(&self, enforce: bool) -> AssocResult<()> {
        let fetched = self.fetch();

        let assoc_rows = match fetched.assocs {
            Ok(rows) => rows,
            Err(e) if enforce => return Err(e),
            Err(e) => {
                warn!(error = %e, "association fetch failed; starting empty");
                Vec::new()
            }
        };
        let user_rows = match fetched.users {
            Ok(rows) => rows,
            Err(e) if enforce => return Err(e),
            Err(e) => {
                warn!(error = %e, "user fetch failed; starting empty");
                Vec::new()
            }
        };
        let qos_rows = match fetched.qos {
            Ok(rows) => rows,
            Err(e) if enforce => return Err(e),
            Err(e) => {
                warn!(error = %e, "qos fetch failed; starting empty");
                Vec::new()
            }
        };

        let mut tree = self.build_tree(assoc_rows, enforce)?;
        let users = self.build_users(user_rows);
        let qos = QosList::from_rows(qos_rows);

        {
            let mut current = self.assocs.write().await;
            tree.inherit_capacity(&current);
            tree.recompute_fairshare();
            *current = tree;
        }
        let user_count = users.len();
        *self.users.write().await = users;
        let qos_count = qos.len();
        *self.qos.write().await = qos;
        self.running_cached.store(false, Ordering::Release);

        info!(
            cluster = %self.settings.cluster,
            associations = self.association_count().await,
            users = user_count,
            qos = qos_count,
            "association cache loaded"
        );
        Ok(())
    }

    /// Re-fetch and replace each list, carrying usage over by id.
    ///
    /// A list whose fetch fails is left untouched; the cache is then marked
    /// as running on cached data and `Unavailable` is returned after the
    /// other lists have been refreshed.
    pub async fn refresh(&self, enforce: bool) -> AssocResult<()> {
        let fetched = self.fetch();
        let mut first_error = None;

        match fetched.assocs {
            Ok(rows) => match self.build_tree(rows, enforce) {
                Ok(mut tree) => {
                    let mut current = self.assocs.write().await;
                    let carried = tree.reconcile_usage(&current);
                    tree.inherit_capacity(&current);
                    tree.recompute_fairshare();
                    debug!(carried, "association usage reconciled");
                    *current = tree;
                }
                Err(e) => {
                    warn!(error = %e, "refreshed associations rejected; keeping cached list");
                    first_error.get_or_insert(e);
                }
            },
            Err(e) => {
                warn!(error = %e, "association refresh failed; keeping cached list");
                first_error.get_or_insert(e);
            }
        }

        match fetched.users {
            Ok(rows) => {
                let users = self.build_users(rows);
                *self.users.write().await = users;
            }
            Err(e) => {
                warn!(error = %e, "user refresh failed; keeping cached list");
                first_error.get_or_insert(e);
            }
        }

        match fetched.qos {
            Ok(rows) => {
                let mut qos = QosList::from_rows(rows);
                let mut current = self.qos.write().await;
                qos.reconcile_usage(&current);
                *current = qos;
            }
            Err(e) => {
                warn!(error = %e, "qos refresh failed; keeping cached list");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                self.running_cached.store(true, Ordering::Release);
                Err(match e {
                    AssocError::Unavailable(_) => e,
                    other => AssocError::Unavailable(other.to_string()),
                })
            }
            None => {
                self.running_cached.store(false, Ordering::Release);
                info!("association cache refreshed");
                Ok(())
            }
        }
    }

    // ── Lookups ────────────────────────────────────────────────────

    /// Resolve `partial` to an association and fill its unset fields.
    ///
    /// A miss returns `Ok(None)` and leaves `partial` alone, unless
    /// `enforce` is set, in which case it is `NotFound`.
    pub async fn fill_in_association(
        &self,
        partial: &mut PartialAssociation,
        enforce: bool,
    ) -> AssocResult<Option<AssocId>> {
        let default_account = {
            let users = self.users.read().await;
            default_account_for(&users, partial)
        };
        let tree = self.assocs.read().await;
        let found = find_association(
            &tree,
            partial,
            default_account.as_deref(),
            &self.settings.cluster,
        );
        match found {
            Some(id) => {
                fill_association(&tree, id, partial);
                Ok(Some(id))
            }
            None if enforce => Err(AssocError::NotFound(format!(
                "no association for {}",
                describe(partial)
            ))),
            None => Ok(None),
        }
    }

    pub async fn fill_in_user(&self, partial: &mut PartialUser, enforce: bool) -> AssocResult<bool> {
        let users = self.users.read().await;
        if fill_user(&users, partial) {
            return Ok(true);
        }
        if enforce {
            return Err(AssocError::NotFound(format!(
                "no user with uid {:?} or name {:?}",
                partial.uid, partial.name
            )));
        }
        Ok(false)
    }

    pub async fn fill_in_qos(&self, partial: &mut PartialQos, enforce: bool) -> AssocResult<bool> {
        let qos = self.qos.read().await;
        if fill_qos(&qos, partial) {
            return Ok(true);
        }
        if enforce {
            return Err(AssocError::NotFound(format!(
                "no qos with id {:?} or name {:?}",
                partial.id, partial.name
            )));
        }
        Ok(false)
    }

    /// True if `id` exists, or if nothing is loaded and `enforce` is off.
    pub async fn validate_association_id(&self, id: AssocId, enforce: bool) -> bool {
        let tree = self.assocs.read().await;
        tree.contains(id) || (!enforce && tree.is_empty())
    }

    pub async fn association(&self, id: AssocId) -> Option<Association> {
        self.assocs.read().await.get(id).cloned()
    }

    pub async fn children(&self, id: AssocId) -> Vec<AssocId> {
        self.assocs.read().await.children(id).to_vec()
    }

    pub async fn effective_qos(&self, id: AssocId) -> Vec<String> {
        self.assocs.read().await.effective_qos(id)
    }

    pub async fn association_count(&self) -> usize {
        self.assocs.read().await.len()
    }

    pub async fn qos(&self, name: &str) -> Option<Qos> {
        self.qos.read().await.by_name(name).cloned()
    }

    /// Admin level of the user with `uid`; unknown users have none.
    pub async fn user_admin_level(&self, uid: u32) -> AdminLevel {
        self.users
            .read()
            .await
            .by_uid(uid)
            .map(|u| u.admin_level)
            .unwrap_or_default()
    }

    /// True if the user coordinates `account` or any account above it.
    pub async fn is_user_coord(&self, uid: u32, account: &str) -> bool {
        let coord_accounts = {
            let users = self.users.read().await;
            match users.by_uid(uid) {
                Some(user) if !user.coord_accounts.is_empty() => user.coord_accounts.clone(),
                _ => return false,
            }
        };

        let tree = self.assocs.read().await;
        let Some(start) = tree.iter().find(|a| {
            a.is_account_level()
                && a.account.eq_ignore_ascii_case(account)
                && a.cluster.eq_ignore_ascii_case(&self.settings.cluster)
        }) else {
            return coord_accounts.iter().any(|c| c.eq_ignore_ascii_case(account));
        };

        std::iter::once(start.id)
            .chain(tree.ancestors(start.id))
            .filter_map(|id| tree.get(id))
            .any(|a| coord_accounts.iter().any(|c| c.eq_ignore_ascii_case(&a.account)))
    }

    // ── Updates ────────────────────────────────────────────────────

    /// Apply association deltas in order, best effort.
    pub async fn update_associations(
        &self,
        deltas: Vec<AssocDelta>,
        options: UpdateOptions,
    ) -> UpdateReport {
        let mut report = UpdateReport::default();
        let mut removed = Vec::new();
        {
            let mut tree = self.assocs.write().await;
            let mut structural = false;
            let mut shares = false;

            for (index, delta) in deltas.into_iter().enumerate() {
                let result = match delta {
                    AssocDelta::Add(mut assoc) => {
                        assoc.uid = assoc
                            .user
                            .as_deref()
                            .and_then(|name| self.identity.uid_from_name(name));
                        tree.insert(assoc).map(|()| structural = true)
                    }
                    AssocDelta::Modify(change) => tree.modify(&change).map(|effect| {
                        structural |= effect.structural;
                        shares |= effect.shares;
                    }),
                    AssocDelta::Remove(id) => {
                        let gone = tree.remove_subtree(id);
                        if gone.is_empty() {
                            debug!(assoc_id = id, "remove of unknown association ignored");
                        } else {
                            structural = true;
                            removed.extend(gone);
                        }
                        Ok(())
                    }
                };
                match result {
                    Ok(()) => report.applied += 1,
                    Err(error) => {
                        warn!(index, error = %error, "association delta failed");
                        report.failures.push(DeltaFailure { index, error });
                    }
                }
            }

            if structural {
                tree.reset_usage(options.propagate_usage);
            }
            if structural || shares {
                tree.recompute_fairshare();
                report.recomputed = true;
            }
        }

        if self.settings.fairshare {
            if let Some(notify) = &self.remove_notify {
                for assoc in &removed {
                    notify(assoc);
                }
            }
        }
        info!(
            applied = report.applied,
            failed = report.failures.len(),
            removed = removed.len(),
            recomputed = report.recomputed,
            "association updates applied"
        );
        report
    }

    pub async fn update_users(&self, deltas: Vec<UserDelta>) -> UpdateReport {
        let mut report = UpdateReport::default();
        let mut users = self.users.write().await;
        for (index, delta) in deltas.into_iter().enumerate() {
            let result = match delta {
                UserDelta::Add(mut user) => {
                    user.uid = self.identity.uid_from_name(&user.name);
                    users.insert(user)
                }
                UserDelta::Modify(change) => users.modify(&change),
                UserDelta::Remove(name) => {
                    if users.remove(&name).is_none() {
                        debug!(user = %name, "remove of unknown user ignored");
                    }
                    Ok(())
                }
            };
            match result {
                Ok(()) => report.applied += 1,
                Err(error) => {
                    warn!(index, error = %error, "user delta failed");
                    report.failures.push(DeltaFailure { index, error });
                }
            }
        }
        report
    }

    /// Apply QOS deltas. Removed QOS names are purged from every
    /// association afterwards.
    pub async fn update_qos(&self, deltas: Vec<QosDelta>) -> UpdateReport {
        let mut report = UpdateReport::default();
        let mut purged = Vec::new();
        {
            let mut qos = self.qos.write().await;
            for (index, delta) in deltas.into_iter().enumerate() {
                let result = match delta {
                    QosDelta::Add(entry) => qos.insert(entry),
                    QosDelta::Modify(change) => qos.modify(&change),
                    QosDelta::Remove(id) => {
                        match qos.remove(id) {
                            Some(entry) => purged.push(entry.name),
                            None => debug!(qos_id = id, "remove of unknown qos ignored"),
                        }
                        Ok(())
                    }
                };
                match result {
                    Ok(()) => report.applied += 1,
                    Err(error) => {
                        warn!(index, error = %error, "qos delta failed");
                        report.failures.push(DeltaFailure { index, error });
                    }
                }
            }
        }

        if !purged.is_empty() {
            let mut tree = self.assocs.write().await;
            for name in &purged {
                let touched = tree.purge_qos(name);
                debug!(qos = %name, touched, "qos purged from associations");
            }
        }
        report
    }

    // ── Fairshare and decay ────────────────────────────────────────

    pub async fn recompute_fairshare(&self) {
        self.assocs.write().await.recompute_fairshare();
    }

    /// Set the root capacity. Returns false when nothing changed.
    pub async fn set_cluster_capacity(&self, cpu_count: u32, half_life: u32) -> bool {
        let changed = self.assocs.write().await.set_capacity(cpu_count, half_life);
        if changed {
            info!(cpu_count, half_life, "cluster capacity set");
        }
        changed
    }

    /// Scale every used_shares value by `factor`.
    pub async fn apply_decay(&self, factor: f64) -> AssocResult<()> {
        if !self.settings.fairshare {
            return Ok(());
        }
        if !factor.is_finite() || factor <= 0.0 {
            return Err(AssocError::InvalidArgument(format!(
                "decay factor must be positive, got {factor}"
            )));
        }
        self.assocs.write().await.apply_decay(factor);
        self.qos.write().await.apply_decay(factor);
        debug!(factor, "usage decayed");
        Ok(())
    }

    /// Charge `cpu_seconds` of usage to an association and its ancestors.
    pub async fn record_usage(&self, id: AssocId, cpu_seconds: f64) -> bool {
        self.assocs.write().await.charge(id, cpu_seconds)
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Write all three lists to `path`.
    pub async fn checkpoint(&self, path: &Path) -> AssocResult<()> {
        let _file = self.file_lock.lock().await;
        let assocs = self.assocs.read().await.to_rows();
        let users = self.users.read().await.to_rows();
        let qos = self.qos.read().await.to_rows();
        let bytes = encode_snapshot(&assocs, &users, &qos, unix_now())?;
        write_atomic(path, &bytes).await?;
        info!(
            path = %path.display(),
            associations = assocs.len(),
            users = users.len(),
            qos = qos.len(),
            "checkpoint written"
        );
        Ok(())
    }

    /// Replace all three lists from a checkpoint. The cache is then marked
    /// as running on cached data until the next successful load or refresh.
    pub async fn restore(&self, path: &Path) -> AssocResult<()> {
        let _file = self.file_lock.lock().await;
        let bytes = tokio::fs::read(path).await?;
        let snapshot = decode_snapshot(&bytes)?;

        let (mut tree, rejected) = AssocTree::from_rows(snapshot.associations);
        for row in &rejected {
            warn!(assoc_id = row.id, "dropping unlinked association from checkpoint");
        }
        {
            let mut current = self.assocs.write().await;
            tree.inherit_capacity(&current);
            tree.recompute_fairshare();
            *current = tree;
        }
        *self.users.write().await = UserList::from_rows(snapshot.users);
        if snapshot.version >= 2 {
            *self.qos.write().await = QosList::from_rows(snapshot.qos);
        }
        self.running_cached.store(true, Ordering::Release);
        info!(
            path = %path.display(),
            version = snapshot.version,
            timestamp = snapshot.timestamp,
            "checkpoint restored"
        );
        Ok(())
    }

    /// Write every association's decayed usage to `path`.
    pub async fn save_usage(&self, path: &Path) -> AssocResult<()> {
        let _file = self.file_lock.lock().await;
        let entries: Vec<(AssocId, f64)> = self
            .assocs
            .read()
            .await
            .iter()
            .map(|a| (a.id, a.usage.used_shares))
            .collect();
        let bytes = encode_usage(&entries, unix_now())?;
        write_atomic(path, &bytes).await?;
        debug!(path = %path.display(), entries = entries.len(), "usage saved");
        Ok(())
    }

    /// Apply a usage file. Returns how many entries matched a cached
    /// association; the rest are skipped.
    pub async fn load_usage(&self, path: &Path) -> AssocResult<usize> {
        let _file = self.file_lock.lock().await;
        let bytes = tokio::fs::read(path).await?;
        let (timestamp, entries) = decode_usage(&bytes)?;
        let mut tree = self.assocs.write().await;
        let applied = entries
            .iter()
            .filter(|&&(id, used)| tree.set_used_shares(id, used))
            .count();
        info!(
            path = %path.display(),
            timestamp,
            applied,
            skipped = entries.len() - applied,
            "usage loaded"
        );
        Ok(applied)
    }
}

fn describe(partial: &PartialAssociation) -> String {
    format!(
        "uid={:?} account={:?} cluster={:?} partition={:?}",
        partial.uid, partial.account, partial.cluster, partial.partition
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use fairgrid_state::{StateError, StateResult, StateStore};

    use crate::delta::{AssocModify, QosModify, UserModify};
    use crate::identity::StaticIdentity;

    /// Wraps the in-memory store with a switchable failure.
    struct FlakyStorage {
        inner: StateStore,
        failing: AtomicBool,
    }

    impl FlakyStorage {
        fn fail(&self, on: bool) {
            self.failing.store(on, Ordering::SeqCst);
        }

        fn check(&self) -> StateResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StateError::Read("storage offline".into()));
            }
            Ok(())
        }
    }

    impl AccountingStorage for FlakyStorage {
        fn get_associations(&self, cond: &AssocCondition) -> StateResult<Vec<Association>> {
            self.check()?;
            self.inner.get_associations(cond)
        }

        fn get_users(&self, cond: &UserCondition) -> StateResult<Vec<User>> {
            self.check()?;
            self.inner.get_users(cond)
        }

        fn get_qos(&self, cond: &QosCondition) -> StateResult<Vec<Qos>> {
            self.check()?;
            self.inner.get_qos(cond)
        }
    }

    fn seeded() -> Arc<FlakyStorage> {
        let store = StateStore::open_in_memory().unwrap();
        for assoc in [
            Association::account(1, 0, "hpc", "root", 1),
            Association::account(2, 1, "hpc", "physics", 1),
            Association::account(3, 1, "hpc", "chem", 3),
            Association::user(4, 2, "hpc", "physics", "alice", 1),
            Association::user(5, 3, "hpc", "chem", "bob", 1),
            Association::account(10, 0, "other", "root", 1),
        ] {
            store.put_association(&assoc).unwrap();
        }
        let mut alice = User::new("alice", "physics");
        alice.coord_accounts = vec!["root".into()];
        store.put_user(&alice).unwrap();
        store.put_user(&User::new("bob", "chem")).unwrap();
        store.put_qos(&Qos::new(1, "normal", 10)).unwrap();
        store.put_qos(&Qos::new(2, "high", 20)).unwrap();
        Arc::new(FlakyStorage {
            inner: store,
            failing: AtomicBool::new(false),
        })
    }

    fn cache_with(storage: Arc<FlakyStorage>) -> AssocCache {
        AssocCache::new(
            storage,
            Arc::new(StaticIdentity::new([("alice", 1001), ("bob", 1002)])),
            CacheSettings::new("hpc", true),
        )
    }

    #[tokio::test]
    async fn load_scopes_to_cluster_and_resolves_uids() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        assert_eq!(cache.association_count().await, 5);
        assert_eq!(cache.association(4).await.unwrap().uid, Some(1001));
        let chem = cache.association(3).await.unwrap();
        assert!((chem.norm_shares - 0.75).abs() < 1e-9);
        assert_eq!(cache.qos("NORMAL").await.unwrap().norm_priority, 0.5);
        assert!(!cache.is_running_cached());
    }

    #[tokio::test]
    async fn load_failure_depends_on_enforce() {
        let storage = seeded();
        storage.fail(true);
        let cache = cache_with(storage);
        assert!(matches!(cache.load(true).await, Err(AssocError::Unavailable(_))));
        cache.load(false).await.unwrap();
        assert_eq!(cache.association_count().await, 0);
        assert!(cache.validate_association_id(99, false).await);
        assert!(!cache.validate_association_id(99, true).await);
    }

    #[tokio::test]
    async fn load_with_orphan() {
        let storage = seeded();
        storage
            .inner
            .put_association(&Association::account(20, 77, "hpc", "lost", 1))
            .unwrap();
        let cache = cache_with(storage);
        assert!(matches!(cache.load(true).await, Err(AssocError::Corrupt(_))));
        cache.load(false).await.unwrap();
        assert!(cache.association(20).await.is_none());
        assert_eq!(cache.association_count().await, 5);
    }

    #[tokio::test]
    async fn refresh_failure_keeps_list_and_flags() {
        let storage = seeded();
        let cache = cache_with(storage.clone());
        cache.load(true).await.unwrap();
        storage.fail(true);
        assert!(matches!(cache.refresh(true).await, Err(AssocError::Unavailable(_))));
        assert!(cache.is_running_cached());
        assert_eq!(cache.association_count().await, 5);

        storage.fail(false);
        cache.refresh(true).await.unwrap();
        assert!(!cache.is_running_cached());
    }

    #[tokio::test]
    async fn refresh_carries_usage() {
        let storage = seeded();
        let cache = cache_with(storage.clone());
        cache.load(true).await.unwrap();
        assert!(cache.record_usage(4, 100.0).await);
        storage
            .inner
            .put_association(&Association::user(6, 2, "hpc", "physics", "carol", 1))
            .unwrap();
        cache.refresh(true).await.unwrap();
        assert_eq!(cache.association(4).await.unwrap().usage.used_shares, 100.0);
        assert_eq!(cache.association(2).await.unwrap().usage.used_shares, 100.0);
        assert_eq!(cache.association(6).await.unwrap().usage.used_shares, 0.0);
    }

    #[tokio::test]
    async fn fill_in_association_enforce() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();

        let mut partial = PartialAssociation::by_user(1001, None);
        assert_eq!(cache.fill_in_association(&mut partial, true).await.unwrap(), Some(4));
        assert_eq!(partial.account.as_deref(), Some("physics"));
        assert_eq!(partial.parent_id, Some(2));

        let mut missing = PartialAssociation::by_user(4242, Some("physics"));
        let before = missing.clone();
        assert_eq!(cache.fill_in_association(&mut missing, false).await.unwrap(), None);
        assert_eq!(missing, before);
        assert!(matches!(
            cache.fill_in_association(&mut missing, true).await,
            Err(AssocError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_cache_without_enforce_is_noop() {
        let cache = cache_with(seeded());
        let mut partial = PartialAssociation::by_user(1001, Some("physics"));
        let before = partial.clone();
        assert_eq!(cache.fill_in_association(&mut partial, false).await.unwrap(), None);
        assert_eq!(partial, before);
    }

    #[tokio::test]
    async fn user_and_qos_lookups() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        let mut user = PartialUser {
            uid: Some(1002),
            ..PartialUser::default()
        };
        assert!(cache.fill_in_user(&mut user, true).await.unwrap());
        assert_eq!(user.name.as_deref(), Some("bob"));

        let mut qos = PartialQos {
            name: Some("High".into()),
            ..PartialQos::default()
        };
        assert!(cache.fill_in_qos(&mut qos, true).await.unwrap());
        assert_eq!(qos.priority, Some(20));

        let mut unknown = PartialQos {
            name: Some("nope".into()),
            ..PartialQos::default()
        };
        assert!(!cache.fill_in_qos(&mut unknown, false).await.unwrap());
        assert!(cache.fill_in_qos(&mut unknown, true).await.is_err());
    }

    #[tokio::test]
    async fn coordinators_cover_sub_accounts() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        assert!(cache.is_user_coord(1001, "chem").await);
        assert!(!cache.is_user_coord(1002, "chem").await);
        assert_eq!(cache.user_admin_level(1001).await, AdminLevel::None);
    }

    #[tokio::test]
    async fn batch_is_best_effort() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        let mut change = AssocModify::new(3);
        change.fairshare = Some(1);
        let report = cache
            .update_associations(
                vec![
                    AssocDelta::Modify(AssocModify::new(99)),
                    AssocDelta::Modify(change),
                    AssocDelta::Add(Association::account(2, 1, "hpc", "dup", 1)),
                ],
                UpdateOptions::default(),
            )
            .await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].index, 0);
        assert!(report.recomputed);
        assert!((cache.association(3).await.unwrap().norm_shares - 0.5).abs() < 1e-9);
        assert!(matches!(report.into_result(), Err(AssocError::Conflict(_))));
    }

    #[tokio::test]
    async fn add_then_remove_restores_shape() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        cache.record_usage(4, 40.0).await;
        let norm_before = cache.association(2).await.unwrap().norm_shares;

        cache
            .update_associations(
                vec![
                    AssocDelta::Add(Association::account(7, 1, "hpc", "bio", 4)),
                    AssocDelta::Remove(7),
                ],
                UpdateOptions::default(),
            )
            .await
            .into_result()
            .unwrap();
        let physics = cache.association(2).await.unwrap();
        assert!((physics.norm_shares - norm_before).abs() < 1e-9);
        assert_eq!(physics.usage.used_shares, 40.0);
        assert_eq!(cache.association(3).await.unwrap().usage.used_shares, 0.0);
    }

    #[tokio::test]
    async fn remove_notifies_each_association() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let cache = cache_with(seeded()).with_remove_notify(Arc::new(move |a: &Association| {
            sink.lock().unwrap().push(a.id);
        }));
        cache.load(true).await.unwrap();
        cache
            .update_associations(vec![AssocDelta::Remove(3)], UpdateOptions::default())
            .await;
        let mut ids = seen.lock().unwrap().clone();
        ids.sort();
        assert_eq!(ids, vec![3, 5]);
        assert!((cache.association(2).await.unwrap().norm_shares - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn qos_remove_purges_associations() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        let mut change = AssocModify::new(2);
        change.qos = vec!["normal".into(), "+high".into()];
        cache
            .update_associations(vec![AssocDelta::Modify(change)], UpdateOptions::default())
            .await;
        assert_eq!(cache.effective_qos(4).await, vec!["normal", "high"]);

        let report = cache
            .update_qos(vec![
                QosDelta::Remove(1),
                QosDelta::Modify(QosModify {
                    id: 1,
                    ..QosModify::default()
                }),
            ])
            .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(cache.effective_qos(4).await, vec!["high"]);
        assert_eq!(cache.qos("high").await.unwrap().norm_priority, 1.0);
    }

    #[tokio::test]
    async fn user_updates() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        let report = cache
            .update_users(vec![
                UserDelta::Add(User::new("alice", "x")),
                UserDelta::Modify(UserModify {
                    name: "bob".into(),
                    admin_level: Some(AdminLevel::SuperUser),
                    ..UserModify::default()
                }),
            ])
            .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(cache.user_admin_level(1002).await, AdminLevel::SuperUser);
    }

    #[tokio::test]
    async fn decay_rules() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        cache.record_usage(5, 10.0).await;
        assert!(matches!(cache.apply_decay(0.0).await, Err(AssocError::InvalidArgument(_))));
        assert!(cache.apply_decay(f64::NAN).await.is_err());
        cache.apply_decay(1.0).await.unwrap();
        assert_eq!(cache.association(5).await.unwrap().usage.used_shares, 10.0);
        cache.apply_decay(0.5).await.unwrap();
        assert_eq!(cache.association(5).await.unwrap().usage.used_shares, 5.0);

        let off = AssocCache::new(
            seeded(),
            Arc::new(StaticIdentity::default()),
            CacheSettings::new("hpc", false),
        );
        assert!(off.apply_decay(0.0).await.is_ok());
    }

    #[test]
    fn decay_factor_halves_per_half_life() {
        let day = Duration::from_secs(86_400);
        assert!((decay_factor(day, day) - 0.5).abs() < 1e-12);
        assert!((decay_factor(day * 2, day) - 0.25).abs() < 1e-12);
        assert_eq!(decay_factor(day, Duration::ZERO), 1.0);
    }

    #[tokio::test]
    async fn capacity_memoized() {
        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        assert!(cache.set_cluster_capacity(100, 1000).await);
        assert!(!cache.set_cluster_capacity(100, 1000).await);
        let chem = cache.association(3).await.unwrap();
        assert!((chem.cpu_shares - 150_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn checkpoint_restore_and_usage_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("assoc_mgr_state");
        let usage = dir.path().join("assoc_usage");

        let cache = cache_with(seeded());
        cache.load(true).await.unwrap();
        cache.record_usage(4, 12.5).await;
        cache.checkpoint(&state).await.unwrap();
        cache.save_usage(&usage).await.unwrap();

        let fresh = cache_with(seeded());
        fresh.restore(&state).await.unwrap();
        assert!(fresh.is_running_cached());
        assert_eq!(fresh.association_count().await, 5);
        assert_eq!(fresh.association(4).await.unwrap().usage.used_shares, 12.5);
        assert!(fresh.qos("high").await.is_some());

        let other = cache_with(seeded());
        other.load(true).await.unwrap();
        other
            .update_associations(vec![AssocDelta::Remove(5)], UpdateOptions::default())
            .await;
        assert_eq!(other.load_usage(&usage).await.unwrap(), 4);
        assert_eq!(other.association(4).await.unwrap().usage.used_shares, 12.5);
    }

    #[tokio::test]
    async fn restore_rejects_bad_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assoc_mgr_state");
        let mut bytes = encode_snapshot(&[], &[], &[], 0).unwrap();
        bytes[0..2].copy_from_slice(&3u16.to_be_bytes());
        std::fs::write(&path, bytes).unwrap();
        let cache = cache_with(seeded());
        assert!(matches!(
            cache.restore(&path).await,
            Err(AssocError::IncompatibleCheckpoint { found: 3, .. })
        ));
        assert!(!cache.is_running_cached());
    }
}
