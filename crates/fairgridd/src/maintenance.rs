//! Periodic cache upkeep: storage refresh, usage decay and checkpointing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fairgrid_assoc::{AssocCache, decay_factor};

/// Decay usage every `interval` by the factor implied by `half_life`.
pub async fn decay_loop(
    cache: Arc<AssocCache>,
    interval: Duration,
    half_life: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let factor = decay_factor(interval, half_life);
    info!(
        interval_secs = interval.as_secs(),
        half_life_secs = half_life.as_secs(),
        factor,
        "decay loop starting"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = cache.apply_decay(factor).await {
                    error!(error = %e, "usage decay failed");
                }
            }
            _ = shutdown.changed() => {
                debug!("decay loop shutting down");
                return;
            }
        }
    }
}

/// Re-fetch the cache from accounting storage every `interval`.
///
/// A failed refresh keeps the cached lists; the next tick tries again.
pub async fn refresh_loop(
    cache: Arc<AssocCache>,
    interval: Duration,
    enforce: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(interval_secs = interval.as_secs(), "refresh loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let was_cached = cache.is_running_cached();
                match cache.refresh(enforce).await {
                    Ok(()) if was_cached => info!("accounting storage back, cached data replaced"),
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "refresh failed, running on cached data"),
                }
            }
            _ = shutdown.changed() => {
                debug!("refresh loop shutting down");
                return;
            }
        }
    }
}

/// Where the cache is persisted.
#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    pub state: PathBuf,
    pub usage: PathBuf,
}

/// Write the checkpoint and the usage file once.
pub async fn write_checkpoint(cache: &AssocCache, paths: &CheckpointPaths) {
    if let Err(e) = cache.checkpoint(&paths.state).await {
        error!(path = %paths.state.display(), error = %e, "checkpoint failed");
    }
    if let Err(e) = cache.save_usage(&paths.usage).await {
        error!(path = %paths.usage.display(), error = %e, "usage save failed");
    }
}

pub async fn checkpoint_loop(
    cache: Arc<AssocCache>,
    paths: CheckpointPaths,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(interval_secs = interval.as_secs(), "checkpoint loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                write_checkpoint(&cache, &paths).await;
            }
            _ = shutdown.changed() => {
                debug!("checkpoint loop shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use fairgrid_assoc::{CacheSettings, StaticIdentity};
    use fairgrid_state::*;

    struct Switchable {
        inner: StateStore,
        offline: AtomicBool,
    }

    impl Switchable {
        fn check(&self) -> StateResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(StateError::Read("storage offline".into()));
            }
            Ok(())
        }
    }

    impl AccountingStorage for Switchable {
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

    fn storage(offline: bool) -> Arc<Switchable> {
        let inner = StateStore::open_in_memory().unwrap();
        inner
            .put_association(&Association::account(1, 0, "hpc", "root", 1))
            .unwrap();
        inner
            .put_association(&Association::account(2, 1, "hpc", "physics", 1))
            .unwrap();
        Arc::new(Switchable {
            inner,
            offline: AtomicBool::new(offline),
        })
    }

    fn cache_over(storage: Arc<Switchable>) -> Arc<AssocCache> {
        Arc::new(AssocCache::new(
            storage,
            Arc::new(StaticIdentity::default()),
            CacheSettings::new("hpc", true),
        ))
    }

    #[tokio::test]
    async fn refresh_recovers_once_storage_returns() {
        let storage = storage(true);
        let cache = cache_over(storage.clone());
        assert!(cache.refresh(false).await.is_err());
        assert!(cache.is_running_cached());
        assert_eq!(cache.association_count().await, 0);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(refresh_loop(
            cache.clone(),
            Duration::from_millis(10),
            false,
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.is_running_cached());

        storage.offline.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = tx.send(true);
        handle.await.unwrap();

        assert!(!cache.is_running_cached());
        assert_eq!(cache.association_count().await, 2);
    }

    #[tokio::test]
    async fn checkpoint_loop_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths {
            state: dir.path().join("assoc_mgr_state"),
            usage: dir.path().join("assoc_usage"),
        };
        let cache = cache_over(storage(false));
        cache.load(true).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(checkpoint_loop(
            cache.clone(),
            paths.clone(),
            Duration::from_millis(10),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = tx.send(true);
        handle.await.unwrap();

        assert!(paths.state.exists());
        assert!(paths.usage.exists());
    }
}
