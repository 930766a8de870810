//! Standalone mode: every subsystem in one process.
//!
//! 1. Opens the accounting store
//! 2. Restores the cache checkpoint, then refreshes it from the store
//! 3. Builds the node and partition tables from config
//! 4. Starts the backfill, refresh, decay and checkpoint loops
//! 5. On Ctrl-C stops the loops and writes a final checkpoint

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fairgrid_assoc::{AssocCache, AssocError, CacheSettings, SystemIdentity};
use fairgrid_core::{FairgridConfig, JobTable};
use fairgrid_scheduler::{BackfillPlanner, NodeSpaceOracle, ResourceLocks};
use fairgrid_state::{Association, StateStore};

use crate::maintenance::{self, CheckpointPaths};

pub async fn run(config: FairgridConfig) -> anyhow::Result<()> {
    info!(cluster = %config.cluster.name, "fairgrid daemon starting");

    let state_dir = config.accounting.state_dir.clone();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("create state dir {}", state_dir.display()))?;

    // ── Accounting cache ─────────────────────────────────────────

    let db_path = state_dir.join("accounting.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "accounting store opened");

    let settings = CacheSettings::new(&config.cluster.name, config.accounting.fairshare);
    let cache = AssocCache::new(Arc::new(store), Arc::new(SystemIdentity), settings)
        .with_remove_notify(Arc::new(|assoc: &Association| {
            debug!(assoc_id = assoc.id, account = %assoc.account, "association removed");
        }));
    let cache = Arc::new(cache);

    let paths = CheckpointPaths {
        state: config.checkpoint_path(),
        usage: config.usage_path(),
    };
    restore_cache(&cache, &config, &paths).await?;

    // ── Scheduling state ─────────────────────────────────────────

    let nodes = config.node_table();
    let partitions = config.partition_table(&nodes)?;
    info!(
        nodes = nodes.len(),
        partitions = partitions.len(),
        "inventory built"
    );

    let cpu_count = match config.cluster.cpu_count {
        0 => u32::try_from(nodes.total_cpus()).unwrap_or(u32::MAX),
        n => n,
    };
    cache
        .set_cluster_capacity(cpu_count, config.accounting.half_life_secs)
        .await;

    let backfill_interval = Duration::from_secs(config.backfill.interval_secs);
    let decay_interval = Duration::from_secs(config.accounting.decay_interval_secs);
    let checkpoint_interval = Duration::from_secs(config.accounting.checkpoint_interval_secs);
    let half_life = Duration::from_secs(u64::from(config.accounting.half_life_secs));
    let refresh_interval = Duration::from_secs(config.accounting.refresh_interval_secs);
    let enforce = config.accounting.enforce;

    let locks = Arc::new(ResourceLocks::new(config, JobTable::new(), nodes, partitions));
    let planner = BackfillPlanner::new(locks, Arc::new(NodeSpaceOracle))
        .with_trampoline(Arc::new(|| debug!("backfill requested a scheduling pass")));
    let backfill = Arc::new(planner).start(backfill_interval);

    // ── Background tasks ─────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let refresh_handle = if refresh_interval.is_zero() {
        debug!("periodic refresh disabled");
        None
    } else {
        Some(tokio::spawn(maintenance::refresh_loop(
            cache.clone(),
            refresh_interval,
            enforce,
            shutdown_rx.clone(),
        )))
    };

    let decay_handle = tokio::spawn(maintenance::decay_loop(
        cache.clone(),
        decay_interval,
        half_life,
        shutdown_rx.clone(),
    ));
    let checkpoint_handle = tokio::spawn(maintenance::checkpoint_loop(
        cache.clone(),
        paths.clone(),
        checkpoint_interval,
        shutdown_rx,
    ));

    info!("fairgrid daemon running");
    tokio::signal::ctrl_c()
        .await
        .context("install Ctrl-C handler")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    backfill.stop().await;
    if let Some(handle) = refresh_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "refresh task ended abnormally");
        }
    }
    if let Err(e) = decay_handle.await {
        error!(error = %e, "decay task ended abnormally");
    }
    if let Err(e) = checkpoint_handle.await {
        error!(error = %e, "checkpoint task ended abnormally");
    }
    maintenance::write_checkpoint(&cache, &paths).await;

    info!("fairgrid daemon stopped");
    Ok(())
}

/// Bring the cache up from the checkpoint and the store.
///
/// A missing checkpoint is normal on first start. After a successful restore
/// the store is read with `refresh`, so a storage failure leaves the restored
/// data in place. With nothing restored a failure is fatal only under
/// enforcement.
async fn restore_cache(
    cache: &AssocCache,
    config: &FairgridConfig,
    paths: &CheckpointPaths,
) -> anyhow::Result<()> {
    let enforce = config.accounting.enforce;

    let restored = match cache.restore(&paths.state).await {
        Ok(()) => true,
        Err(AssocError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %paths.state.display(), error = %e, "checkpoint not restored");
            false
        }
    };

    let fetched = if restored {
        cache.refresh(enforce).await
    } else {
        cache.load(enforce).await
    };
    match fetched {
        Ok(()) => {}
        Err(e @ AssocError::Unavailable(_)) if restored || !enforce => {
            warn!(error = %e, "accounting storage unavailable, running on cached data");
        }
        Err(e) => return Err(e.into()),
    }

    match cache.load_usage(&paths.usage).await {
        Ok(_) => {}
        Err(AssocError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %paths.usage.display(), error = %e, "usage file not loaded"),
    }

    info!(
        associations = cache.association_count().await,
        running_cached = cache.is_running_cached(),
        "accounting cache ready"
    );
    Ok(())
}
