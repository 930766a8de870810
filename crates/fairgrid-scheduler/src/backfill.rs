//! Backfill planner.
//!
//! A background loop that wakes on an interval (or when poked), and for each
//! partition promotes at most one pending job that can start now without
//! delaying anything ahead of it. The highest-priority pending job of a
//! partition is the baseline and is never promoted itself.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use fairgrid_core::{JobId, JobRecord, JobState, NodeBitmap, PartitionRecord};

use crate::error::SchedulerResult;
use crate::locks::{LockRequest, ResourceGuard, ResourceLocks};
use crate::oracle::{BackfillWindow, FeasibilityOracle, RunningHold};

/// Kicks the main scheduler after a promotion.
pub type Trampoline = Arc<dyn Fn() + Send + Sync>;

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub promoted: Vec<JobId>,
    pub partitions_scanned: usize,
    /// Nothing changed since the previous pass.
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamps {
    jobs: u64,
    nodes: u64,
    partitions: u64,
}

pub struct BackfillPlanner {
    locks: Arc<ResourceLocks>,
    oracle: Arc<dyn FeasibilityOracle>,
    trampoline: Option<Trampoline>,
    last_seen: Mutex<Option<Stamps>>,
}

impl BackfillPlanner {
    pub fn new(locks: Arc<ResourceLocks>, oracle: Arc<dyn FeasibilityOracle>) -> Self {
        Self {
            locks,
            oracle,
            trampoline: None,
            last_seen: Mutex::new(None),
        }
    }

    pub fn with_trampoline(mut self, trampoline: Trampoline) -> Self {
        self.trampoline = Some(trampoline);
        self
    }

    /// Run one pass now.
    pub async fn run_pass(&self) -> PassReport {
        let mut last_seen = self.last_seen.lock().await;
        let report = {
            let mut guard = self.locks.acquire(LockRequest::BACKFILL).await;
            match scan(&mut guard, self.oracle.as_ref(), *last_seen, unix_now()) {
                Ok((report, stamps)) => {
                    *last_seen = Some(stamps);
                    report
                }
                Err(e) => {
                    error!(error = %e, "backfill pass aborted");
                    return PassReport::default();
                }
            }
        };

        if !report.promoted.is_empty() {
            if let Some(trampoline) = &self.trampoline {
                trampoline();
            }
        }
        report
    }

    /// Spawn the planner loop.
    pub fn start(self: Arc<Self>, interval: Duration) -> BackfillHandle {
        let notify = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(self, interval, notify.clone(), shutdown_rx));
        BackfillHandle {
            notify,
            shutdown_tx,
            task,
        }
    }
}

/// Control surface of a running planner loop.
pub struct BackfillHandle {
    notify: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BackfillHandle {
    /// Request an extra pass. Signals raised before the loop wakes collapse
    /// into one.
    pub fn signal_more_work(&self) {
        self.notify.notify_one();
    }

    /// Stop the loop after any in-flight pass, and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "backfill task ended abnormally");
        }
    }
}

async fn run_loop(
    planner: Arc<BackfillPlanner>,
    interval: Duration,
    notify: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "backfill planner started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = notify.notified() => {
                debug!("backfill woken by signal");
            }
            _ = shutdown.changed() => {
                info!("backfill planner shutting down");
                break;
            }
        }
        if *shutdown.borrow() {
            info!("backfill planner shutting down");
            break;
        }
        let report = planner.run_pass().await;
        if !report.skipped {
            debug!(
                scanned = report.partitions_scanned,
                promoted = report.promoted.len(),
                "backfill pass complete"
            );
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One pass under the composite lock. Returns the report and the stamps to
/// remember for the next pass.
fn scan(
    guard: &mut ResourceGuard<'_>,
    oracle: &dyn FeasibilityOracle,
    last_seen: Option<Stamps>,
    now: u64,
) -> SchedulerResult<(PassReport, Stamps)> {
    let stamps = Stamps {
        jobs: guard.jobs()?.last_update(),
        nodes: guard.nodes()?.last_update(),
        partitions: guard.partitions()?.last_update(),
    };
    if last_seen == Some(stamps) {
        debug!("backfill skipped: nothing changed");
        let report = PassReport {
            skipped: true,
            ..PassReport::default()
        };
        return Ok((report, stamps));
    }

    let root_filter = guard.config()?.backfill.root_filter;
    let mut report = PassReport::default();
    let mut promotions: Vec<(JobId, u32)> = Vec::new();
    {
        let jobs = guard.jobs()?;
        let nodes = guard.nodes()?;
        let partitions = guard.partitions()?;

        let busy = jobs
            .iter()
            .filter(|j| holds_nodes(j))
            .filter_map(|j| j.nodes.as_ref())
            .fold(NodeBitmap::new(nodes.len()), |acc, map| acc.or(map));

        for partition in partitions.by_priority() {
            if !partition.up {
                debug!(partition = %partition.name, "backfill skips down partition");
                continue;
            }
            if partition.root_only && root_filter {
                debug!(partition = %partition.name, "backfill skips root-only partition");
                continue;
            }

            let mut candidates: Vec<&JobRecord> = jobs
                .iter()
                .filter(|j| j.partition == partition.name && j.is_pending())
                .filter(|j| {
                    let eligible = !j.is_held() && partition.admits(j);
                    if !eligible {
                        debug!(job_id = j.id, partition = %partition.name, "job not a backfill candidate");
                    }
                    eligible
                })
                .collect();
            if candidates.is_empty() {
                continue;
            }
            report.partitions_scanned += 1;
            candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

            let baseline = candidates[0];
            let Some(promoted) = baseline.priority.checked_add(1) else {
                debug!(
                    baseline = baseline.id,
                    partition = %partition.name,
                    "baseline at top priority, nothing can be promoted past it"
                );
                continue;
            };

            let usable = partition.nodes.and(nodes.available());
            let idle = usable.and_not(&busy);
            let running = running_holds(jobs.iter(), partition, &usable);

            if let Some(job) = pick(oracle, partition, &candidates, &idle, &running, now) {
                info!(
                    job_id = job.id,
                    partition = %partition.name,
                    from = job.priority,
                    to = promoted,
                    baseline = baseline.id,
                    "backfill promoting job"
                );
                promotions.push((job.id, promoted));
            }
        }
    }

    let jobs = guard.jobs_mut()?;
    for &(id, priority) in &promotions {
        jobs.set_priority(id, priority);
        report.promoted.push(id);
    }
    let stamps = Stamps {
        jobs: jobs.last_update(),
        ..stamps
    };
    Ok((report, stamps))
}

fn holds_nodes(job: &JobRecord) -> bool {
    matches!(job.state, JobState::Running | JobState::Suspended)
}

fn running_holds<'a>(
    jobs: impl Iterator<Item = &'a JobRecord>,
    partition: &PartitionRecord,
    usable: &NodeBitmap,
) -> Vec<RunningHold> {
    jobs.filter(|j| holds_nodes(j))
        .filter_map(|j| {
            let held = j.nodes.as_ref()?.and(usable);
            (!held.is_clear()).then(|| RunningHold {
                job_id: j.id,
                nodes: held,
                end: j.projected_end(partition.max_time),
            })
        })
        .collect()
}

/// The first candidate after the baseline the oracle accepts.
fn pick<'a>(
    oracle: &dyn FeasibilityOracle,
    partition: &PartitionRecord,
    candidates: &[&'a JobRecord],
    idle: &NodeBitmap,
    running: &[RunningHold],
    now: u64,
) -> Option<&'a JobRecord> {
    let baseline = *candidates.first()?;
    for (position, &candidate) in candidates.iter().enumerate().skip(1) {
        let window = BackfillWindow {
            candidate,
            baseline,
            ahead: &candidates[..position],
            partition,
            idle,
            running,
            now,
        };
        if oracle.can_start_without_delay(&window) {
            return Some(candidate);
        }
    }
    None
}
