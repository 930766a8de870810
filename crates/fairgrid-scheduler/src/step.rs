//! Step node selection.
//!
//! Carves the node set for a new job step out of the job's allocation.
//! Nodes are always taken in ascending index order, so the same request
//! against the same state picks the same nodes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use fairgrid_core::{
    CoreError, JobId, JobRecord, NodeBitmap, NodeCount, NodeTable, StepRecord, StepSpec, TaskDist,
};

use crate::error::{SchedulerError, SchedulerResult, TopologyError};
use crate::locks::{LockRequest, ResourceLocks};

/// Lays tasks out over a step's nodes.
pub trait StepTopology: Send + Sync {
    fn build_step_topology(
        &self,
        nodes: &[String],
        tasks: u32,
        distribution: TaskDist,
    ) -> Result<(), TopologyError>;
}

/// Task ids placed on each of `nodes` nodes.
///
/// Both distributions give the first `tasks % nodes` nodes one extra task.
/// Block hands out contiguous id ranges; cyclic deals ids round robin.
pub fn task_layout(nodes: usize, tasks: u32, distribution: TaskDist) -> Vec<Vec<u32>> {
    if nodes == 0 {
        return Vec::new();
    }
    let n = nodes as u32;
    let mut layout = vec![Vec::new(); nodes];
    match distribution {
        TaskDist::Cyclic => {
            for task in 0..tasks {
                layout[(task % n) as usize].push(task);
            }
        }
        TaskDist::Block => {
            let (per, extra) = (tasks / n, tasks % n);
            let mut next = 0;
            for (i, slot) in layout.iter_mut().enumerate() {
                let here = per + u32::from((i as u32) < extra);
                slot.extend(next..next + here);
                next += here;
            }
        }
    }
    layout
}

/// The default topology: every node must receive at least one task.
#[derive(Debug, Default, Clone, Copy)]
pub struct LayoutTopology;

impl StepTopology for LayoutTopology {
    fn build_step_topology(
        &self,
        nodes: &[String],
        tasks: u32,
        distribution: TaskDist,
    ) -> Result<(), TopologyError> {
        let layout = task_layout(nodes.len(), tasks, distribution);
        if let Some(idle) = layout.iter().position(Vec::is_empty) {
            return Err(TopologyError(format!(
                "{} tasks leave node {} without work under {distribution} distribution",
                tasks, nodes[idle]
            )));
        }
        let counts: Vec<usize> = layout.iter().map(Vec::len).collect();
        debug!(?counts, %distribution, "step layout built");
        Ok(())
    }
}

/// Parse a distribution name, rejecting anything but `cyclic` or `block`.
pub fn parse_distribution(name: &str) -> SchedulerResult<TaskDist> {
    Ok(name.parse()?)
}

fn invalid_node_list() -> SchedulerError {
    SchedulerError::InvalidArgument("invalid node list".into())
}

/// Choose the nodes for a step of `job`. Pure: nothing is modified.
pub fn select_step_nodes(
    job: &JobRecord,
    nodes: &NodeTable,
    spec: &StepSpec,
) -> SchedulerResult<NodeBitmap> {
    let granted = job.nodes.as_ref().ok_or_else(|| {
        SchedulerError::InvalidArgument(format!("job {} has no allocated nodes", job.id))
    })?;
    let available = granted.and(nodes.available());

    if spec.node_count == NodeCount::All {
        if available.is_clear() {
            return Err(SchedulerError::CapacityExceeded(
                "no allocated nodes are available".into(),
            ));
        }
        return Ok(available);
    }

    let mut picked = NodeBitmap::new(available.size());
    let mut pool = available.clone();

    if let Some(list) = &spec.node_list {
        let wanted = nodes.bitmap_from_names(list).map_err(|e| match e {
            CoreError::UnknownNode(_) => invalid_node_list(),
            other => other.into(),
        })?;
        if !wanted.is_subset_of(granted) {
            return Err(invalid_node_list());
        }
        if !wanted.is_subset_of(nodes.available()) {
            return Err(SchedulerError::CapacityExceeded(
                "nodes currently unavailable".into(),
            ));
        }
        pool = pool.and_not(&wanted);
        picked = wanted;
    } else if let Some(offset) = spec.relative {
        let offset = offset as usize;
        if offset >= pool.weight() {
            return Err(SchedulerError::CapacityExceeded(format!(
                "relative offset {offset} is beyond the {} available nodes",
                pool.weight()
            )));
        }
        if let Some(skipped) = pool.first_n(offset) {
            pool = pool.and_not(&skipped);
        }
    }

    let mut node_target = match spec.node_count {
        NodeCount::Exactly(n) => Some(n as usize),
        _ => None,
    };
    let mut cpu_target = spec.cpu_count;
    if cpu_target > 0 {
        if let Some(per_node) = job.homogeneous_cpus().filter(|&c| c > 0) {
            let needed = cpu_target.div_ceil(per_node) as usize;
            node_target = Some(node_target.map_or(needed, |t| t.max(needed)));
            cpu_target = 0;
        }
    }
    if node_target.is_none() && cpu_target == 0 && spec.node_list.is_none() {
        node_target = Some(1);
    }

    let have = picked.weight();
    if let Some(target) = node_target.filter(|&t| t > have) {
        let more = pool.first_n(target - have).ok_or_else(|| {
            SchedulerError::CapacityExceeded(format!(
                "step needs {target} nodes, {} available",
                have + pool.weight()
            ))
        })?;
        picked = picked.or(&more);
    } else if cpu_target > 0 {
        let mut cpus: u32 = picked.iter().filter_map(|i| job.cpus_on(i)).sum();
        for index in pool.iter() {
            if cpus >= cpu_target {
                break;
            }
            picked.set(index)?;
            cpus += job.cpus_on(index).unwrap_or(0);
        }
        if cpus < cpu_target {
            return Err(SchedulerError::CapacityExceeded(format!(
                "step needs {cpu_target} cpus, {cpus} available"
            )));
        }
    }

    if picked.is_clear() {
        return Err(SchedulerError::CapacityExceeded("no nodes selected".into()));
    }
    Ok(picked)
}

/// Check `tasks` against the selected node count.
pub fn check_task_count(nodes: usize, tasks: u32, max_tasks_per_node: u32) -> SchedulerResult<()> {
    let limit = nodes as u64 * u64::from(max_tasks_per_node);
    if tasks == 0 || u64::from(tasks) > limit {
        return Err(SchedulerError::CapacityExceeded(format!(
            "{tasks} tasks on {nodes} nodes (at most {max_tasks_per_node} per node)"
        )));
    }
    Ok(())
}

/// Creates job steps under the composite lock.
pub struct StepSelector {
    locks: Arc<ResourceLocks>,
    topology: Arc<dyn StepTopology>,
}

impl StepSelector {
    pub fn new(locks: Arc<ResourceLocks>, topology: Arc<dyn StepTopology>) -> Self {
        Self { locks, topology }
    }

    /// Select nodes for a new step of `job_id` and record it on the job.
    pub async fn create_step(&self, job_id: JobId, spec: &StepSpec) -> SchedulerResult<StepRecord> {
        let mut guard = self.locks.acquire(LockRequest::STEP).await;
        let max_tasks = guard.config()?.steps.max_tasks_per_node;

        let record = {
            let job = guard
                .jobs()?
                .get(job_id)
                .ok_or(SchedulerError::JobNotFound(job_id))?;
            if !job.is_running() {
                return Err(SchedulerError::InvalidArgument(format!(
                    "job {job_id} is not running"
                )));
            }
            let nodes = guard.nodes()?;
            let selected = select_step_nodes(job, nodes, spec)?;
            check_task_count(selected.weight(), spec.task_count, max_tasks)?;
            StepRecord {
                job_id,
                step_id: job.next_step_id,
                node_names: nodes.names(&selected),
                nodes: selected,
                task_count: spec.task_count,
                cpu_count: spec.cpu_count,
                distribution: spec.distribution,
            }
        };

        if let Err(e) = self.topology.build_step_topology(
            &record.node_names,
            record.task_count,
            record.distribution,
        ) {
            warn!(job_id, step_id = record.step_id, error = %e, "step topology failed");
            return Err(e.into());
        }

        let job = guard
            .jobs_mut()?
            .get_mut(job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        job.steps.push(record.clone());
        job.next_step_id += 1;
        info!(
            job_id,
            step_id = record.step_id,
            nodes = %record.nodes,
            tasks = record.task_count,
            "step created"
        );
        Ok(record)
    }
}
