//! Job, node, partition and step records.
//!
//! These are the external registries the scheduling core reads. The core
//! writes only two things back: a job's priority (backfill) and a new step
//! record (step selection).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bitmap::NodeBitmap;
use crate::error::CoreError;

pub type JobId = u32;

// ── Jobs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completed,
    Cancelled,
    Failed,
}

/// A job as seen by the scheduling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub user_id: u32,
    pub partition: String,
    /// Scheduling priority; 0 means held.
    pub priority: u32,
    /// Wall-clock limit in minutes (`None` = partition maximum).
    pub time_limit: Option<u32>,
    pub min_nodes: u32,
    pub state: JobState,
    /// Unix timestamp (seconds) when the job started running.
    pub start_time: Option<u64>,
    /// Nodes granted to a running job.
    pub nodes: Option<NodeBitmap>,
    /// CPUs granted on each allocated node, in ascending node order.
    pub cpus_per_node: Vec<u32>,
    pub steps: Vec<StepRecord>,
    pub next_step_id: u32,
}

impl JobRecord {
    /// A fresh pending job.
    pub fn pending(id: JobId, partition: &str, priority: u32, min_nodes: u32) -> Self {
        Self {
            id,
            user_id: 0,
            partition: partition.to_string(),
            priority,
            time_limit: None,
            min_nodes,
            state: JobState::Pending,
            start_time: None,
            nodes: None,
            cpus_per_node: Vec::new(),
            steps: Vec::new(),
            next_step_id: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_held(&self) -> bool {
        self.priority == 0
    }

    /// The single CPUs-per-node value if every allocated node has the same
    /// count.
    pub fn homogeneous_cpus(&self) -> Option<u32> {
        let first = *self.cpus_per_node.first()?;
        self.cpus_per_node
            .iter()
            .all(|&c| c == first)
            .then_some(first)
    }

    /// CPUs granted on node `index`, if it belongs to the allocation.
    pub fn cpus_on(&self, index: usize) -> Option<u32> {
        let rank = self.nodes.as_ref()?.rank(index)?;
        self.cpus_per_node.get(rank).copied()
    }

    /// Effective time limit in minutes given the partition's maximum.
    pub fn effective_limit(&self, partition_max: Option<u32>) -> Option<u32> {
        self.time_limit.or(partition_max)
    }

    /// Projected end (unix seconds) of a running job.
    pub fn projected_end(&self, partition_max: Option<u32>) -> Option<u64> {
        let start = self.start_time?;
        let limit = self.effective_limit(partition_max)?;
        Some(start + u64::from(limit) * 60)
    }
}

// ── Nodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub index: usize,
    pub name: String,
    pub cpus: u32,
    pub up: bool,
}

// ── Partitions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub name: String,
    pub up: bool,
    /// Only root may submit to this partition.
    pub root_only: bool,
    /// Maximum time limit in minutes (`None` = unlimited).
    pub max_time: Option<u32>,
    /// Maximum nodes per job (`None` = unlimited).
    pub max_nodes: Option<u32>,
    pub priority: u32,
    pub nodes: NodeBitmap,
}

impl PartitionRecord {
    pub fn new(name: &str, priority: u32, nodes: NodeBitmap) -> Self {
        Self {
            name: name.to_string(),
            up: true,
            root_only: false,
            max_time: None,
            max_nodes: None,
            priority,
            nodes,
        }
    }

    /// Whether `job` passes this partition's time and size limits.
    pub fn admits(&self, job: &JobRecord) -> bool {
        if let (Some(max), Some(limit)) = (self.max_time, job.time_limit) {
            if limit > max {
                return false;
            }
        }
        if let Some(max) = self.max_nodes {
            if job.min_nodes > max {
                return false;
            }
        }
        true
    }
}

// ── Steps ──────────────────────────────────────────────────────────

/// Task layout over the selected nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDist {
    Cyclic,
    Block,
}

impl FromStr for TaskDist {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cyclic" => Ok(TaskDist::Cyclic),
            "block" => Ok(TaskDist::Block),
            other => Err(CoreError::UnknownDistribution(other.to_string())),
        }
    }
}

impl fmt::Display for TaskDist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskDist::Cyclic => f.write_str("cyclic"),
            TaskDist::Block => f.write_str("block"),
        }
    }
}

/// Requested node count for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCount {
    /// No explicit node count.
    #[default]
    Any,
    Exactly(u32),
    /// Every available node of the job.
    All,
}

/// A one-shot request for a new job step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub node_list: Option<Vec<String>>,
    /// Skip this many of the job's available nodes (ascending order).
    pub relative: Option<u32>,
    pub node_count: NodeCount,
    /// Requested CPUs (0 = none).
    pub cpu_count: u32,
    pub task_count: u32,
    pub distribution: TaskDist,
}

impl StepSpec {
    pub fn with_tasks(task_count: u32) -> Self {
        Self {
            node_list: None,
            relative: None,
            node_count: NodeCount::Any,
            cpu_count: 0,
            task_count,
            distribution: TaskDist::Block,
        }
    }
}

/// A created step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub job_id: JobId,
    pub step_id: u32,
    pub nodes: NodeBitmap,
    pub node_names: Vec<String>,
    pub task_count: u32,
    pub cpu_count: u32,
    pub distribution: TaskDist,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_job(cpus: Vec<u32>, nodes: &str) -> JobRecord {
        let mut job = JobRecord::pending(1, "batch", 10, 1);
        job.state = JobState::Running;
        job.start_time = Some(1_000);
        job.nodes = Some(NodeBitmap::from_list(16, nodes).unwrap());
        job.cpus_per_node = cpus;
        job
    }

    #[test]
    fn homogeneous_detection() {
        assert_eq!(running_job(vec![8, 8, 8], "0-2").homogeneous_cpus(), Some(8));
        assert_eq!(running_job(vec![8, 4], "0-1").homogeneous_cpus(), None);
        assert_eq!(running_job(vec![], "").homogeneous_cpus(), None);
    }

    #[test]
    fn cpus_on_follows_node_rank() {
        let job = running_job(vec![2, 4, 6], "3,5,9");
        assert_eq!(job.cpus_on(5), Some(4));
        assert_eq!(job.cpus_on(9), Some(6));
        assert_eq!(job.cpus_on(4), None);
    }

    #[test]
    fn projected_end_uses_partition_max() {
        let mut job = running_job(vec![1], "0");
        assert_eq!(job.projected_end(None), None);
        assert_eq!(job.projected_end(Some(10)), Some(1_600));
        job.time_limit = Some(1);
        assert_eq!(job.projected_end(Some(10)), Some(1_060));
    }

    #[test]
    fn partition_admits_limits() {
        let mut part = PartitionRecord::new("batch", 1, NodeBitmap::new(4));
        part.max_time = Some(60);
        part.max_nodes = Some(2);

        let mut job = JobRecord::pending(1, "batch", 5, 2);
        assert!(part.admits(&job));
        job.time_limit = Some(61);
        assert!(!part.admits(&job));
        job.time_limit = Some(60);
        job.min_nodes = 3;
        assert!(!part.admits(&job));
    }

    #[test]
    fn distribution_parsing() {
        assert_eq!("Cyclic".parse::<TaskDist>().unwrap(), TaskDist::Cyclic);
        assert_eq!("block".parse::<TaskDist>().unwrap(), TaskDist::Block);
        assert_eq!(
            "plane".parse::<TaskDist>(),
            Err(CoreError::UnknownDistribution("plane".to_string()))
        );
    }
}
