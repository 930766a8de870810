//! The composite resource lock.
//!
//! Four domains (config, jobs, nodes, partitions), each behind a tokio
//! `RwLock`, always acquired in that order so two holders can never wait
//! on each other. Callers say up front which domains they need and how;
//! the returned guard refuses access to anything else.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use fairgrid_core::{FairgridConfig, JobTable, NodeTable, PartitionTable};

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    None,
    Read,
    Write,
}

/// Per-domain access wanted from `ResourceLocks::acquire`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockRequest {
    pub config: Access,
    pub jobs: Access,
    pub nodes: Access,
    pub partitions: Access,
}

impl LockRequest {
    /// What a backfill pass holds.
    pub const BACKFILL: LockRequest = LockRequest {
        config: Access::Read,
        jobs: Access::Write,
        nodes: Access::Read,
        partitions: Access::Read,
    };

    /// What step creation holds.
    pub const STEP: LockRequest = LockRequest {
        config: Access::Read,
        jobs: Access::Write,
        nodes: Access::Read,
        partitions: Access::None,
    };
}

/// The shared scheduling state.
#[derive(Debug, Default)]
pub struct ResourceLocks {
    config: RwLock<FairgridConfig>,
    jobs: RwLock<JobTable>,
    nodes: RwLock<NodeTable>,
    partitions: RwLock<PartitionTable>,
}

enum Held<'a, T> {
    None,
    Read(RwLockReadGuard<'a, T>),
    Write(RwLockWriteGuard<'a, T>),
}

impl<'a, T> Held<'a, T> {
    async fn acquire(lock: &'a RwLock<T>, access: Access) -> Held<'a, T> {
        match access {
            Access::None => Held::None,
            Access::Read => Held::Read(lock.read().await),
            Access::Write => Held::Write(lock.write().await),
        }
    }

    fn get(&self, domain: &'static str) -> SchedulerResult<&T> {
        match self {
            Held::Read(guard) => Ok(guard),
            Held::Write(guard) => Ok(guard),
            Held::None => Err(SchedulerError::LockNotHeld { domain, mode: "read" }),
        }
    }

    fn get_mut(&mut self, domain: &'static str) -> SchedulerResult<&mut T> {
        match self {
            Held::Write(guard) => Ok(guard),
            _ => Err(SchedulerError::LockNotHeld { domain, mode: "write" }),
        }
    }
}

/// Domains held for one acquisition. Dropping it releases everything.
pub struct ResourceGuard<'a> {
    config: Held<'a, FairgridConfig>,
    jobs: Held<'a, JobTable>,
    nodes: Held<'a, NodeTable>,
    partitions: Held<'a, PartitionTable>,
}

impl ResourceLocks {
    pub fn new(
        config: FairgridConfig,
        jobs: JobTable,
        nodes: NodeTable,
        partitions: PartitionTable,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            jobs: RwLock::new(jobs),
            nodes: RwLock::new(nodes),
            partitions: RwLock::new(partitions),
        }
    }

    pub async fn acquire(&self, request: LockRequest) -> ResourceGuard<'_> {
        let config = Held::acquire(&self.config, request.config).await;
        let jobs = Held::acquire(&self.jobs, request.jobs).await;
        let nodes = Held::acquire(&self.nodes, request.nodes).await;
        let partitions = Held::acquire(&self.partitions, request.partitions).await;
        ResourceGuard {
            config,
            jobs,
            nodes,
            partitions,
        }
    }
}

impl ResourceGuard<'_> {
    pub fn config(&self) -> SchedulerResult<&FairgridConfig> {
        self.config.get("config")
    }

    pub fn config_mut(&mut self) -> SchedulerResult<&mut FairgridConfig> {
        self.config.get_mut("config")
    }

    pub fn jobs(&self) -> SchedulerResult<&JobTable> {
        self.jobs.get("jobs")
    }

    pub fn jobs_mut(&mut self) -> SchedulerResult<&mut JobTable> {
        self.jobs.get_mut("jobs")
    }

    pub fn nodes(&self) -> SchedulerResult<&NodeTable> {
        self.nodes.get("nodes")
    }

    pub fn nodes_mut(&mut self) -> SchedulerResult<&mut NodeTable> {
        self.nodes.get_mut("nodes")
    }

    pub fn partitions(&self) -> SchedulerResult<&PartitionTable> {
        self.partitions.get("partitions")
    }

    pub fn partitions_mut(&mut self) -> SchedulerResult<&mut PartitionTable> {
        self.partitions.get_mut("partitions")
    }
}
