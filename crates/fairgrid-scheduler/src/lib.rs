//! fairgrid-scheduler — backfill planning and step node selection.
//!
//! Everything here runs against the shared job, node and partition tables
//! held in [`ResourceLocks`]. The scheduler:
//!
//! - Acquires the composite lock in a fixed domain order
//! - Runs a periodic backfill pass that promotes one pending job per
//!   partition when an oracle says it will not delay anyone ahead of it
//! - Selects nodes for new job steps inside a running job's allocation
//!
//! # Architecture
//!
//! ```text
//! ResourceLocks (config -> jobs -> nodes -> partitions)
//!   ├── BackfillPlanner
//!   │     ├── FeasibilityOracle (NodeSpaceOracle by default)
//!   │     └── trampoline        (wakes the main scheduler)
//!   └── StepSelector
//!         └── StepTopology      (LayoutTopology by default)
//! ```

pub mod backfill;
pub mod error;
pub mod locks;
pub mod oracle;
pub mod step;

pub use backfill::{BackfillHandle, BackfillPlanner, PassReport, Trampoline};
pub use error::{SchedulerError, SchedulerResult, TopologyError};
pub use locks::{Access, LockRequest, ResourceGuard, ResourceLocks};
pub use oracle::{BackfillWindow, FeasibilityOracle, NodeSpaceOracle, RunningHold};
pub use step::{
    LayoutTopology, StepSelector, StepTopology, check_task_count, parse_distribution,
    select_step_nodes, task_layout,
};
