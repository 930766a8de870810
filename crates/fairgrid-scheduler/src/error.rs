//! Scheduler error types.

use thiserror::Error;

use fairgrid_core::{CoreError, JobId};

/// Failure reported by a step topology builder.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TopologyError(pub String);

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("step topology rejected: {0}")]
    Topology(#[from] TopologyError),

    /// A guard accessor was used for a domain the request did not cover.
    #[error("{domain} lock not held for {mode}")]
    LockNotHeld {
        domain: &'static str,
        mode: &'static str,
    },
}

impl From<CoreError> for SchedulerError {
    fn from(e: CoreError) -> Self {
        SchedulerError::InvalidArgument(e.to_string())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
