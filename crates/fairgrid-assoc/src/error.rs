//! Association cache error types.

use thiserror::Error;

/// Errors returned by association cache operations.
#[derive(Debug, Error)]
pub enum AssocError {
    /// Lookup failed while enforcement is on.
    #[error("not found: {0}")]
    NotFound(String),

    /// The accounting storage could not be reached.
    #[error("accounting storage unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Modify of a missing id, duplicate add, or a change that would break
    /// the tree.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("incompatible checkpoint version {found} (accepted {min}..={max})")]
    IncompatibleCheckpoint { found: u16, min: u16, max: u16 },

    #[error("corrupt state: {0}")]
    Corrupt(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type AssocResult<T> = Result<T, AssocError>;
