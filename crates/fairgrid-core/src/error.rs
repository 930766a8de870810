//! Error types for core records and bitmaps.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by bitmap and registry helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("node index {index} out of range (bitmap size {size})")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("invalid node range: {0}")]
    InvalidRange(String),

    #[error("unknown task distribution: {0}")]
    UnknownDistribution(String),
}
