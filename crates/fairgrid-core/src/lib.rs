//! fairgrid-core — shared records for the fairgrid scheduling core.
//!
//! - **`bitmap`**: fixed-size node bitmaps
//! - **`types`**: job, node, partition and step records
//! - **`tables`**: the job/node/partition registries with update stamps
//! - **`config`**: `fairgrid.toml` parsing

pub mod bitmap;
pub mod config;
pub mod error;
pub mod tables;
pub mod types;

pub use bitmap::NodeBitmap;
pub use config::{FairgridConfig, NodeGroupConfig, PartitionConfig};
pub use error::{CoreError, CoreResult};
pub use tables::{JobTable, NodeTable, PartitionTable};
pub use types::*;
