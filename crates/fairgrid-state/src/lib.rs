//! fairgrid-state — accounting storage for fairgrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the raw association, user
//! and QOS rows the association cache loads from.
//!
//! # Architecture
//!
//! All rows are JSON-serialized into redb's `&[u8]` value columns.
//! Associations and QOS are keyed by numeric id, users by name.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and implements [`AccountingStorage`], the read-side contract the cache
//! depends on.

pub mod error;
pub mod storage;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use storage::AccountingStorage;
pub use store::StateStore;
pub use types::*;
