//! fairgrid-assoc — the association and fairshare cache.
//!
//! Holds the association tree, users and QOS loaded from an
//! [`AccountingStorage`](fairgrid_state::AccountingStorage), and turns
//! fairshare weights into normalized shares. The cache:
//!
//! - Loads and refreshes snapshots, carrying usage across refreshes
//! - Answers point lookups with an `enforce` switch
//! - Applies best-effort add/modify/remove batches
//! - Decays usage and checkpoints itself to disk
//!
//! # Architecture
//!
//! ```text
//! AssocCache
//!   ├── RwLock<AssocTree>   (arena keyed by id, derived children index)
//!   ├── RwLock<QosList>
//!   ├── RwLock<UserList>
//!   ├── Mutex<()>           (checkpoint file I/O)
//!   ├── AccountingStorage   (snapshot source)
//!   └── IdentityResolver    (user name -> uid)
//! ```

pub mod cache;
pub mod checkpoint;
pub mod delta;
pub mod error;
pub mod identity;
pub mod lists;
pub mod lookup;
pub mod qos_delta;
pub mod tree;

pub use cache::{AssocCache, CacheSettings, RemoveNotify, decay_factor};
pub use delta::{
    AssocDelta, AssocModify, DeltaFailure, LimitsUpdate, QosDelta, QosLimitsUpdate, QosModify,
    Setting, UpdateOptions, UpdateReport, UserDelta, UserModify,
};
pub use error::{AssocError, AssocResult};
pub use identity::{IdentityResolver, StaticIdentity, SystemIdentity};
pub use lookup::{PartialAssociation, PartialQos, PartialUser};
pub use qos_delta::{QosOp, apply_qos_delta, parse_qos_delta};
pub use tree::AssocTree;
