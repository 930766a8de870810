//! redb table definitions for the accounting store.
//!
//! Values are JSON-serialized rows. Associations and QOS are keyed by
//! their numeric id, users by name.

use redb::TableDefinition;

/// Association rows keyed by association id.
pub const ASSOCIATIONS: TableDefinition<u32, &[u8]> = TableDefinition::new("associations");

/// User rows keyed by user name.
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// QOS rows keyed by QOS id.
pub const QOS: TableDefinition<u32, &[u8]> = TableDefinition::new("qos");
