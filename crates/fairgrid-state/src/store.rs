//! StateStore — redb-backed accounting rows.
//!
//! The write side (`put_*`) seeds and administers rows; the cache only reads
//! through [`AccountingStorage`]. Each table is scanned whole and filtered in
//! memory, since every condition the cache sends selects by cluster, account,
//! user or name rather than by key.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, Key, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::storage::AccountingStorage;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RowTable = TableDefinition<'static, u32, &'static [u8]>;

/// Thread-safe accounting store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "accounting store opened");
        Ok(store)
    }

    /// Ephemeral store for tests and tooling.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ASSOCIATIONS).map_err(map_err!(Table))?;
        txn.open_table(USERS).map_err(map_err!(Table))?;
        txn.open_table(QOS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_by_id<T: Serialize>(&self, def: RowTable, id: u32, row: &T) -> StateResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Every row of `def`, in key order.
    fn scan<K, T>(&self, def: TableDefinition<'static, K, &'static [u8]>) -> StateResult<Vec<T>>
    where
        K: Key + 'static,
        T: DeserializeOwned,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut rows = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            rows.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(rows)
    }

    /// Insert or replace an association row.
    pub fn put_association(&self, assoc: &Association) -> StateResult<()> {
        self.put_by_id(ASSOCIATIONS, assoc.id, assoc)?;
        debug!(assoc_id = assoc.id, "association stored");
        Ok(())
    }

    pub fn put_user(&self, user: &User) -> StateResult<()> {
        let value = serde_json::to_vec(user).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(USERS).map_err(map_err!(Table))?;
            table
                .insert(user.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn put_qos(&self, qos: &Qos) -> StateResult<()> {
        self.put_by_id(QOS, qos.id, qos)
    }

    /// All associations in id order.
    pub fn list_associations(&self) -> StateResult<Vec<Association>> {
        self.scan(ASSOCIATIONS)
    }

    pub fn list_users(&self) -> StateResult<Vec<User>> {
        self.scan(USERS)
    }

    pub fn list_qos(&self) -> StateResult<Vec<Qos>> {
        self.scan(QOS)
    }
}

impl AccountingStorage for StateStore {
    fn get_associations(&self, cond: &AssocCondition) -> StateResult<Vec<Association>> {
        let mut assocs = self.list_associations()?;
        assocs.retain(|a| cond.matches(a));
        Ok(assocs)
    }

    fn get_users(&self, cond: &UserCondition) -> StateResult<Vec<User>> {
        let mut users = self.list_users()?;
        users.retain(|u| cond.matches(u));
        Ok(users)
    }

    fn get_qos(&self, cond: &QosCondition) -> StateResult<Vec<Qos>> {
        let mut qos = self.list_qos()?;
        qos.retain(|q| cond.matches(q));
        Ok(qos)
    }
}
