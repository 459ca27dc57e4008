//! Transactions over a staged copy of the scoped object stores.

use std::sync::Arc;

use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::factory::{write_snapshot, SharedDatabase};
use crate::{IDBError, IDBObjectStore, Record};

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Finished,
}

/// A database transaction.
///
/// Reads see the stores as they were when the transaction started, plus its
/// own writes. Nothing is visible to other transactions until
/// [`commit`](Self::commit) succeeds.
pub struct IDBTransaction {
    shared: Arc<SharedDatabase>,

    /// Transaction mode.
    mode: TransactionMode,

    /// Object store names in scope.
    scope: Vec<String>,

    /// Staged stores.
    stores: HashMap<String, IDBObjectStore>,

    state: TransactionState,

    dirty: bool,

    /// Held by readwrite transactions until they finish.
    writer: Option<OwnedMutexGuard<()>>,
}

impl IDBTransaction {
    pub(crate) fn new(
        shared: Arc<SharedDatabase>,
        mode: TransactionMode,
        scope: Vec<String>,
        stores: HashMap<String, IDBObjectStore>,
        writer: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        Self {
            shared,
            mode,
            scope,
            stores,
            state: TransactionState::Active,
            dirty: false,
            writer,
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Check if store is in scope.
    pub fn has_store(&self, name: &str) -> bool {
        self.scope.iter().any(|s| s == name)
    }

    /// Get a record by key.
    pub fn get(&self, store: &str, key: &JsonValue) -> Result<Option<Record>, IDBError> {
        Ok(self.store(store)?.get(key)?.cloned())
    }

    /// Get up to `count` records.
    pub fn get_all(&self, store: &str, count: Option<usize>) -> Result<Vec<Record>, IDBError> {
        Ok(self
            .store(store)?
            .get_all(count)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Count records.
    pub fn count(&self, store: &str) -> Result<usize, IDBError> {
        Ok(self.store(store)?.count())
    }

    /// Insert or replace a record, returning its key.
    pub fn put(
        &mut self,
        store: &str,
        value: JsonValue,
        key: Option<JsonValue>,
    ) -> Result<JsonValue, IDBError> {
        let key = self.store_mut(store)?.put(value, key)?;
        self.dirty = true;
        Ok(key)
    }

    /// Insert a record; fails if the key already exists.
    pub fn add(
        &mut self,
        store: &str,
        value: JsonValue,
        key: Option<JsonValue>,
    ) -> Result<JsonValue, IDBError> {
        let key = self.store_mut(store)?.add(value, key)?;
        self.dirty = true;
        Ok(key)
    }

    /// Delete a record.
    pub fn delete(&mut self, store: &str, key: &JsonValue) -> Result<bool, IDBError> {
        let removed = self.store_mut(store)?.delete(key)?;
        self.dirty |= removed;
        Ok(removed)
    }

    /// Remove every record from a store.
    pub fn clear(&mut self, store: &str) -> Result<(), IDBError> {
        self.store_mut(store)?.clear();
        self.dirty = true;
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// Staged stores replace the committed ones in one step, after the
    /// snapshot (if any) has been written. On failure the database is left
    /// as it was and the transaction is finished.
    pub async fn commit(&mut self) -> Result<(), IDBError> {
        if !self.is_active() {
            return Err(IDBError::TransactionInactiveError);
        }
        self.state = TransactionState::Committing;

        let result = self.flush().await;

        self.state = TransactionState::Finished;
        self.writer = None;
        result
    }

    async fn flush(&mut self) -> Result<(), IDBError> {
        if self.mode == TransactionMode::ReadOnly || !self.dirty {
            return Ok(());
        }
        if self.shared.is_closed() {
            return Err(IDBError::AbortError(
                "Database was deleted before commit".to_string(),
            ));
        }

        let stores = std::mem::take(&mut self.stores);
        let mut db = self.shared.db.write().await;

        if let Some(ref path) = self.shared.snapshot {
            let mut candidate = db.clone();
            candidate.replace_stores(stores.clone());
            write_snapshot(path, &candidate).await?;
        }

        db.replace_stores(stores);
        debug!(db = %db.name, scope = ?self.scope, "Transaction committed");
        Ok(())
    }

    /// Abort the transaction, discarding staged writes.
    pub fn abort(&mut self) -> Result<(), IDBError> {
        if !self.is_active() {
            return Err(IDBError::InvalidStateError(
                "Transaction already finished".to_string(),
            ));
        }
        self.finish_aborted();
        Ok(())
    }

    fn finish_aborted(&mut self) {
        self.stores.clear();
        self.state = TransactionState::Finished;
        self.writer = None;
        debug!(scope = ?self.scope, "Transaction aborted");
    }

    fn store(&self, name: &str) -> Result<&IDBObjectStore, IDBError> {
        if !self.is_active() {
            return Err(IDBError::TransactionInactiveError);
        }
        self.stores.get(name).ok_or_else(|| {
            IDBError::NotFoundError(format!("Object store not in transaction scope: {}", name))
        })
    }

    fn store_mut(&mut self, name: &str) -> Result<&mut IDBObjectStore, IDBError> {
        if !self.is_active() {
            return Err(IDBError::TransactionInactiveError);
        }
        if self.mode == TransactionMode::ReadOnly {
            return Err(IDBError::ReadOnlyError);
        }
        self.stores.get_mut(name).ok_or_else(|| {
            IDBError::NotFoundError(format!("Object store not in transaction scope: {}", name))
        })
    }
}

impl Drop for IDBTransaction {
    fn drop(&mut self) {
        if self.is_active() && self.dirty {
            self.finish_aborted();
        }
    }
}

impl std::fmt::Debug for IDBTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IDBTransaction")
            .field("mode", &self.mode)
            .field("scope", &self.scope)
            .field("state", &self.state)
            .finish()
    }
}
