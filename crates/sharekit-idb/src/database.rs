//! Databases, version changes and migrations.

use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{IDBError, IDBObjectStore, KeyPath};

/// A database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IDBDatabase {
    /// Database name.
    pub name: String,

    /// Version. Zero until the first upgrade completes.
    pub version: u64,

    /// Object stores.
    stores: HashMap<String, IDBObjectStore>,
}

impl IDBDatabase {
    /// Create a new database.
    pub fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            stores: HashMap::new(),
        }
    }

    /// Get object store names, sorted.
    pub fn object_store_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.stores.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Check whether an object store exists.
    pub fn has_object_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Get object store.
    pub fn object_store(&self, name: &str) -> Option<&IDBObjectStore> {
        self.stores.get(name)
    }

    /// Create object store. Only reachable through a [`VersionChange`].
    fn create_object_store(
        &mut self,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<(), IDBError> {
        if self.stores.contains_key(name) {
            return Err(IDBError::ConstraintError(format!(
                "Object store already exists: {}",
                name
            )));
        }

        self.stores.insert(
            name.to_string(),
            IDBObjectStore::new(name, key_path, auto_increment),
        );
        Ok(())
    }

    /// Delete object store. Only reachable through a [`VersionChange`].
    fn delete_object_store(&mut self, name: &str) -> Result<(), IDBError> {
        self.stores.remove(name).ok_or_else(|| {
            IDBError::NotFoundError(format!("Object store not found: {}", name))
        })?;
        Ok(())
    }

    /// Clone the named stores for a transaction.
    pub(crate) fn clone_stores(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, IDBObjectStore>, IDBError> {
        names
            .iter()
            .map(|name| {
                self.stores
                    .get(name)
                    .cloned()
                    .map(|store| (name.clone(), store))
                    .ok_or_else(|| {
                        IDBError::NotFoundError(format!("Object store not found: {}", name))
                    })
            })
            .collect()
    }

    /// Replace stores with committed copies.
    pub(crate) fn replace_stores(&mut self, stores: HashMap<String, IDBObjectStore>) {
        self.stores.extend(stores);
    }
}

/// Schema access during an upgrade (`onupgradeneeded`).
///
/// Changes apply to a working copy; the factory keeps them only if the
/// whole upgrade succeeds.
pub struct VersionChange<'a> {
    db: &'a mut IDBDatabase,
    old_version: u64,
    new_version: u64,
}

impl<'a> VersionChange<'a> {
    pub(crate) fn new(db: &'a mut IDBDatabase, old_version: u64, new_version: u64) -> Self {
        Self {
            db,
            old_version,
            new_version,
        }
    }

    pub fn old_version(&self) -> u64 {
        self.old_version
    }

    pub fn new_version(&self) -> u64 {
        self.new_version
    }

    pub fn database(&self) -> &IDBDatabase {
        self.db
    }

    pub fn object_store_names(&self) -> Vec<&str> {
        self.db.object_store_names()
    }

    pub fn has_object_store(&self, name: &str) -> bool {
        self.db.has_object_store(name)
    }

    /// Create an object store; fails if it already exists.
    pub fn create_object_store(
        &mut self,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<(), IDBError> {
        self.db.create_object_store(name, key_path, auto_increment)
    }

    /// Delete an object store; fails if it does not exist.
    pub fn delete_object_store(&mut self, name: &str) -> Result<(), IDBError> {
        self.db.delete_object_store(name)
    }
}

/// Upgrade callback run inside a version change.
pub type UpgradeFn = dyn Fn(&mut VersionChange<'_>) -> Result<(), IDBError> + Send + Sync;

/// A schema step that brings a database up to `version`.
///
/// Steps run in ascending version order, only for versions above the one
/// already stored.
#[derive(Clone)]
pub struct Migration {
    pub version: u64,
    apply: Arc<UpgradeFn>,
}

impl Migration {
    pub fn new<F>(version: u64, apply: F) -> Self
    where
        F: Fn(&mut VersionChange<'_>) -> Result<(), IDBError> + Send + Sync + 'static,
    {
        Self {
            version,
            apply: Arc::new(apply),
        }
    }

    pub fn apply(&self, change: &mut VersionChange<'_>) -> Result<(), IDBError> {
        (self.apply)(change)
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .finish()
    }
}

/// Run the migrations newer than `change.old_version()`.
pub(crate) fn run_migrations(
    change: &mut VersionChange<'_>,
    migrations: &[Migration],
) -> Result<(), IDBError> {
    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| m.version > change.old_version() && m.version <= change.new_version())
        .collect();
    pending.sort_by_key(|m| m.version);

    for migration in pending {
        tracing::debug!(
            db = %change.database().name,
            version = migration.version,
            "Applying migration"
        );
        migration.apply(change)?;
    }
    Ok(())
}
