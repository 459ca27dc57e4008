//! The `indexedDB` factory and database handles.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::database::run_migrations;
use crate::{IDBDatabase, IDBError, IDBTransaction, Migration, TransactionMode, VersionChange};

/// IDBFactory events.
#[derive(Debug, Clone)]
pub enum IDBEvent {
    /// Upgrade needed.
    UpgradeNeeded {
        db_name: String,
        old_version: u64,
        new_version: u64,
    },
    /// Database opened.
    Success { db_name: String },
    /// Open or upgrade failed.
    Error { db_name: String, error: String },
    /// Database deleted.
    Deleted { db_name: String },
}

/// Database info for `databases()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

/// One open database shared by every handle to it.
pub(crate) struct SharedDatabase {
    pub(crate) db: RwLock<IDBDatabase>,
    /// Serializes readwrite transactions and upgrades.
    pub(crate) writer: Arc<Mutex<()>>,
    pub(crate) snapshot: Option<PathBuf>,
    pub(crate) closed: AtomicBool,
}

impl SharedDatabase {
    fn new(db: IDBDatabase, snapshot: Option<PathBuf>) -> Self {
        Self {
            db: RwLock::new(db),
            writer: Arc::new(Mutex::new(())),
            snapshot,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Write a database snapshot (temp file, then rename).
pub(crate) async fn write_snapshot(path: &Path, db: &IDBDatabase) -> Result<(), IDBError> {
    let json = serde_json::to_vec_pretty(db)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = json.len(), "Database snapshot written");
    Ok(())
}

/// Run `upgrade` on a copy of an open database and swap it in once the
/// snapshot is written. The caller holds the database's writer lock.
async fn upgrade_in_place<F>(
    name: &str,
    shared: &SharedDatabase,
    old_version: u64,
    new_version: u64,
    upgrade: F,
) -> Result<(), IDBError>
where
    F: FnOnce(&mut VersionChange<'_>) -> Result<(), IDBError>,
{
    let mut working = shared.db.read().await.clone();
    upgrade(&mut VersionChange::new(&mut working, old_version, new_version))?;
    working.version = new_version;

    if let Some(ref path) = shared.snapshot {
        write_snapshot(path, &working).await?;
    }
    *shared.db.write().await = working;
    info!(db = name, old_version, new_version, "Database upgraded");
    Ok(())
}

/// File name for a database snapshot. ASCII letters, digits and `-` are
/// kept; every other byte becomes `_` plus two hex digits, so distinct
/// names never share a file.
fn snapshot_file_name(name: &str) -> String {
    let mut file = String::with_capacity(name.len() + 5);
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            file.push(char::from(byte));
        } else {
            file.push_str(&format!("_{:02X}", byte));
        }
    }
    file.push_str(".json");
    file
}

/// IDBFactory (the `indexedDB` global).
#[derive(Clone)]
pub struct IDBFactory {
    /// Open databases by name.
    databases: Arc<RwLock<HashMap<String, Arc<SharedDatabase>>>>,

    /// Snapshot directory, if persistent.
    storage_dir: Option<PathBuf>,

    /// False when storage is denied to this context.
    enabled: bool,

    /// Event sender.
    event_tx: mpsc::UnboundedSender<IDBEvent>,
}

impl IDBFactory {
    /// Create an in-memory factory.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IDBEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                databases: Arc::new(RwLock::new(HashMap::new())),
                storage_dir: None,
                enabled: true,
                event_tx,
            },
            event_rx,
        )
    }

    /// A factory whose `open` always fails, as in contexts without storage.
    pub fn disabled() -> Self {
        let (mut factory, _rx) = Self::new();
        factory.enabled = false;
        factory
    }

    /// Create a factory persisted under `dir`, loading every snapshot found.
    pub async fn with_storage(
        dir: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<IDBEvent>), IDBError> {
        tokio::fs::create_dir_all(dir).await?;

        let mut loaded = HashMap::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let raw = tokio::fs::read(&path).await?;
            let db: IDBDatabase = serde_json::from_slice(&raw)?;
            debug!(db = %db.name, version = db.version, "Database loaded");
            loaded.insert(
                db.name.clone(),
                Arc::new(SharedDatabase::new(db, Some(path))),
            );
        }

        info!(path = %dir.display(), databases = loaded.len(), "Database storage loaded");

        let (mut factory, rx) = Self::new();
        factory.databases = Arc::new(RwLock::new(loaded));
        factory.storage_dir = Some(dir.to_path_buf());
        Ok((factory, rx))
    }

    /// Open a database, running `upgrade` if `version` is above the stored one.
    ///
    /// Without a version, an existing database opens at its current version
    /// and a new one at version 1. The upgrade works on a copy of the
    /// database; if it fails, nothing is kept.
    pub async fn open<F>(
        &self,
        name: &str,
        version: Option<u64>,
        upgrade: F,
    ) -> Result<IDBDatabaseHandle, IDBError>
    where
        F: FnOnce(&mut VersionChange<'_>) -> Result<(), IDBError>,
    {
        if !self.enabled {
            return Err(IDBError::SecurityError(
                "Storage is not available in this context".to_string(),
            ));
        }
        if version == Some(0) {
            return Err(IDBError::DataError("Version must be at least 1".to_string()));
        }

        loop {
            let existing = self.databases.read().await.get(name).cloned();

            let Some(shared) = existing else {
                let mut databases = self.databases.write().await;
                if databases.contains_key(name) {
                    continue;
                }
                let new_version = version.unwrap_or(1);
                self.emit(IDBEvent::UpgradeNeeded {
                    db_name: name.to_string(),
                    old_version: 0,
                    new_version,
                });
                let created = self.create(name, new_version, upgrade).await;
                if let Ok(ref shared) = created {
                    databases.insert(name.to_string(), shared.clone());
                }
                drop(databases);
                return self.finish_open(name, created);
            };

            if self.pending_upgrade(name, &shared, version).await?.is_none() {
                return self.finish_open(name, Ok(shared));
            }

            // Wait for in-flight readwrite transactions with the map unlocked.
            let writer = shared.writer.clone().lock_owned().await;
            if shared.is_closed() {
                continue;
            }
            let Some((old_version, new_version)) =
                self.pending_upgrade(name, &shared, version).await?
            else {
                return self.finish_open(name, Ok(shared));
            };

            self.emit(IDBEvent::UpgradeNeeded {
                db_name: name.to_string(),
                old_version,
                new_version,
            });
            let upgraded = upgrade_in_place(name, &shared, old_version, new_version, upgrade).await;
            drop(writer);
            return self.finish_open(name, upgraded.map(|()| shared));
        }
    }

    /// Open a database at the highest migration version, applying the
    /// migrations above the stored version in ascending order.
    pub async fn open_with_migrations(
        &self,
        name: &str,
        migrations: &[Migration],
    ) -> Result<IDBDatabaseHandle, IDBError> {
        let target = migrations.iter().map(|m| m.version).max();
        self.open(name, target, |change| run_migrations(change, migrations))
            .await
    }

    /// `(old, new)` versions when opening at `version` needs an upgrade.
    async fn pending_upgrade(
        &self,
        name: &str,
        shared: &SharedDatabase,
        version: Option<u64>,
    ) -> Result<Option<(u64, u64)>, IDBError> {
        let current_version = shared.db.read().await.version;
        let requested_version = version.unwrap_or(current_version);

        if requested_version < current_version {
            let error = IDBError::VersionError(format!(
                "Requested version {} is less than current version {}",
                requested_version, current_version
            ));
            self.emit(IDBEvent::Error {
                db_name: name.to_string(),
                error: error.to_string(),
            });
            return Err(error);
        }

        Ok((requested_version > current_version).then_some((current_version, requested_version)))
    }

    async fn create<F>(
        &self,
        name: &str,
        version: u64,
        upgrade: F,
    ) -> Result<Arc<SharedDatabase>, IDBError>
    where
        F: FnOnce(&mut VersionChange<'_>) -> Result<(), IDBError>,
    {
        let mut working = IDBDatabase::new(name, 0);
        upgrade(&mut VersionChange::new(&mut working, 0, version))?;
        working.version = version;

        let snapshot = match self.storage_dir {
            Some(ref dir) => {
                let path = dir.join(snapshot_file_name(name));
                write_snapshot(&path, &working).await?;
                Some(path)
            }
            None => None,
        };
        info!(db = name, version, "Database created");
        Ok(Arc::new(SharedDatabase::new(working, snapshot)))
    }

    fn finish_open(
        &self,
        name: &str,
        result: Result<Arc<SharedDatabase>, IDBError>,
    ) -> Result<IDBDatabaseHandle, IDBError> {
        match result {
            Ok(shared) => {
                self.emit(IDBEvent::Success {
                    db_name: name.to_string(),
                });
                debug!(db = name, "Database opened");
                Ok(IDBDatabaseHandle { shared })
            }
            Err(error) => {
                warn!(db = name, %error, "Upgrade failed");
                self.emit(IDBEvent::Error {
                    db_name: name.to_string(),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Delete a database. Open handles stop accepting transactions.
    pub async fn delete_database(&self, name: &str) -> Result<(), IDBError> {
        let removed = self.databases.write().await.remove(name);

        if let Some(shared) = removed {
            let _writer = shared.writer.clone().lock_owned().await;
            shared.closed.store(true, Ordering::SeqCst);
            if let Some(ref path) = shared.snapshot {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            info!(db = name, "Database deleted");
            self.emit(IDBEvent::Deleted {
                db_name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Names and versions of all databases, sorted by name.
    pub async fn databases(&self) -> Vec<DatabaseInfo> {
        let databases = self.databases.read().await;
        let mut infos = Vec::with_capacity(databases.len());
        for (name, shared) in databases.iter() {
            infos.push(DatabaseInfo {
                name: name.clone(),
                version: shared.db.read().await.version,
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn emit(&self, event: IDBEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for IDBFactory {
    fn default() -> Self {
        Self::new().0
    }
}

/// An open connection to a database.
#[derive(Clone)]
pub struct IDBDatabaseHandle {
    shared: Arc<SharedDatabase>,
}

impl IDBDatabaseHandle {
    pub async fn name(&self) -> String {
        self.shared.db.read().await.name.clone()
    }

    pub async fn version(&self) -> u64 {
        self.shared.db.read().await.version
    }

    pub async fn object_store_names(&self) -> Vec<String> {
        self.shared
            .db
            .read()
            .await
            .object_store_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Copy of the database as last committed.
    pub async fn snapshot(&self) -> IDBDatabase {
        self.shared.db.read().await.clone()
    }

    /// Start a transaction over `stores`.
    ///
    /// A readwrite transaction waits until earlier readwrite transactions
    /// on this database have finished.
    pub async fn transaction(
        &self,
        stores: &[&str],
        mode: TransactionMode,
    ) -> Result<IDBTransaction, IDBError> {
        if mode == TransactionMode::VersionChange {
            return Err(IDBError::InvalidStateError(
                "Version change transactions are started by open()".to_string(),
            ));
        }
        if stores.is_empty() {
            return Err(IDBError::InvalidStateError(
                "Transaction scope is empty".to_string(),
            ));
        }

        let writer = match mode {
            TransactionMode::ReadWrite => Some(self.shared.writer.clone().lock_owned().await),
            _ => None,
        };

        if self.shared.is_closed() {
            return Err(IDBError::InvalidStateError(
                "Database has been deleted".to_string(),
            ));
        }

        let scope: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
        let staged = self.shared.db.read().await.clone_stores(&scope)?;

        Ok(IDBTransaction::new(
            self.shared.clone(),
            mode,
            scope,
            staged,
            writer,
        ))
    }
}
