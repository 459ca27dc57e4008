//! # ShareKit IDB
//!
//! IndexedDB-style object database for the ShareKit worker.
//!
//! ## Features
//!
//! - **IDBFactory**: `open()` with versioned upgrades, `deleteDatabase()`
//! - **IDBDatabase**: object store management inside version changes
//! - **IDBObjectStore**: records keyed by key path or explicit key
//! - **IDBTransaction**: readonly and readwrite, committed atomically
//!
//! ## Architecture
//!
//! ```text
//! IDBFactory (indexedDB)
//!     │
//!     └── IDBDatabaseHandle ──► IDBDatabase
//!             │                     └── IDBObjectStore
//!             │                             └── Records
//!             └── IDBTransaction (staged copy of scoped stores)
//! ```
//!
//! A transaction works on a private copy of the stores in its scope and
//! swaps them in on [`IDBTransaction::commit`]. Readwrite transactions on the
//! same database run one at a time, in the order they were started; dropping
//! a transaction without committing aborts it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod database;
mod factory;
mod store;
mod transaction;

pub use database::{IDBDatabase, Migration, UpgradeFn, VersionChange};
pub use factory::{DatabaseInfo, IDBDatabaseHandle, IDBEvent, IDBFactory};
pub use store::IDBObjectStore;
pub use transaction::{IDBTransaction, TransactionMode, TransactionState};

// ==================== Errors ====================

/// IndexedDB errors.
#[derive(Error, Debug)]
pub enum IDBError {
    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Constraint error: {0}")]
    ConstraintError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Invalid state: {0}")]
    InvalidStateError(String),

    #[error("Transaction inactive")]
    TransactionInactiveError,

    #[error("Read only")]
    ReadOnlyError,

    #[error("Version error: {0}")]
    VersionError(String),

    #[error("Abort error: {0}")]
    AbortError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Json(#[from] serde_json::Error),
}

// ==================== Keys ====================

/// Key path for object stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// No key path (out-of-line keys).
    None,
    /// Single property.
    Single(String),
    /// Multiple properties (compound key).
    Multiple(Vec<String>),
}

impl KeyPath {
    /// Extract key from value.
    pub fn extract(&self, value: &JsonValue) -> Option<JsonValue> {
        match self {
            KeyPath::None => None,
            KeyPath::Single(path) => value.get(path).cloned(),
            KeyPath::Multiple(paths) => {
                let keys: Vec<JsonValue> = paths
                    .iter()
                    .filter_map(|p| value.get(p).cloned())
                    .collect();
                if keys.len() == paths.len() {
                    Some(JsonValue::Array(keys))
                } else {
                    None
                }
            }
        }
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: JsonValue,
    pub value: JsonValue,
}

/// Convert a key to its storage string.
///
/// Numbers and strings are tagged so `1` and `"1"` stay distinct. Booleans,
/// nulls and objects are not valid keys.
pub(crate) fn key_to_storage(key: &JsonValue) -> Result<String, IDBError> {
    match key {
        JsonValue::String(s) => Ok(format!("s:{}", s)),
        JsonValue::Number(n) => Ok(format!("n:{}", n)),
        JsonValue::Array(arr) => {
            let parts = arr
                .iter()
                .map(key_to_storage)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("a:[{}]", parts.join(",")))
        }
        other => Err(IDBError::DataError(format!("Not a valid key: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_path_single() {
        let path = KeyPath::Single("id".to_string());
        let value = json!({"id": 42, "name": "test"});

        let key = path.extract(&value).unwrap();
        assert_eq!(key, json!(42));
    }

    #[test]
    fn test_key_path_multiple() {
        let path = KeyPath::Multiple(vec!["a".to_string(), "b".to_string()]);
        let value = json!({"a": 1, "b": 2});

        let key = path.extract(&value).unwrap();
        assert_eq!(key, json!([1, 2]));
    }

    #[test]
    fn test_key_path_missing_property() {
        let path = KeyPath::Single("id".to_string());
        assert!(path.extract(&json!({"data": "x"})).is_none());
    }

    #[test]
    fn test_storage_keys_keep_types_apart() {
        assert_ne!(
            key_to_storage(&json!(1)).unwrap(),
            key_to_storage(&json!("1")).unwrap()
        );
        assert_eq!(key_to_storage(&json!(["a", 2])).unwrap(), "a:[s:a,n:2]");
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            key_to_storage(&json!(true)),
            Err(IDBError::DataError(_))
        ));
        assert!(matches!(
            key_to_storage(&json!({"id": 1})),
            Err(IDBError::DataError(_))
        ));
    }
}
