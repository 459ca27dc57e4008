//! Object stores.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{key_to_storage, IDBError, KeyPath, Record};

/// An object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IDBObjectStore {
    /// Store name.
    pub name: String,

    /// Key path.
    pub key_path: KeyPath,

    /// Auto-increment.
    pub auto_increment: bool,

    /// Records by storage key.
    records: HashMap<String, Record>,

    /// Next auto-increment key.
    next_key: u64,
}

impl IDBObjectStore {
    /// Create a new object store.
    pub fn new(name: &str, key_path: KeyPath, auto_increment: bool) -> Self {
        Self {
            name: name.to_string(),
            key_path,
            auto_increment,
            records: HashMap::new(),
            next_key: 1,
        }
    }

    /// Get a record.
    pub fn get(&self, key: &JsonValue) -> Result<Option<&Record>, IDBError> {
        Ok(self.records.get(&key_to_storage(key)?))
    }

    /// Get all records.
    pub fn get_all(&self, count: Option<usize>) -> Vec<&Record> {
        let mut records: Vec<_> = self.records.values().collect();
        if let Some(n) = count {
            records.truncate(n);
        }
        records
    }

    /// Add a record (fails if key exists).
    pub fn add(&mut self, value: JsonValue, key: Option<JsonValue>) -> Result<JsonValue, IDBError> {
        let key = self.resolve_key(&value, key)?;
        let key_str = key_to_storage(&key)?;

        if self.records.contains_key(&key_str) {
            return Err(IDBError::ConstraintError(format!(
                "Key already exists: {}",
                key
            )));
        }

        self.records.insert(key_str, Record { key: key.clone(), value });
        Ok(key)
    }

    /// Put a record (overwrites if exists).
    pub fn put(&mut self, value: JsonValue, key: Option<JsonValue>) -> Result<JsonValue, IDBError> {
        let key = self.resolve_key(&value, key)?;
        let key_str = key_to_storage(&key)?;

        self.records.insert(key_str, Record { key: key.clone(), value });
        Ok(key)
    }

    /// Delete a record.
    pub fn delete(&mut self, key: &JsonValue) -> Result<bool, IDBError> {
        Ok(self.records.remove(&key_to_storage(key)?).is_some())
    }

    /// Clear all records.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Count records.
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Resolve key from value or explicit key.
    fn resolve_key(&mut self, value: &JsonValue, key: Option<JsonValue>) -> Result<JsonValue, IDBError> {
        match (&self.key_path, key, self.auto_increment) {
            // In-line keys come from the value; an explicit key is an error
            (KeyPath::Single(_) | KeyPath::Multiple(_), Some(_), _) => Err(IDBError::DataError(
                "Explicit key given for a store with a key path".to_string(),
            )),

            (KeyPath::Single(_) | KeyPath::Multiple(_), None, _) => {
                self.key_path.extract(value).ok_or_else(|| {
                    IDBError::DataError("Could not extract key from value".to_string())
                })
            }

            (KeyPath::None, Some(k), _) => Ok(k),

            (KeyPath::None, None, true) => {
                let key = self.next_key;
                self.next_key += 1;
                Ok(JsonValue::Number(key.into()))
            }

            (KeyPath::None, None, false) => {
                Err(IDBError::DataError("No key provided and no auto-increment".to_string()))
            }
        }
    }
}
