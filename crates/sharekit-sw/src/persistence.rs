//! Image database helpers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sharekit_idb::{IDBDatabaseHandle, IDBFactory, KeyPath, Migration, TransactionMode};
use sharekit_net::Blob;
use tracing::{debug, info};

use crate::config::{DatabaseConfig, WorkerConfig};
use crate::data_url::encode_data_url;
use crate::ServiceWorkerError;

/// The stored image: its id and its content as a `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub data: String,
}

/// Schema steps for the image database.
///
/// A single step at the configured version creates the image store if it
/// is not there yet, so reopening at the same version changes nothing.
pub fn image_db_migrations(config: &DatabaseConfig) -> Vec<Migration> {
    let store = config.store.clone();
    let key_path = config.key_path.clone();

    vec![Migration::new(config.version, move |change| {
        if !change.has_object_store(&store) {
            change.create_object_store(&store, KeyPath::Single(key_path.clone()), false)?;
            info!(store = %store, key_path = %key_path, "Created image store");
        }
        Ok(())
    })]
}

/// Open (creating or upgrading if needed) the image database.
pub async fn open_image_db(
    factory: &IDBFactory,
    config: &DatabaseConfig,
) -> Result<IDBDatabaseHandle, ServiceWorkerError> {
    let db = factory
        .open_with_migrations(&config.name, &image_db_migrations(config))
        .await?;
    let version = db.version().await;
    debug!(db = %config.name, version, "Image database open");
    Ok(db)
}

/// Store `blob` as the single image record, replacing any previous one.
///
/// Returns once the write has been committed.
pub async fn store_image(
    db: &IDBDatabaseHandle,
    config: &WorkerConfig,
    blob: &Blob,
) -> Result<(), ServiceWorkerError> {
    let data = encode_data_url(blob).await?;

    let mut value = Map::new();
    value.insert(
        config.database.key_path.clone(),
        JsonValue::String(config.record_id.clone()),
    );
    value.insert("data".to_string(), JsonValue::String(data));

    let store = config.database.store.as_str();
    let mut tx = db.transaction(&[store], TransactionMode::ReadWrite).await?;
    tx.put(store, JsonValue::Object(value), None)?;
    tx.commit().await?;

    info!(
        store,
        id = %config.record_id,
        mime = %blob.mime_type,
        bytes = blob.size(),
        "Stored shared image"
    );
    Ok(())
}

/// Read the image record back, if one has been stored.
pub async fn load_image(
    db: &IDBDatabaseHandle,
    config: &WorkerConfig,
) -> Result<Option<ImageRecord>, ServiceWorkerError> {
    let store = config.database.store.as_str();
    let tx = db.transaction(&[store], TransactionMode::ReadOnly).await?;

    let record = tx.get(store, &JsonValue::String(config.record_id.clone()))?;
    Ok(record.map(|record| ImageRecord {
        id: config.record_id.clone(),
        data: record
            .value
            .get("data")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
    }))
}
