//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::ServiceWorkerError;

/// Cache holding the app shell.
pub const CACHE_NAME: &str = "my-cache";

/// App shell URLs, relative to the worker scope.
pub const PRECACHE_URLS: [&str; 3] = ["./", "./icon.png", "./manifest.json"];

/// Database holding the shared image.
pub const DB_NAME: &str = "ImageDB";

/// Schema version of [`DB_NAME`].
pub const DB_VERSION: u64 = 1;

/// Object store holding the shared image.
pub const STORE_NAME: &str = "images";

/// Primary key path of [`STORE_NAME`].
pub const KEY_PATH: &str = "id";

/// Form field carrying the uploaded image.
pub const IMAGE_FIELD: &str = "image";

/// Id of the single image record.
pub const RECORD_ID: &str = "sharedImage";

/// Where uploads are redirected.
pub const REDIRECT_LOCATION: &str = "./";

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Scope URL; precache URLs resolve against it
    pub scope: String,

    /// Cache name
    pub cache_name: String,

    /// URLs cached on install
    pub precache: Vec<String>,

    /// Image database settings
    pub database: DatabaseConfig,

    /// Upload form field holding the image
    pub image_field: String,

    /// Record id the image is stored under
    pub record_id: String,

    /// `Location` of the upload redirect
    pub redirect_location: String,

    /// Directory for cache and database snapshots (in-memory if unset)
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database name
    pub name: String,

    /// Schema version
    pub version: u64,

    /// Object store name
    pub store: String,

    /// Primary key path
    pub key_path: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scope: "http://localhost:8080/".to_string(),
            cache_name: CACHE_NAME.to_string(),
            precache: PRECACHE_URLS.iter().map(|s| s.to_string()).collect(),
            database: DatabaseConfig::default(),
            image_field: IMAGE_FIELD.to_string(),
            record_id: RECORD_ID.to_string(),
            redirect_location: REDIRECT_LOCATION.to_string(),
            data_dir: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: DB_NAME.to_string(),
            version: DB_VERSION,
            store: STORE_NAME.to_string(),
            key_path: KEY_PATH.to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub async fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| ServiceWorkerError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_slice(&raw)
            .map_err(|e| ServiceWorkerError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Override the scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Override the snapshot directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        self.scope_url()?;
        if self.database.version == 0 {
            return Err(ServiceWorkerError::Config(
                "database.version must be at least 1".to_string(),
            ));
        }
        if self.cache_name.is_empty() || self.database.store.is_empty() {
            return Err(ServiceWorkerError::Config(
                "cache_name and database.store must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed scope URL.
    pub fn scope_url(&self) -> Result<Url, ServiceWorkerError> {
        Url::parse(&self.scope)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid scope {:?}: {}", self.scope, e)))
    }

    /// Precache URLs resolved against the scope.
    pub fn precache_urls(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        let scope = self.scope_url()?;
        self.precache
            .iter()
            .map(|path| {
                scope.join(path).map_err(|e| {
                    ServiceWorkerError::Config(format!("invalid precache URL {:?}: {}", path, e))
                })
            })
            .collect()
    }
}
