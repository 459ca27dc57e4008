//! # ShareKit Cache
//!
//! Cache API for the ShareKit worker.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (caches)
//!     │
//!     └── Cache (by name, creation order)
//!             └── CacheKey (method + URL) → CacheEntry (status, headers, body)
//! ```
//!
//! [`CacheStorage`] is a cheap, clonable handle. Network fetches for
//! [`CacheHandle::add_all`] run without holding the storage lock; the results
//! are inserted in a single write so a batch is stored entirely or not at all.
//! With a data directory configured, every mutation rewrites a JSON snapshot
//! that [`CacheStorage::with_storage`] loads back. A mutation becomes visible
//! only after its snapshot is on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use sharekit_net::{Fetcher, NetError, Request, Response};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

pub mod entry;

pub use entry::{CacheEntry, CacheKey};

/// Snapshot file name inside the data directory.
pub const SNAPSHOT_FILE: &str = "caches.json";

// ==================== Errors ====================

/// Errors that can occur in cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Bad response status {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Json(#[from] serde_json::Error),
}

// ==================== Cache ====================

/// A cache instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries by storage key.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request by exact key.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries
            .get(&CacheKey::for_request(request).as_storage_key())
    }

    /// Store a response for a key, replacing any previous entry.
    pub fn put(&mut self, key: &CacheKey, response: &Response) {
        self.entries
            .insert(key.as_storage_key(), CacheEntry::capture(key, response));
    }

    /// Delete an entry.
    pub fn delete(&mut self, request: &Request) -> bool {
        self.entries
            .remove(&CacheKey::for_request(request).as_storage_key())
            .is_some()
    }

    /// All storage keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All caches of one origin, in creation order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Caches {
    caches: Vec<Cache>,
}

impl Caches {
    fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.iter().find(|c| c.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Cache, CacheError> {
        self.caches
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))
    }
}

// ==================== Cache Storage ====================

/// Cache storage (the `caches` global).
#[derive(Clone, Default)]
pub struct CacheStorage {
    inner: Arc<RwLock<Caches>>,
    snapshot: Option<Arc<PathBuf>>,
}

impl CacheStorage {
    /// Create in-memory cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create cache storage persisted under `data_dir`, loading any
    /// existing snapshot.
    pub async fn with_storage(data_dir: &Path) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(SNAPSHOT_FILE);

        let caches = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<Caches>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Caches::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            caches = caches.caches.len(),
            "Cache storage loaded"
        );

        Ok(Self {
            inner: Arc::new(RwLock::new(caches)),
            snapshot: Some(Arc::new(path)),
        })
    }

    /// Open a cache, creating it if it doesn't exist.
    pub async fn open(&self, name: &str) -> Result<CacheHandle, CacheError> {
        let created = self
            .update(|caches| {
                if caches.get(name).is_some() {
                    return Ok(false);
                }
                caches.caches.push(Cache::new(name));
                Ok(true)
            })
            .await?;

        if created {
            debug!(cache = name, "Cache created");
        }

        Ok(CacheHandle {
            name: name.to_string(),
            storage: self.clone(),
        })
    }

    /// Check if a cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.inner.read().await.get(name).is_some()
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.update(|caches| {
            let before = caches.caches.len();
            caches.caches.retain(|c| c.name != name);
            Ok(caches.caches.len() != before)
        })
        .await
    }

    /// Cache names in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .caches
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Match across all caches, oldest cache first.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let caches = self.inner.read().await;
        caches
            .caches
            .iter()
            .find_map(|cache| cache.match_request(request))
            .map(CacheEntry::to_response)
    }

    /// Copy of a cache's current contents.
    pub async fn snapshot(&self, name: &str) -> Option<Cache> {
        self.inner.read().await.get(name).cloned()
    }

    /// Apply `change` to a copy of the caches. When it reports a change, the
    /// copy is written to the snapshot and then replaces the live caches.
    /// Any error leaves the live caches untouched.
    async fn update<F>(&self, change: F) -> Result<bool, CacheError>
    where
        F: FnOnce(&mut Caches) -> Result<bool, CacheError>,
    {
        let mut caches = self.inner.write().await;
        let mut candidate = caches.clone();
        if !change(&mut candidate)? {
            return Ok(false);
        }

        if let Some(ref path) = self.snapshot {
            let json = serde_json::to_vec_pretty(&candidate)?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, path.as_path()).await?;
            debug!(path = %path.display(), bytes = json.len(), "Cache snapshot written");
        }

        *caches = candidate;
        Ok(true)
    }
}

// ==================== Cache Handle ====================

/// Handle to one named cache, as returned by [`CacheStorage::open`].
#[derive(Clone)]
pub struct CacheHandle {
    name: String,
    storage: CacheStorage,
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request in this cache.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let caches = self.storage.inner.read().await;
        caches
            .get(&self.name)
            .and_then(|cache| cache.match_request(request))
            .map(CacheEntry::to_response)
    }

    /// Store a response for a request.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        self.storage
            .update(|caches| {
                caches
                    .get_mut(&self.name)?
                    .put(&CacheKey::for_request(request), response);
                Ok(true)
            })
            .await?;
        Ok(())
    }

    /// Fetch one URL and store the response.
    pub async fn add(&self, fetcher: &dyn Fetcher, url: &Url) -> Result<(), CacheError> {
        self.add_all(fetcher, std::slice::from_ref(url)).await
    }

    /// Fetch every URL and store all responses, or none of them.
    ///
    /// Fails on the first transport error or non-2xx status. Nothing is
    /// written unless every fetch succeeds.
    pub async fn add_all(&self, fetcher: &dyn Fetcher, urls: &[Url]) -> Result<(), CacheError> {
        let requests: Vec<Request> = urls.iter().cloned().map(Request::get).collect();

        let mut seen = Vec::with_capacity(requests.len());
        for request in &requests {
            let key = CacheKey::for_request(request);
            if seen.contains(&key) {
                return Err(CacheError::InvalidState(format!(
                    "duplicate request in batch: {}",
                    key.url
                )));
            }
            seen.push(key);
        }

        let responses = try_join_all(requests.iter().map(|request| async move {
            let response = fetcher.fetch(request).await?;
            if !response.ok() {
                warn!(url = %request.url, status = response.status, "Refusing to cache response");
                return Err(CacheError::BadStatus {
                    url: request.url.to_string(),
                    status: response.status,
                });
            }
            Ok::<_, CacheError>(response)
        }))
        .await?;

        self.storage
            .update(|caches| {
                let cache = caches.get_mut(&self.name)?;
                for (key, response) in seen.iter().zip(&responses) {
                    cache.put(key, response);
                }
                Ok(true)
            })
            .await?;

        debug!(cache = %self.name, count = responses.len(), "Cached batch");
        Ok(())
    }

    /// Delete the entry for a request.
    pub async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        self.storage
            .update(|caches| match caches.get_mut(&self.name) {
                Ok(cache) => Ok(cache.delete(request)),
                Err(_) => Ok(false),
            })
            .await
    }

    /// Storage keys of all entries.
    pub async fn keys(&self) -> Vec<String> {
        let caches = self.storage.inner.read().await;
        caches
            .get(&self.name)
            .map(|cache| cache.keys().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }
}
