//! # ShareKit Service Worker
//!
//! Offline worker for the ShareKit app: precaches the app shell on install,
//! serves non-POST requests cache-first, and accepts image uploads (the
//! share target) by storing the image in an object database and answering
//! with a redirect.
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (navigator.serviceWorker)
//!     │
//!     └── registration (scope) ──► ServiceWorker
//!                                      ├── CacheStorage   (install, cache-first)
//!                                      ├── dyn Fetcher    (network fallback)
//!                                      └── IDBFactory     (ImageDB / images)
//! ```
//!
//! The worker holds no mutable state of its own. Events go through
//! [`ServiceWorker::dispatch`]; a fetch yields a [`FetchDecision`] right away
//! and the response is produced by the future it carries.

use sharekit_cache::CacheError;
use sharekit_idb::IDBError;
use sharekit_net::NetError;
use thiserror::Error;

pub mod config;
mod container;
pub mod data_url;
pub mod persistence;
mod worker;

pub use config::{DatabaseConfig, WorkerConfig};
pub use container::{
    RegistrationInfo, ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerId,
    ServiceWorkerState,
};
pub use data_url::{decode_data_url, encode_data_url};
pub use persistence::{load_image, open_image_db, store_image, ImageRecord};
pub use worker::{DispatchOutcome, FetchDecision, ResponseFuture, ServiceWorker, WorkerEvent};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Form field {0:?} is not a file")]
    NotAFile(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Idb(#[from] IDBError),
}
