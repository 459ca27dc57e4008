//! The worker: install handler and fetch interceptor.

use std::sync::Arc;

use futures::future::BoxFuture;
use http::{Method, StatusCode};
use sharekit_cache::CacheStorage;
use sharekit_idb::IDBFactory;
use sharekit_net::{FormDataValue, Fetcher, Request, Response};
use tracing::{debug, info};
use url::Url;

use crate::config::WorkerConfig;
use crate::persistence::{open_image_db, store_image};
use crate::ServiceWorkerError;

/// Future producing the response for an intercepted request.
pub type ResponseFuture = BoxFuture<'static, Result<Response, ServiceWorkerError>>;

/// Events delivered to a worker.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
}

/// What the worker does with an intercepted request.
pub enum FetchDecision {
    /// The worker answers; await the future for the response.
    RespondWith(ResponseFuture),
    /// The worker declines; the host fetches normally.
    Passthrough(Request),
}

impl std::fmt::Debug for FetchDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchDecision::RespondWith(_) => f.write_str("RespondWith(..)"),
            FetchDecision::Passthrough(request) => {
                f.debug_tuple("Passthrough").field(&request.url.as_str()).finish()
            }
        }
    }
}

/// Result of [`ServiceWorker::dispatch`].
#[derive(Debug)]
pub enum DispatchOutcome {
    Installed,
    Activated,
    Fetch(FetchDecision),
}

/// The offline worker.
///
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct ServiceWorker {
    scope: Url,
    config: Arc<WorkerConfig>,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    idb: IDBFactory,
}

impl ServiceWorker {
    pub fn new(
        config: WorkerConfig,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        idb: IDBFactory,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        Ok(Self {
            scope: config.scope_url()?,
            config: Arc::new(config),
            caches,
            fetcher,
            idb,
        })
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn idb(&self) -> &IDBFactory {
        &self.idb
    }

    /// Route an event to its handler.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<DispatchOutcome, ServiceWorkerError> {
        match event {
            WorkerEvent::Install => {
                self.install().await?;
                Ok(DispatchOutcome::Installed)
            }
            WorkerEvent::Activate => {
                debug!(scope = %self.scope, "Worker activated");
                Ok(DispatchOutcome::Activated)
            }
            WorkerEvent::Fetch(request) => Ok(DispatchOutcome::Fetch(self.on_fetch(request))),
        }
    }

    /// Precache the app shell. Either every URL is cached or none is.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        let urls = self.config.precache_urls()?;
        let cache = self.caches.open(&self.config.cache_name).await?;
        cache.add_all(self.fetcher.as_ref(), &urls).await?;

        info!(
            cache = %self.config.cache_name,
            count = urls.len(),
            "App shell cached"
        );
        Ok(())
    }

    /// Decide how to answer a request.
    ///
    /// Only http(s) requests are intercepted. POST is an image upload;
    /// everything else is served cache-first.
    pub fn on_fetch(&self, request: Request) -> FetchDecision {
        if !matches!(request.url.scheme(), "http" | "https") {
            return FetchDecision::Passthrough(request);
        }

        let worker = self.clone();
        if request.method == Method::POST {
            FetchDecision::RespondWith(Box::pin(worker.handle_upload(request)))
        } else {
            FetchDecision::RespondWith(Box::pin(worker.cache_first(request)))
        }
    }

    async fn cache_first(self, request: Request) -> Result<Response, ServiceWorkerError> {
        if let Some(response) = self.caches.match_request(&request).await {
            debug!(method = %request.method, url = %request.url, "Cache hit");
            return Ok(response);
        }

        debug!(method = %request.method, url = %request.url, "Cache miss");
        Ok(self.fetcher.fetch(&request).await?)
    }

    async fn handle_upload(self, request: Request) -> Result<Response, ServiceWorkerError> {
        let form = request.form_data()?;
        let field = self.config.image_field.as_str();

        match form.get(field) {
            Some(value) if value.is_present() => {
                // The database exists after any upload with an image field,
                // even one that is then rejected.
                let db = open_image_db(&self.idb, &self.config.database).await?;
                let FormDataValue::File(blob) = value else {
                    return Err(ServiceWorkerError::NotAFile(field.to_string()));
                };
                store_image(&db, &self.config, blob).await?;
            }
            _ => debug!(url = %request.url, field, "Upload without image"),
        }

        Ok(Response::redirect(
            &self.config.redirect_location,
            StatusCode::SEE_OTHER,
        )?)
    }
}
