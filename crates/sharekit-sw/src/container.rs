//! Registration and lifecycle (`navigator.serviceWorker`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use sharekit_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::worker::{DispatchOutcome, FetchDecision, ServiceWorker, WorkerEvent};
use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Registered, not yet installing.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and handling fetches.
    Activated,
    /// Install failed, replaced or unregistered.
    Redundant,
}

/// Service worker events.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        scope: String,
        worker_id: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// A new worker took over a scope.
    ControllerChange { scope: String },
    /// A registration was removed.
    Unregistered { scope: String },
}

/// Public view of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub scope: Url,
    pub worker_id: ServiceWorkerId,
    pub state: ServiceWorkerState,
}

struct Registration {
    worker_id: ServiceWorkerId,
    worker: ServiceWorker,
}

/// Service worker container (navigator.serviceWorker).
#[derive(Clone)]
pub struct ServiceWorkerContainer {
    /// Active registrations by scope.
    registrations: Arc<RwLock<HashMap<String, Registration>>>,

    /// Fetcher for requests no worker answers.
    network: Arc<dyn Fetcher>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        network: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                network,
                event_tx,
            },
            event_rx,
        )
    }

    /// Register a worker for its scope, running install then activate.
    ///
    /// If install fails the worker becomes redundant and any worker already
    /// registered for the scope stays in control.
    pub async fn register(
        &self,
        worker: ServiceWorker,
    ) -> Result<RegistrationInfo, ServiceWorkerError> {
        let scope = worker.scope().clone();
        let id = ServiceWorkerId::new();

        self.set_state(&scope, id, ServiceWorkerState::Parsed);
        self.set_state(&scope, id, ServiceWorkerState::Installing);

        if let Err(error) = worker.dispatch(WorkerEvent::Install).await {
            warn!(scope = %scope, %error, "Install failed");
            self.set_state(&scope, id, ServiceWorkerState::Redundant);
            return Err(ServiceWorkerError::RegistrationFailed(error.to_string()));
        }
        self.set_state(&scope, id, ServiceWorkerState::Installed);

        self.set_state(&scope, id, ServiceWorkerState::Activating);
        match worker.dispatch(WorkerEvent::Activate).await? {
            DispatchOutcome::Activated => {}
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "unexpected activate outcome: {:?}",
                    other
                )))
            }
        }

        let previous = self.registrations.write().await.insert(
            scope.to_string(),
            Registration {
                worker_id: id,
                worker,
            },
        );
        if let Some(old) = previous {
            self.set_state(&scope, old.worker_id, ServiceWorkerState::Redundant);
        }

        self.set_state(&scope, id, ServiceWorkerState::Activated);
        let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
            scope: scope.to_string(),
        });
        info!(scope = %scope, worker = id.raw(), "Service worker activated");

        Ok(RegistrationInfo {
            scope,
            worker_id: id,
            state: ServiceWorkerState::Activated,
        })
    }

    /// Registration controlling `url`: the longest scope that prefixes it.
    pub async fn registration(&self, url: &Url) -> Option<RegistrationInfo> {
        let registrations = self.registrations.read().await;
        Self::matching(&registrations, url).map(|reg| RegistrationInfo {
            scope: reg.worker.scope().clone(),
            worker_id: reg.worker_id,
            state: ServiceWorkerState::Activated,
        })
    }

    /// All registered scopes.
    pub async fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Unregister the worker for `scope`.
    pub async fn unregister(&self, scope: &Url) -> bool {
        let removed = self.registrations.write().await.remove(scope.as_str());
        match removed {
            Some(reg) => {
                self.set_state(scope, reg.worker_id, ServiceWorkerState::Redundant);
                let _ = self.event_tx.send(ServiceWorkerEvent::Unregistered {
                    scope: scope.to_string(),
                });
                info!(scope = %scope, "Service worker unregistered");
                true
            }
            None => false,
        }
    }

    /// Answer a request the way a controlled page would see it.
    ///
    /// Requests outside every scope, or declined by the worker, go to the
    /// network. Worker and transport errors become a network error response.
    pub async fn handle_fetch(&self, request: Request) -> Response {
        let worker = {
            let registrations = self.registrations.read().await;
            Self::matching(&registrations, &request.url).map(|reg| reg.worker.clone())
        };

        let decision = match worker {
            Some(worker) => worker.on_fetch(request),
            None => FetchDecision::Passthrough(request),
        };

        match decision {
            FetchDecision::RespondWith(future) => future.await.unwrap_or_else(|error| {
                warn!(%error, "Worker failed to respond");
                Response::network_error()
            }),
            FetchDecision::Passthrough(request) => {
                debug!(url = %request.url, "Not intercepted");
                self.network.fetch(&request).await.unwrap_or_else(|error| {
                    warn!(url = %request.url, %error, "Network fetch failed");
                    Response::network_error()
                })
            }
        }
    }

    fn matching<'a>(
        registrations: &'a HashMap<String, Registration>,
        url: &Url,
    ) -> Option<&'a Registration> {
        registrations
            .iter()
            .filter(|(scope, _)| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|(scope, _)| scope.len())
            .map(|(_, reg)| reg)
    }

    fn set_state(&self, scope: &Url, worker_id: ServiceWorkerId, state: ServiceWorkerState) {
        debug!(scope = %scope, worker = worker_id.raw(), ?state, "State change");
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            scope: scope.to_string(),
            worker_id,
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkerConfig;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::StatusCode;
    use sharekit_cache::CacheStorage;
    use sharekit_idb::IDBFactory;
    use sharekit_net::NetError;

    /// Every path is 200 except those containing "missing".
    struct Origin;

    #[async_trait]
    impl Fetcher for Origin {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            if request.url.path().contains("missing") {
                return Ok(Response::new(StatusCode::NOT_FOUND, Bytes::new()));
            }
            if request.url.host_str() == Some("offline.test") {
                return Err(NetError::RequestFailed("offline".to_string()));
            }
            Ok(Response::new(StatusCode::OK, Bytes::from_static(b"origin")))
        }
    }

    fn worker(config: WorkerConfig) -> ServiceWorker {
        ServiceWorker::new(config, CacheStorage::new(), Arc::new(Origin), IDBFactory::default())
            .unwrap()
    }

    fn states(rx: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServiceWorkerEvent::StateChange { state, .. } = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test]
    async fn test_register_runs_lifecycle() {
        let (container, mut rx) = ServiceWorkerContainer::new(Arc::new(Origin));
        let config = WorkerConfig::default().with_scope("https://example.com/app/");

        let info = container.register(worker(config)).await.unwrap();
        assert_eq!(info.state, ServiceWorkerState::Activated);
        assert_eq!(
            states(&mut rx),
            vec![
                ServiceWorkerState::Parsed,
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_install_is_redundant() {
        let (container, mut rx) = ServiceWorkerContainer::new(Arc::new(Origin));
        let mut config = WorkerConfig::default().with_scope("https://example.com/app/");
        config.precache.push("./missing.png".to_string());

        let result = container.register(worker(config)).await;
        assert!(matches!(result, Err(ServiceWorkerError::RegistrationFailed(_))));
        assert_eq!(states(&mut rx).last(), Some(&ServiceWorkerState::Redundant));
        assert!(container.scopes().await.is_empty());
    }

    #[tokio::test]
    async fn test_registration_picks_longest_scope() {
        let (container, _rx) = ServiceWorkerContainer::new(Arc::new(Origin));
        container
            .register(worker(WorkerConfig::default().with_scope("https://example.com/")))
            .await
            .unwrap();
        let inner = container
            .register(worker(WorkerConfig::default().with_scope("https://example.com/app/")))
            .await
            .unwrap();

        let url = Url::parse("https://example.com/app/page").unwrap();
        assert_eq!(container.registration(&url).await, Some(inner));

        let other = Url::parse("https://other.com/").unwrap();
        assert!(container.registration(&other).await.is_none());
    }

    #[tokio::test]
    async fn test_reregister_replaces_worker() {
        let (container, mut rx) = ServiceWorkerContainer::new(Arc::new(Origin));
        let config = WorkerConfig::default().with_scope("https://example.com/app/");

        let first = container.register(worker(config.clone())).await.unwrap();
        states(&mut rx);
        let second = container.register(worker(config)).await.unwrap();
        assert_ne!(first.worker_id, second.worker_id);

        let mut redundant = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServiceWorkerEvent::StateChange {
                worker_id,
                state: ServiceWorkerState::Redundant,
                ..
            } = event
            {
                redundant.push(worker_id);
            }
        }
        assert_eq!(redundant, vec![first.worker_id]);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (container, _rx) = ServiceWorkerContainer::new(Arc::new(Origin));
        let scope = Url::parse("https://example.com/app/").unwrap();
        container
            .register(worker(WorkerConfig::default().with_scope(scope.as_str())))
            .await
            .unwrap();

        assert!(container.unregister(&scope).await);
        assert!(!container.unregister(&scope).await);
        assert!(container.registration(&scope).await.is_none());
    }

    #[tokio::test]
    async fn test_handle_fetch_outside_scope_uses_network() {
        let (container, _rx) = ServiceWorkerContainer::new(Arc::new(Origin));
        let response = container
            .handle_fetch(Request::get(Url::parse("https://example.com/x").unwrap()))
            .await;
        assert_eq!(response.status, 200);

        let response = container
            .handle_fetch(Request::get(Url::parse("https://offline.test/").unwrap()))
            .await;
        assert!(response.is_network_error());
    }

    #[tokio::test]
    async fn test_handle_fetch_worker_error_is_network_error() {
        let (container, _rx) = ServiceWorkerContainer::new(Arc::new(Origin));
        container
            .register(worker(WorkerConfig::default().with_scope("https://example.com/app/")))
            .await
            .unwrap();

        let request = Request::post(
            Url::parse("https://example.com/app/").unwrap(),
            Bytes::from_static(b"no content type"),
        );
        let response = container.handle_fetch(request).await;
        assert!(response.is_network_error());
    }
}
