//! End-to-end behavior of the worker against in-memory and mock origins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Method, StatusCode};
use sharekit_cache::CacheStorage;
use sharekit_idb::{IDBFactory, TransactionMode};
use sharekit_net::{
    Blob, Fetcher, FormData, LoaderConfig, NetError, NetworkFetcher, Request, Response, Url,
};
use sharekit_sw::{
    decode_data_url, load_image, open_image_db, FetchDecision, ServiceWorker,
    ServiceWorkerContainer, ServiceWorkerError, WorkerConfig,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SCOPE: &str = "https://app.example/share/";

/// In-memory origin that counts every fetch.
struct CountingOrigin {
    routes: Vec<(&'static str, &'static str)>,
    calls: AtomicUsize,
}

impl CountingOrigin {
    fn shell() -> Arc<Self> {
        Self::with_routes(vec![
            ("/share/", "<!doctype html><title>share</title>"),
            ("/share/icon.png", "PNG icon"),
            ("/share/manifest.json", "{\"name\":\"share\"}"),
            ("/share/live.json", "{\"live\":true}"),
        ])
    }

    fn with_routes(routes: Vec<(&'static str, &'static str)>) -> Arc<Self> {
        Arc::new(Self {
            routes,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingOrigin {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hit = self
            .routes
            .iter()
            .find(|(p, _)| *p == request.url.path())
            .map(|(_, body)| *body);
        Ok(match hit {
            Some(body) => Response::new(StatusCode::OK, Bytes::from_static(body.as_bytes())).with_header(
                header::CACHE_CONTROL,
                HeaderValue::from_static("max-age=60"),
            ),
            None => Response::new(StatusCode::NOT_FOUND, Bytes::from_static(b"not found")),
        })
    }
}

fn url(relative: &str) -> Url {
    Url::parse(SCOPE).unwrap().join(relative).unwrap()
}

fn worker_with(origin: Arc<CountingOrigin>, caches: CacheStorage, idb: IDBFactory) -> ServiceWorker {
    ServiceWorker::new(
        WorkerConfig::default().with_scope(SCOPE),
        caches,
        origin,
        idb,
    )
    .unwrap()
}

fn worker(origin: Arc<CountingOrigin>) -> ServiceWorker {
    worker_with(origin, CacheStorage::new(), IDBFactory::default())
}

async fn respond(worker: &ServiceWorker, request: Request) -> Result<Response, ServiceWorkerError> {
    match worker.on_fetch(request) {
        FetchDecision::RespondWith(future) => future.await,
        FetchDecision::Passthrough(request) => panic!("not intercepted: {}", request.url),
    }
}

fn upload(form: &FormData) -> Request {
    let (body, content_type) = form.to_multipart("----sharekit-test");
    Request::post(url("./"), body).header(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type).unwrap(),
    )
}

fn image_form(mime: &str, data: &'static [u8]) -> FormData {
    let mut form = FormData::new();
    form.append_text("title", "holiday");
    form.append_file(
        "image",
        Blob::new(mime, Bytes::from_static(data)).with_name("photo"),
    );
    form
}

async fn stored_images(worker: &ServiceWorker) -> usize {
    let db = open_image_db(worker.idb(), &worker.config().database)
        .await
        .unwrap();
    let tx = db
        .transaction(&["images"], TransactionMode::ReadOnly)
        .await
        .unwrap();
    tx.count("images").unwrap()
}

#[tokio::test]
async fn cached_requests_are_served_without_network() {
    let origin = CountingOrigin::shell();
    let worker = worker(origin.clone());
    worker.install().await.unwrap();
    assert_eq!(origin.calls(), 3);

    let direct = origin.fetch(&Request::get(url("manifest.json"))).await.unwrap();
    let before = origin.calls();

    let response = respond(&worker, Request::get(url("manifest.json")))
        .await
        .unwrap();

    assert_eq!(origin.calls(), before);
    assert_eq!(response.status, direct.status);
    assert_eq!(response.headers, direct.headers);
    assert_eq!(response.body, direct.body);
}

#[tokio::test]
async fn uncached_requests_fetch_exactly_once() {
    let origin = CountingOrigin::shell();
    let worker = worker(origin.clone());

    let response = respond(&worker, Request::get(url("live.json"))).await.unwrap();
    assert_eq!(origin.calls(), 1);
    assert_eq!(response.body, Bytes::from_static(b"{\"live\":true}"));

    // Error statuses come back untouched.
    let response = respond(&worker, Request::get(url("nope.json"))).await.unwrap();
    assert_eq!(origin.calls(), 2);
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn non_post_methods_use_cache_first() {
    let origin = CountingOrigin::shell();
    let worker = worker(origin.clone());
    worker.install().await.unwrap();

    // HEAD was never cached, so it misses and goes to the network.
    let request = Request::new(Method::HEAD, url("./"));
    respond(&worker, request).await.unwrap();
    assert_eq!(origin.calls(), 4);
}

#[tokio::test]
async fn upload_stores_image_and_redirects() {
    let origin = CountingOrigin::shell();
    let worker = worker(origin.clone());

    let response = respond(&worker, upload(&image_form("image/png", b"\x89PNG pixels")))
        .await
        .unwrap();

    assert_eq!(response.status, 303);
    assert_eq!(response.location(), Some("./"));
    assert_eq!(origin.calls(), 0);

    let db = open_image_db(worker.idb(), &worker.config().database)
        .await
        .unwrap();
    let record = load_image(&db, worker.config()).await.unwrap().unwrap();
    assert_eq!(record.id, "sharedImage");

    let (mime, data) = decode_data_url(&record.data).unwrap();
    assert_eq!(mime, "image/png");
    assert_eq!(data, Bytes::from_static(b"\x89PNG pixels"));
    assert_eq!(stored_images(&worker).await, 1);
}

#[tokio::test]
async fn empty_file_upload_is_stored() {
    let origin = CountingOrigin::shell();
    let worker = worker(origin);

    let response = respond(&worker, upload(&image_form("image/gif", b"")))
        .await
        .unwrap();
    assert_eq!(response.status, 303);

    let db = open_image_db(worker.idb(), &worker.config().database)
        .await
        .unwrap();
    let record = load_image(&db, worker.config()).await.unwrap().unwrap();
    assert_eq!(record.data, "data:image/gif;base64,");
    assert_eq!(stored_images(&worker).await, 1);
}

#[tokio::test]
async fn upload_without_image_still_redirects() {
    let origin = CountingOrigin::shell();
    let worker = worker(origin);
    respond(&worker, upload(&image_form("image/png", b"first")))
        .await
        .unwrap();

    let mut form = FormData::new();
    form.append_text("title", "no picture");
    let response = respond(&worker, upload(&form)).await.unwrap();

    assert_eq!(response.status, 303);
    assert_eq!(response.location(), Some("./"));

    let db = open_image_db(worker.idb(), &worker.config().database)
        .await
        .unwrap();
    let record = load_image(&db, worker.config()).await.unwrap().unwrap();
    assert_eq!(decode_data_url(&record.data).unwrap().1, Bytes::from_static(b"first"));
}

#[tokio::test]
async fn upload_without_image_never_opens_database() {
    let worker = worker(CountingOrigin::shell());
    let mut form = FormData::new();
    form.append_text("title", "no picture");

    respond(&worker, upload(&form)).await.unwrap();
    assert!(worker.idb().databases().await.is_empty());
}

#[tokio::test]
async fn last_upload_wins() {
    let worker = worker(CountingOrigin::shell());

    for (mime, data) in [
        ("image/png", &b"one"[..]),
        ("image/gif", &b"two"[..]),
        ("image/jpeg", &b"three"[..]),
    ] {
        let mut form = FormData::new();
        form.append_file("image", Blob::new(mime, Bytes::copy_from_slice(data)));
        respond(&worker, upload(&form)).await.unwrap();
    }

    assert_eq!(stored_images(&worker).await, 1);
    let db = open_image_db(worker.idb(), &worker.config().database)
        .await
        .unwrap();
    let record = load_image(&db, worker.config()).await.unwrap().unwrap();
    assert_eq!(record.data, "data:image/jpeg;base64,dGhyZWU=");
}

#[tokio::test]
async fn concurrent_uploads_leave_one_record() {
    let worker = worker(CountingOrigin::shell());

    let uploads = (0..8).map(|i| {
        let worker = worker.clone();
        tokio::spawn(async move {
            let mut form = FormData::new();
            form.append_file(
                "image",
                Blob::new("image/png", Bytes::from(format!("image-{}", i))),
            );
            respond(&worker, upload(&form)).await
        })
    });

    for handle in futures::future::join_all(uploads).await {
        assert_eq!(handle.unwrap().unwrap().status, 303);
    }
    assert_eq!(stored_images(&worker).await, 1);
}

#[tokio::test]
async fn upload_with_broken_body_rejects() {
    let worker = worker(CountingOrigin::shell());
    let request = Request::post(url("./"), Bytes::from_static(b"garbage")).header(
        header::CONTENT_TYPE,
        HeaderValue::from_static("multipart/form-data"),
    );

    let result = respond(&worker, request).await;
    assert!(matches!(result, Err(ServiceWorkerError::Net(_))));
}

#[tokio::test]
async fn install_is_all_or_nothing() {
    let origin = CountingOrigin::with_routes(vec![
        ("/share/", "<html>"),
        ("/share/manifest.json", "{}"),
    ]);
    let caches = CacheStorage::new();
    let worker = worker_with(origin, caches.clone(), IDBFactory::default());
    let (container, _rx) = ServiceWorkerContainer::new(Arc::new(NoNetwork));

    let result = container.register(worker).await;
    assert!(matches!(result, Err(ServiceWorkerError::RegistrationFailed(_))));

    let cache = caches.snapshot("my-cache").await.unwrap();
    assert!(cache.is_empty());
    assert!(container.registration(&url("./")).await.is_none());
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let origin = CountingOrigin::shell();

    {
        let caches = CacheStorage::with_storage(dir.path()).await.unwrap();
        let (idb, _rx) = IDBFactory::with_storage(&dir.path().join("idb")).await.unwrap();
        let worker = worker_with(origin.clone(), caches, idb);
        worker.install().await.unwrap();
        respond(&worker, upload(&image_form("image/webp", b"webp")))
            .await
            .unwrap();
    }

    let caches = CacheStorage::with_storage(dir.path()).await.unwrap();
    let (idb, _rx) = IDBFactory::with_storage(&dir.path().join("idb")).await.unwrap();
    let worker = worker_with(origin.clone(), caches, idb);
    let calls = origin.calls();

    let response = respond(&worker, Request::get(url("icon.png"))).await.unwrap();
    assert_eq!(response.body, Bytes::from_static(b"PNG icon"));
    assert_eq!(origin.calls(), calls);

    let db = open_image_db(worker.idb(), &worker.config().database)
        .await
        .unwrap();
    let record = load_image(&db, worker.config()).await.unwrap().unwrap();
    assert_eq!(record.data, "data:image/webp;base64,d2VicA==");
}

struct NoNetwork;

#[async_trait]
impl Fetcher for NoNetwork {
    async fn fetch(&self, _request: &Request) -> Result<Response, NetError> {
        Err(NetError::RequestFailed("offline".to_string()))
    }
}

#[tokio::test]
async fn container_serves_registered_scope_over_http() {
    let server = MockServer::start().await;
    for (route, body) in [
        ("/share/", "<html>shell</html>"),
        ("/share/icon.png", "icon"),
        ("/share/manifest.json", "{}"),
    ] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;
    }

    let scope = format!("{}/share/", server.uri());
    let network: Arc<dyn Fetcher> = Arc::new(NetworkFetcher::new(LoaderConfig::default()).unwrap());
    let worker = ServiceWorker::new(
        WorkerConfig::default().with_scope(scope.clone()),
        CacheStorage::new(),
        network.clone(),
        IDBFactory::default(),
    )
    .unwrap();

    let (container, _rx) = ServiceWorkerContainer::new(network);
    container.register(worker).await.unwrap();

    // Served from cache: the mocks above expect exactly one hit each.
    let shell = Url::parse(&scope).unwrap();
    let response = container.handle_fetch(Request::get(shell.clone())).await;
    assert_eq!(response.text().unwrap(), "<html>shell</html>");

    let mut form = FormData::new();
    form.append_file("image", Blob::new("image/png", Bytes::from_static(b"png")));
    let (body, content_type) = form.to_multipart("----boundary");
    let request = Request::post(shell, body).header(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type).unwrap(),
    );
    let response = container.handle_fetch(request).await;
    assert_eq!(response.status, 303);
    assert_eq!(response.location(), Some("./"));
}
