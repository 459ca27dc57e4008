//! # ShareKit Net
//!
//! Request/response model and network access for the ShareKit worker.
//!
//! ## Design Goals
//!
//! 1. **One seam for the network**: everything that needs a live response goes
//!    through the [`Fetcher`] trait, so the worker can run against a real
//!    origin ([`NetworkFetcher`]) or an in-memory one.
//! 2. **Responses are values**: a [`Response`] owns its full body, so it can
//!    be stored in a cache and replayed verbatim.
//! 3. **Form bodies**: POST bodies decode into [`FormData`] the way a page's
//!    form submission would be seen by a worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};

pub use url::Url;

pub mod form;

pub use form::{Blob, FormData, FormDataEntry, FormDataError, FormDataValue};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid redirect status: {0}")]
    InvalidRedirectStatus(u16),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Form data error: {0}")]
    FormData(#[from] FormDataError),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a request with an arbitrary method and no body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            body: Some(body),
            ..Self::new(Method::POST, url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// The request's `Content-Type`, if present and valid UTF-8.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Decode the body as form data.
    ///
    /// Accepts `multipart/form-data` and `application/x-www-form-urlencoded`.
    /// A request without a body decodes as an empty body.
    pub fn form_data(&self) -> Result<FormData, NetError> {
        let content_type = self
            .content_type()
            .ok_or(FormDataError::MissingContentType)?;
        let body = self.body.clone().unwrap_or_default();
        Ok(FormData::parse(content_type, body)?)
    }
}

/// HTTP response.
///
/// The body is always fully buffered. A status of `0` marks a network error,
/// the same way a page observes a failed fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Final URL, if the response came from a request.
    pub url: Option<Url>,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Create a response with the canonical reason phrase for `status`.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Create a network error response.
    pub fn network_error() -> Self {
        Self {
            url: None,
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Create a redirect response with a `Location` header.
    ///
    /// Only 301, 302, 303, 307 and 308 are accepted.
    pub fn redirect(location: &str, status: StatusCode) -> Result<Self, NetError> {
        if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
            return Err(NetError::InvalidRedirectStatus(status.as_u16()));
        }
        let value = HeaderValue::from_str(location)
            .map_err(|e| NetError::InvalidUrl(format!("{}: {}", location, e)))?;

        let mut response = Self::new(status, Bytes::new());
        response.headers.insert(header::LOCATION, value);
        Ok(response)
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Check if the response is successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if this is a network error response.
    pub fn is_network_error(&self) -> bool {
        self.status == 0
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the `Location` header.
    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can turn a request into a response.
///
/// Transport failures are errors; HTTP error statuses are not.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("ShareKit/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] backed by a real HTTP client.
pub struct NetworkFetcher {
    client: Client,
    config: LoaderConfig,
}

impl NetworkFetcher {
    /// Create a new network fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "NetworkFetcher initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

#[async_trait]
impl Fetcher for NetworkFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(url),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/json"),
            )
            .timeout(Duration::from_secs(10));

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_redirect_response() {
        let response = Response::redirect("./", StatusCode::SEE_OTHER).unwrap();
        assert_eq!(response.status, 303);
        assert_eq!(response.location(), Some("./"));
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_redirect_rejects_non_redirect_status() {
        let result = Response::redirect("./", StatusCode::OK);
        assert!(matches!(result, Err(NetError::InvalidRedirectStatus(200))));
    }

    #[test]
    fn test_network_error_response() {
        let response = Response::network_error();
        assert!(response.is_network_error());
        assert!(!response.ok());
    }

    #[test]
    fn test_form_data_requires_content_type() {
        let url = Url::parse("https://example.com/upload").unwrap();
        let request = Request::post(url, Bytes::from_static(b"a=1"));
        assert!(matches!(
            request.form_data(),
            Err(NetError::FormData(FormDataError::MissingContentType))
        ));
    }

    #[test]
    fn test_form_data_url_encoded() {
        let url = Url::parse("https://example.com/upload").unwrap();
        let request = Request::post(url, Bytes::from_static(b"title=hello%20world")).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let form = request.form_data().unwrap();
        assert_eq!(
            form.get("title"),
            Some(&FormDataValue::Text("hello world".to_string()))
        );
    }

    #[tokio::test]
    async fn test_network_fetcher_returns_error_statuses_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let fetcher = NetworkFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = fetcher.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, 404);
        assert!(!response.ok());
        assert_eq!(response.text().unwrap(), "nope");
    }

    #[tokio::test]
    async fn test_network_fetcher_sends_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .respond_with(ResponseTemplate::new(201).set_body_bytes(b"created".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = NetworkFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/echo", server.uri())).unwrap();
        let response = fetcher
            .fetch(&Request::post(url, Bytes::from_static(b"payload")))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body, Bytes::from_static(b"created"));
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("ShareKit/"));
        assert_eq!(config.max_redirects, 10);
    }
}
