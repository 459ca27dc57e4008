//! Cached request/response pairs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sharekit_net::{Request, Response};
use url::Url;

/// Request identity used as the cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub url: Url,
}

impl CacheKey {
    pub fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self { method, url }
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }

    /// Stable string form, used as the map key in snapshots.
    pub fn as_storage_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers, in received order. Values are kept as raw bytes.
    #[serde(with = "header_pairs")]
    pub headers: Vec<(HeaderName, HeaderValue)>,

    /// Response body.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for the given key.
    pub fn capture(key: &CacheKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Self {
            url: key.url.to_string(),
            method: key.method.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            body: response.body.to_vec(),
            cached_at: sharekit_common::unix_millis(),
        }
    }

    /// Rebuild the response this entry captured.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }

        Response {
            url: Url::parse(&self.url).ok(),
            status: self.status,
            status_text: self.status_text.clone(),
            headers,
            body: Bytes::from(self.body.clone()),
        }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Headers as `[{ "name": ..., "value": <base64> }]`, so values that are
/// not UTF-8 survive a snapshot.
mod header_pairs {
    use super::*;
    use serde::de::Error as _;

    #[derive(Serialize, Deserialize)]
    struct StoredHeader {
        name: String,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    }

    pub fn serialize<S: Serializer>(
        headers: &[(HeaderName, HeaderValue)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(headers.iter().map(|(name, value)| StoredHeader {
            name: name.as_str().to_string(),
            value: value.as_bytes().to_vec(),
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(HeaderName, HeaderValue)>, D::Error> {
        Vec::<StoredHeader>::deserialize(deserializer)?
            .into_iter()
            .map(|header| {
                let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(D::Error::custom)?;
                let value = HeaderValue::from_bytes(&header.value).map_err(D::Error::custom)?;
                Ok::<_, D::Error>((name, value))
            })
            .collect()
    }
}
