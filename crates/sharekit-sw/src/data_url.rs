//! `data:` URL encoding, the stored form of an uploaded image.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use sharekit_net::Blob;

use crate::ServiceWorkerError;

/// Media type used when a blob has none.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Encode a blob as `data:<mime>;base64,<payload>`.
///
/// Runs on the blocking pool; images can be large.
pub async fn encode_data_url(blob: &Blob) -> Result<String, ServiceWorkerError> {
    let mime = if blob.mime_type.is_empty() {
        DEFAULT_MIME.to_string()
    } else {
        blob.mime_type.clone()
    };
    let data = blob.data.clone();

    tokio::task::spawn_blocking(move || format!("data:{};base64,{}", mime, STANDARD.encode(&data)))
        .await
        .map_err(|e| ServiceWorkerError::Encode(e.to_string()))
}

/// Decode a base64 `data:` URL into its media type and bytes.
pub fn decode_data_url(url: &str) -> Result<(String, Bytes), ServiceWorkerError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| ServiceWorkerError::Encode("not a data URL".to_string()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| ServiceWorkerError::Encode("data URL has no payload".to_string()))?;
    let mime = meta
        .strip_suffix(";base64")
        .ok_or_else(|| ServiceWorkerError::Encode("data URL is not base64".to_string()))?;

    let data = STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| ServiceWorkerError::Encode(e.to_string()))?;

    let mime = if mime.is_empty() { DEFAULT_MIME } else { mime };
    Ok((mime.to_string(), Bytes::from(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_encode_png() {
        let blob = Blob::new("image/png", Bytes::from_static(&[0x89, b'P', b'N', b'G']));
        let url = encode_data_url(&blob).await.unwrap();
        assert_eq!(url, "data:image/png;base64,iVBORw==");

        let (mime, data) = decode_data_url(&url).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, blob.data);
    }

    #[tokio::test]
    async fn test_encode_without_mime() {
        let blob = Blob::new("", Bytes::from_static(b"raw"));
        let url = encode_data_url(&blob).await.unwrap();
        assert!(url.starts_with("data:application/octet-stream;base64,"));
    }

    #[tokio::test]
    async fn test_encode_empty_blob() {
        let blob = Blob::new("image/gif", Bytes::new());
        assert_eq!(encode_data_url(&blob).await.unwrap(), "data:image/gif;base64,");
    }

    #[test]
    fn test_decode_rejects_non_data_urls() {
        assert!(decode_data_url("https://example.com/a.png").is_err());
        assert!(decode_data_url("data:text/plain,hello").is_err());
        assert!(decode_data_url("data:image/png;base64").is_err());
    }
}
