//! Form data decoding and encoding.
//!
//! Decodes `multipart/form-data` and `application/x-www-form-urlencoded`
//! request bodies into named entries. File parts become [`Blob`]s that share
//! the request body's buffer.

use bytes::{BufMut, Bytes, BytesMut};
use mime::Mime;
use thiserror::Error;
use tracing::trace;

/// Content type given to file parts that carry no `Content-Type` header.
const DEFAULT_FILE_TYPE: &str = "text/plain";

/// Form data decoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormDataError {
    #[error("Missing Content-Type")]
    MissingContentType,

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Missing multipart boundary")]
    MissingBoundary,

    #[error("Malformed multipart body: {0}")]
    Malformed(String),
}

/// Binary content with a MIME type, as uploaded from a file input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// File name supplied by the client, if any.
    pub name: Option<String>,
    /// MIME type; may be empty.
    pub mime_type: String,
    /// Raw content.
    pub data: Bytes,
}

impl Blob {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: None,
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Attach a file name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Value types for form data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormDataValue {
    Text(String),
    File(Blob),
}

impl FormDataValue {
    /// Whether the value counts as present.
    ///
    /// Files are always present, even when empty; text is present when
    /// non-empty.
    pub fn is_present(&self) -> bool {
        match self {
            FormDataValue::Text(s) => !s.is_empty(),
            FormDataValue::File(_) => true,
        }
    }
}

/// Form data entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormDataEntry {
    pub name: String,
    pub value: FormDataValue,
}

/// Decoded form body, entries in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormData {
    entries: Vec<FormDataEntry>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text entry.
    pub fn append_text(&mut self, name: &str, value: &str) {
        self.entries.push(FormDataEntry {
            name: name.to_string(),
            value: FormDataValue::Text(value.to_string()),
        });
    }

    /// Append a file entry.
    pub fn append_file(&mut self, name: &str, blob: Blob) {
        self.entries.push(FormDataEntry {
            name: name.to_string(),
            value: FormDataValue::File(blob),
        });
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&FormDataValue> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.value)
    }

    /// All values for `name`.
    pub fn get_all(&self, name: &str) -> Vec<&FormDataValue> {
        self.entries
            .iter()
            .filter(|e| e.name == name)
            .map(|e| &e.value)
            .collect()
    }

    pub fn entries(&self) -> &[FormDataEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode a request body according to its content type.
    pub fn parse(content_type: &str, body: Bytes) -> Result<Self, FormDataError> {
        let mime: Mime = content_type
            .parse()
            .map_err(|_| FormDataError::UnsupportedContentType(content_type.to_string()))?;

        match (mime.type_(), mime.subtype()) {
            (mime::MULTIPART, mime::FORM_DATA) => {
                let boundary = mime
                    .get_param(mime::BOUNDARY)
                    .ok_or(FormDataError::MissingBoundary)?;
                parse_multipart(boundary.as_str().trim_matches('"'), body)
            }
            (mime::APPLICATION, mime::WWW_FORM_URLENCODED) => Ok(parse_url_encoded(&body)),
            _ => Err(FormDataError::UnsupportedContentType(
                mime.essence_str().to_string(),
            )),
        }
    }

    /// Encode as a `multipart/form-data` body with the given boundary.
    ///
    /// Returns the body and the matching `Content-Type` value.
    pub fn to_multipart(&self, boundary: &str) -> (Bytes, String) {
        let mut out = BytesMut::new();

        for entry in &self.entries {
            out.put_slice(format!("--{}\r\n", boundary).as_bytes());

            match &entry.value {
                FormDataValue::Text(v) => {
                    out.put_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                            entry.name, v
                        )
                        .as_bytes(),
                    );
                }
                FormDataValue::File(blob) => {
                    let content_type = if blob.mime_type.is_empty() {
                        "application/octet-stream"
                    } else {
                        blob.mime_type.as_str()
                    };
                    out.put_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                             Content-Type: {}\r\n\r\n",
                            entry.name,
                            blob.name.as_deref().unwrap_or("blob"),
                            content_type
                        )
                        .as_bytes(),
                    );
                    out.put_slice(&blob.data);
                    out.put_slice(b"\r\n");
                }
            }
        }

        out.put_slice(format!("--{}--\r\n", boundary).as_bytes());
        (
            out.freeze(),
            format!("multipart/form-data; boundary={}", boundary),
        )
    }
}

fn parse_url_encoded(body: &[u8]) -> FormData {
    let mut form = FormData::new();
    for (name, value) in url::form_urlencoded::parse(body) {
        form.append_text(&name, &value);
    }
    form
}

fn parse_multipart(boundary: &str, body: Bytes) -> Result<FormData, FormDataError> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut part_end = Vec::with_capacity(delimiter.len() + 2);
    part_end.extend_from_slice(b"\r\n");
    part_end.extend_from_slice(&delimiter);

    let mut form = FormData::new();

    let mut pos = find(&body, &delimiter, 0)
        .ok_or_else(|| FormDataError::Malformed("boundary not found".to_string()))?
        + delimiter.len();

    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            break;
        }
        if !rest.starts_with(b"\r\n") {
            return Err(FormDataError::Malformed(
                "expected CRLF after boundary".to_string(),
            ));
        }
        pos += 2;

        let header_end = find(&body, b"\r\n\r\n", pos)
            .ok_or_else(|| FormDataError::Malformed("unterminated part headers".to_string()))?;
        let headers = parse_part_headers(&body[pos..header_end])?;

        let content_start = header_end + 4;
        let content_end = find(&body, &part_end, content_start)
            .ok_or_else(|| FormDataError::Malformed("unterminated part".to_string()))?;
        let content = body.slice(content_start..content_end);

        trace!(name = %headers.name, bytes = content.len(), "Multipart part");

        match headers.filename {
            Some(filename) => {
                let mut blob = Blob::new(
                    headers
                        .content_type
                        .unwrap_or_else(|| DEFAULT_FILE_TYPE.to_string()),
                    content,
                );
                if !filename.is_empty() {
                    blob = blob.with_name(filename);
                }
                form.append_file(&headers.name, blob);
            }
            None => {
                form.append_text(&headers.name, &String::from_utf8_lossy(&content));
            }
        }

        pos = content_end + part_end.len();
    }

    Ok(form)
}

struct PartHeaders {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
}

fn parse_part_headers(raw: &[u8]) -> Result<PartHeaders, FormDataError> {
    let raw = String::from_utf8_lossy(raw);

    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in raw.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        if key.trim().eq_ignore_ascii_case("content-disposition") {
            for (k, v) in disposition_params(value) {
                match k.as_str() {
                    "name" => name = Some(v),
                    "filename" => filename = Some(v),
                    _ => {}
                }
            }
        } else if key.trim().eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        }
    }

    let name = name.ok_or_else(|| {
        FormDataError::Malformed("part without a name in Content-Disposition".to_string())
    })?;

    Ok(PartHeaders {
        name,
        filename,
        content_type,
    })
}

/// Parameters after the disposition type, keys lowercased. `;` inside a
/// quoted string does not separate parameters.
fn disposition_params(value: &str) -> Vec<(String, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);

    segments
        .iter()
        .skip(1)
        .filter_map(|segment| {
            let (key, value) = segment.trim().split_once('=')?;
            Some((key.trim().to_ascii_lowercase(), unquote(value.trim())))
        })
        .collect()
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"') else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '"' => break,
            _ => out.push(c),
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}
