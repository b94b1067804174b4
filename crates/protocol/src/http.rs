//! HTTP value types exchanged with the transport.

use std::collections::BTreeMap;

/// Header names used by the blob transfer engine.
pub mod headers {
    pub const RANGE: &str = "range";
    pub const CONTENT_RANGE: &str = "content-range";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CONTENT_MD5: &str = "content-md5";
    pub const ETAG: &str = "etag";
    pub const IF_MATCH: &str = "if-match";
    pub const LAST_MODIFIED: &str = "last-modified";
    pub const BLOB_TYPE: &str = "x-ms-blob-type";
    pub const BLOB_CONTENT_TYPE: &str = "x-ms-blob-content-type";
    pub const RANGE_GET_CONTENT_MD5: &str = "x-ms-range-get-content-md5";
    pub const CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";
}

/// Largest range for which the service will compute a range MD5.
pub const MAX_RANGE_MD5_BYTES: u64 = 4 * 1024 * 1024;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// Case-insensitive header map. Names are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A request handed to the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Adds a header (builder style).
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body and its content length.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.headers
            .insert(headers::CONTENT_LENGTH, body.len().to_string());
        self.body = body;
        self
    }
}

/// A response returned by the transport.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Appends `key=value` query parameters to a URL, percent-encoding values.
pub fn append_query(url: &str, params: &[(&str, &str)]) -> String {
    use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

    let mut out = url.to_string();
    for (i, (key, value)) in params.iter().enumerate() {
        let sep = if i == 0 && !url.contains('?') { '?' } else { '&' };
        out.push(sep);
        out.push_str(key);
        out.push('=');
        out.push_str(&utf8_percent_encode(value, NON_ALPHANUMERIC).to_string());
    }
    out
}
