//! Immutable snapshot of an inbound HTTP request.
//!
//! Captured requests are detached from inbound I/O so they can be handled
//! asynchronously: forwarded from another task, serialized into the queue,
//! and retried any number of times. After capture nothing references the
//! original request object.

use std::{collections::HashMap, fmt};

use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// Multi-valued header mapping. Values keep their inbound order per name.
pub type Headers = HashMap<String, Vec<String>>;

/// Inbound request body could not be read.
#[derive(Debug, Error)]
#[error("reading request body: {reason}")]
pub struct CaptureError {
    reason: String,
}

impl CaptureError {
    /// Wraps the underlying body-read failure.
    pub fn read(source: impl fmt::Display) -> Self {
        Self { reason: source.to_string() }
    }
}

/// Captured URL cannot be turned into an upstream request URL.
#[derive(Debug, Clone, Error)]
#[error("invalid captured URL {url:?}: {reason}")]
pub struct BuildError {
    url: String,
    reason: String,
}

impl BuildError {
    fn new(url: &str, reason: impl fmt::Display) -> Self {
        Self { url: url.to_owned(), reason: reason.to_string() }
    }
}

/// Snapshot of an inbound HTTP request.
///
/// Holds the method, the exact request URL as received (also the routing
/// label for metrics and logs), a deep copy of the headers, and the fully
/// read body. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRequest {
    method: String,
    origin_url: String,
    headers: Headers,
    body: Bytes,
}

impl CapturedRequest {
    /// Captures an inbound request from its decomposed parts.
    ///
    /// The body must already be read in full; failures reading it are the
    /// caller's to surface as [`CaptureError`]. Headers are deep-copied so
    /// later mutation of the inbound request cannot leak into the snapshot.
    pub fn capture(parts: &http::request::Parts, body: Bytes) -> Self {
        Self {
            method: parts.method.as_str().to_owned(),
            origin_url: parts.uri.to_string(),
            headers: copy_headers(&parts.headers),
            body,
        }
    }

    /// Reassembles a captured request from queue row columns.
    pub fn from_parts(method: String, origin_url: String, headers: Headers, body: Bytes) -> Self {
        Self { method, origin_url, headers, body }
    }

    /// Uppercase HTTP verb.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The exact inbound request URL; used as the routing label.
    pub fn origin_url(&self) -> &str {
        &self.origin_url
    }

    /// Deep-copied header map.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Fully buffered request body. Cloning is cheap and yields an
    /// independently readable view, so retries never consume the payload.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Rewrites the captured URL onto the configured origin.
    ///
    /// Scheme, host, and port are replaced by the remote's; path and query
    /// are kept verbatim. Accepts both origin-form URLs (`/path?query`) and
    /// absolute ones.
    pub fn upstream_url(&self, remote: &Url) -> Result<Url, BuildError> {
        let mut url = Url::options()
            .base_url(Some(remote))
            .parse(&self.origin_url)
            .map_err(|e| BuildError::new(&self.origin_url, e))?;

        url.set_scheme(remote.scheme())
            .map_err(|()| BuildError::new(&self.origin_url, "scheme not applicable"))?;
        url.set_host(remote.host_str()).map_err(|e| BuildError::new(&self.origin_url, e))?;
        url.set_port(remote.port())
            .map_err(|()| BuildError::new(&self.origin_url, "port not applicable"))?;

        Ok(url)
    }
}

impl fmt::Display for CapturedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.origin_url)
    }
}

fn copy_headers(headers: &http::HeaderMap) -> Headers {
    let mut copied: Headers = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        copied
            .entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    copied
}
