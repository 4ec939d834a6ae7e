//! Transport Types
//!
//! Requests, responses and the decision values handed back to a transport.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Sentinel reported when the transport cannot determine a content length
pub const UNKNOWN_LENGTH: i64 = -1;

/// Kind of transport task to create for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Response body is streamed back as data chunks
    Data,
    /// Request body is uploaded; only send progress is reported
    Upload,
}

/// A request submitted to the transport
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-request timeout; `None` defers to the transport default
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a request with no headers or body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a GET request
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Parse a URL string into a request
    pub fn parse(method: Method, url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(method, Url::parse(url)?))
    }

    /// Set a header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Size of the body in bytes, `UNKNOWN_LENGTH` when there is none
    pub fn body_length(&self) -> i64 {
        self.body
            .as_ref()
            .map(|b| b.len() as i64)
            .unwrap_or(UNKNOWN_LENGTH)
    }
}

/// Response headers as reported by the transport
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Declared content length, `UNKNOWN_LENGTH` if absent
    pub expected_content_length: i64,
}

impl Response {
    /// Create a response with unknown length
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            expected_content_length: UNKNOWN_LENGTH,
        }
    }

    /// Set the declared content length
    pub fn with_expected_length(mut self, length: i64) -> Self {
        self.expected_content_length = length;
        self
    }

    /// Set a header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// MIME type without parameters
    pub fn mime_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }
}

/// Where a cached response may be stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStoragePolicy {
    Allowed,
    AllowedInMemoryOnly,
    NotAllowed,
}

/// A response proposed for caching
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub response: Response,
    pub data: Bytes,
    pub storage_policy: CacheStoragePolicy,
}

impl CachedResponse {
    pub fn new(response: Response, data: Bytes) -> Self {
        Self {
            response,
            data,
            storage_policy: CacheStoragePolicy::Allowed,
        }
    }
}

/// What the transport should do after response headers arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseDisposition {
    /// Abort the task
    Cancel,
    /// Continue as a data task
    Allow,
    /// Hand the rest of the transfer to a download task
    BecomeDownload,
}

impl Default for ResponseDisposition {
    fn default() -> Self {
        Self::Allow
    }
}

/// Upload progress for one send-progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendProgress {
    /// Bytes sent since the previous event
    pub bytes_sent: i64,
    /// Bytes sent so far
    pub total_sent: i64,
    /// Total body size, `UNKNOWN_LENGTH` if unknown
    pub total_expected: i64,
}
