//! Transport boundary
//!
//! Every container and object operation goes through the [`Transport`]
//! trait as a single request/response round trip. The HTTP implementation
//! talks to a real service; the in-memory implementation reproduces the
//! service's server-side behaviour so the rest of the crate can run
//! without a network.

pub mod http;
pub mod memory;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};

use crate::error::{Result, StoreError};

pub use http::HttpTransport;
pub use memory::MemoryTransport;

/// Header carrying the auth token on every storage request
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Streaming request body
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Request body
pub enum Body {
    Empty,
    Bytes(Bytes),
    /// Raw byte stream; `length` is `None` for chunked transfer
    Stream {
        stream: ByteStream,
        length: Option<u64>,
    },
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream { length, .. } => write!(f, "Body::Stream(length={:?})", length),
        }
    }
}

/// A single request to the storage or identity service
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// A copy that can be sent again; `None` for streamed bodies, which
    /// are consumed by the first attempt
    pub fn try_clone(&self) -> Option<Self> {
        let body = match &self.body {
            Body::Empty => Body::Empty,
            Body::Bytes(bytes) => Body::Bytes(bytes.clone()),
            Body::Stream { .. } => return None,
        };
        Some(Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body,
        })
    }
}

/// Response to a [`Request`]
///
/// Carries the method and URL of the request so failures can be reported
/// with enough context to diagnose them.
#[derive(Debug, Clone)]
pub struct Response {
    pub method: Method,
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Return the response if its status is one of `expected`, otherwise the
    /// matching error kind.
    pub fn ensure(self, expected: &[StatusCode]) -> Result<Self> {
        if expected.contains(&self.status) {
            return Ok(self);
        }
        Err(self.into_error())
    }

    /// Convert an unexpected status into an error
    pub fn into_error(self) -> StoreError {
        let what = format!("{} {}", self.method, self.url);
        match self.status {
            StatusCode::NOT_FOUND => StoreError::NotFound(what),
            StatusCode::CONFLICT => StoreError::Conflict(what),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(what),
            status => StoreError::Transport {
                method: self.method.to_string(),
                url: self.url,
                status: Some(status.as_u16()),
                message: String::from_utf8_lossy(&self.body).trim().to_string(),
            },
        }
    }

    /// Look up a header as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }
}

/// Core transport trait
///
/// Implementations perform one round trip per call and return whatever
/// status the service answered with; only network-level failures are
/// errors at this layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a request
    async fn execute(&self, request: Request) -> Result<Response>;

    async fn get(&self, url: &str, headers: HeaderMap) -> Result<Response> {
        self.execute(Request::new(Method::GET, url).headers(headers))
            .await
    }

    async fn head(&self, url: &str, headers: HeaderMap) -> Result<Response> {
        self.execute(Request::new(Method::HEAD, url).headers(headers))
            .await
    }

    async fn put(&self, url: &str, headers: HeaderMap, body: Body) -> Result<Response> {
        self.execute(Request::new(Method::PUT, url).headers(headers).body(body))
            .await
    }

    async fn post(&self, url: &str, headers: HeaderMap, body: Body) -> Result<Response> {
        self.execute(Request::new(Method::POST, url).headers(headers).body(body))
            .await
    }

    async fn delete(&self, url: &str, headers: HeaderMap) -> Result<Response> {
        self.execute(Request::new(Method::DELETE, url).headers(headers))
            .await
    }
}

/// Look up a header value as a string, ignoring non-UTF-8 values
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Insert a header, rejecting names or values that cannot be sent
pub fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| StoreError::InvalidArgument(format!("invalid header name: {}", name)))?;
    let value = HeaderValue::from_str(value).map_err(|_| {
        StoreError::InvalidArgument(format!("invalid value for header {}: {:?}", name, value))
    })?;
    headers.insert(name, value);
    Ok(())
}

/// Collect headers sharing `prefix` into a map keyed by the lower-cased
/// remainder of the name.
pub fn prefixed_headers(
    headers: &HeaderMap,
    prefix: &str,
) -> std::collections::BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(prefix)?;
            let value = value.to_str().ok()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
