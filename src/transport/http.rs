//! HTTP transport backed by reqwest

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_LENGTH};
use tracing::trace;

use super::{Body, Request, Response, Transport};
use crate::error::{Result, StoreError};

/// HTTP transport configuration
#[derive(Debug, Clone, Default)]
pub struct HttpTransportConfig {
    /// Whole-request timeout; `None` leaves it to the client default
    pub timeout: Option<Duration>,
    /// User agent sent with every request
    pub user_agent: Option<String>,
}

/// Transport that performs real HTTP round trips
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(
            config
                .user_agent
                .unwrap_or_else(|| format!("objstore-fs/{}", env!("CARGO_PKG_VERSION"))),
        );

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| StoreError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: Request) -> Result<Response> {
        let Request {
            method,
            url,
            mut headers,
            body,
        } = request;

        trace!("{} {} body={:?}", method, url, body);

        if let Body::Stream {
            length: Some(length),
            ..
        } = &body
        {
            headers
                .entry(CONTENT_LENGTH)
                .or_insert_with(|| HeaderValue::from(*length));
        }

        let builder = self.client.request(method.clone(), &url).headers(headers);
        let builder = match body {
            Body::Empty => builder,
            Body::Bytes(bytes) => builder.body(bytes),
            Body::Stream { stream, .. } => builder.body(reqwest::Body::wrap_stream(stream)),
        };

        let transport_error = |e: reqwest::Error| StoreError::Transport {
            method: method.to_string(),
            url: url.clone(),
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        };

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(transport_error)?;

        trace!("{} {} -> {} ({} bytes)", method, url, status, body.len());

        Ok(Response {
            method,
            url,
            status,
            headers,
            body,
        })
    }
}
