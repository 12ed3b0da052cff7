//! In-memory object store
//!
//! Answers storage requests the way the remote service does: prefix and
//! delimiter listings with marker paging, server-side copy via
//! `X-Copy-From`, container ACL and metadata headers, ETag checks on upload
//! and 409 on deleting a non-empty container. Used by the test suite and by
//! the `memory` backend for local experiments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use percent_encoding::percent_decode_str;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::json;
use tracing::trace;

use super::{header_str, insert_header, Body, Request, Response, Transport};
use crate::error::{Result, StoreError};

/// Storage endpoint answered by a default [`MemoryTransport`]
pub const DEFAULT_ENDPOINT: &str = "memory://objstore/v1/AUTH_local";

/// Page size cap, matching the service default
const MAX_LISTING: usize = 10_000;

/// Request headers never stored as object attributes
const TRANSIENT_HEADERS: &[&str] = &[
    "x-auth-token",
    "content-length",
    "content-type",
    "etag",
    "transfer-encoding",
    "x-copy-from",
    "host",
    "user-agent",
    "accept",
];

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    content_type: String,
    last_modified: DateTime<Utc>,
    /// Metadata and other persisted headers, lower-cased names
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct StoredContainer {
    read_acl: Option<String>,
    write_acl: Option<String>,
    metadata: BTreeMap<String, String>,
    objects: BTreeMap<String, StoredObject>,
}

impl StoredContainer {
    fn bytes_used(&self) -> u64 {
        self.objects.values().map(|o| o.data.len() as u64).sum()
    }
}

/// Listing query parameters
#[derive(Debug, Default)]
struct ListingParams {
    prefix: String,
    delimiter: Option<char>,
    marker: Option<String>,
    limit: usize,
}

/// In-memory store speaking the storage wire protocol
pub struct MemoryTransport {
    endpoint: String,
    containers: RwLock<BTreeMap<String, StoredContainer>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create an empty store answering at [`DEFAULT_ENDPOINT`]
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    /// Create an empty store answering at `endpoint`
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            containers: RwLock::new(BTreeMap::new()),
        }
    }

    /// The storage endpoint this store answers
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Names of all objects in a container, in listing order
    pub fn object_names(&self, container: &str) -> Vec<String> {
        self.containers
            .read()
            .get(container)
            .map(|c| c.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Raw stored bytes of an object
    pub fn object_data(&self, container: &str, name: &str) -> Option<Bytes> {
        self.containers
            .read()
            .get(container)
            .and_then(|c| c.objects.get(name))
            .map(|o| o.data.clone())
    }

    /// Replace an object's bytes without touching its etag, simulating
    /// corruption between upload and download.
    pub fn corrupt(&self, container: &str, name: &str, data: impl Into<Bytes>) -> bool {
        let mut containers = self.containers.write();
        match containers
            .get_mut(container)
            .and_then(|c| c.objects.get_mut(name))
        {
            Some(object) => {
                object.data = data.into();
                true
            }
            None => false,
        }
    }

    /// Split a request URL into decoded container, object name and query
    fn route(&self, url: &str) -> Option<(String, String, BTreeMap<String, String>)> {
        let rest = url.strip_prefix(&self.endpoint)?;
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, q),
            None => (rest, ""),
        };

        let path = path.trim_start_matches('/');
        let (container, object) = match path.split_once('/') {
            Some((c, o)) => (c, o),
            None => (path, ""),
        };

        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();

        let query = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (decode(k), decode(v)),
                None => (decode(pair), String::new()),
            })
            .collect();

        Some((decode(container), decode(object), query))
    }

    fn handle(&self, method: &Method, url: &str, headers: &HeaderMap, body: Bytes) -> Reply {
        let (container, object, query) = match self.route(url) {
            Some(route) => route,
            None => return Reply::status(StatusCode::NOT_FOUND),
        };

        if header_str(headers, super::AUTH_TOKEN_HEADER).is_none() {
            return Reply::status(StatusCode::UNAUTHORIZED);
        }

        match (container.is_empty(), object.is_empty()) {
            (true, _) => self.account(method, &query),
            (false, true) => self.container(method, &container, headers, &query),
            (false, false) => self.object(method, &container, &object, headers, body),
        }
    }

    fn account(&self, method: &Method, query: &BTreeMap<String, String>) -> Reply {
        let containers = self.containers.read();
        match *method {
            Method::HEAD | Method::GET => {
                let mut reply = Reply::status(if *method == Method::GET {
                    StatusCode::OK
                } else {
                    StatusCode::NO_CONTENT
                });
                let objects: usize = containers.values().map(|c| c.objects.len()).sum();
                let bytes: u64 = containers.values().map(StoredContainer::bytes_used).sum();
                reply.header("x-account-container-count", &containers.len().to_string());
                reply.header("x-account-object-count", &objects.to_string());
                reply.header("x-account-bytes-used", &bytes.to_string());

                if *method == Method::GET {
                    let params = ListingParams::from_query(query);
                    let listing: Vec<_> = containers
                        .iter()
                        .filter(|(name, _)| name.starts_with(&params.prefix))
                        .filter(|(name, _)| {
                            params.marker.as_deref().map_or(true, |m| name.as_str() > m)
                        })
                        .take(params.limit)
                        .map(|(name, c)| {
                            json!({
                                "name": name,
                                "count": c.objects.len(),
                                "bytes": c.bytes_used(),
                            })
                        })
                        .collect();
                    reply.json(&listing);
                }
                reply
            }
            _ => Reply::status(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    fn container(
        &self,
        method: &Method,
        name: &str,
        headers: &HeaderMap,
        query: &BTreeMap<String, String>,
    ) -> Reply {
        let mut containers = self.containers.write();
        match *method {
            Method::PUT => {
                let created = !containers.contains_key(name);
                let container = containers.entry(name.to_string()).or_default();
                apply_container_headers(container, headers);
                Reply::status(if created {
                    StatusCode::CREATED
                } else {
                    StatusCode::ACCEPTED
                })
            }
            Method::POST => match containers.get_mut(name) {
                Some(container) => {
                    apply_container_headers(container, headers);
                    Reply::status(StatusCode::NO_CONTENT)
                }
                None => Reply::status(StatusCode::NOT_FOUND),
            },
            Method::DELETE => match containers.get(name) {
                None => Reply::status(StatusCode::NOT_FOUND),
                Some(c) if !c.objects.is_empty() => Reply::status(StatusCode::CONFLICT),
                Some(_) => {
                    containers.remove(name);
                    Reply::status(StatusCode::NO_CONTENT)
                }
            },
            Method::HEAD | Method::GET => {
                let container = match containers.get(name) {
                    Some(c) => c,
                    None => return Reply::status(StatusCode::NOT_FOUND),
                };

                let mut reply = Reply::status(if *method == Method::GET {
                    StatusCode::OK
                } else {
                    StatusCode::NO_CONTENT
                });
                reply.header(
                    "x-container-object-count",
                    &container.objects.len().to_string(),
                );
                reply.header("x-container-bytes-used", &container.bytes_used().to_string());
                if let Some(acl) = &container.read_acl {
                    reply.header("x-container-read", acl);
                }
                if let Some(acl) = &container.write_acl {
                    reply.header("x-container-write", acl);
                }
                for (key, value) in &container.metadata {
                    reply.header(&format!("x-container-meta-{}", key), value);
                }

                if *method == Method::GET {
                    let listing = list_objects(container, &ListingParams::from_query(query));
                    reply.json(&listing);
                }
                reply
            }
            _ => Reply::status(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    fn object(
        &self,
        method: &Method,
        container_name: &str,
        name: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Reply {
        let mut containers = self.containers.write();

        if *method == Method::PUT {
            if let Some(source) = header_str(headers, "x-copy-from") {
                let source = percent_decode_str(source.trim_start_matches('/'))
                    .decode_utf8_lossy()
                    .into_owned();
                let copied = source.split_once('/').and_then(|(c, o)| {
                    containers.get(c).and_then(|c| c.objects.get(o)).cloned()
                });
                let mut copied = match copied {
                    Some(object) => object,
                    None => return Reply::status(StatusCode::NOT_FOUND),
                };
                let target = match containers.get_mut(container_name) {
                    Some(c) => c,
                    None => return Reply::status(StatusCode::NOT_FOUND),
                };
                if let Some(content_type) = header_str(headers, "content-type") {
                    copied.content_type = content_type.to_string();
                }
                copied.last_modified = Utc::now();
                let etag = copied.etag.clone();
                target.objects.insert(name.to_string(), copied);

                let mut reply = Reply::status(StatusCode::CREATED);
                reply.header("etag", &etag);
                return reply;
            }
        }

        let container = match containers.get_mut(container_name) {
            Some(c) => c,
            None => return Reply::status(StatusCode::NOT_FOUND),
        };

        match *method {
            Method::PUT => {
                let chunked = header_str(headers, "transfer-encoding")
                    .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
                match header_str(headers, "content-length").map(str::parse::<usize>) {
                    Some(Ok(length)) if length == body.len() => {}
                    Some(_) => return Reply::status(StatusCode::BAD_REQUEST),
                    None if chunked => {}
                    None => return Reply::status(StatusCode::LENGTH_REQUIRED),
                }

                let etag = hex::encode(Md5::digest(&body));
                if let Some(expected) = header_str(headers, "etag") {
                    if !expected.trim_matches('"').eq_ignore_ascii_case(&etag) {
                        return Reply::status(StatusCode::UNPROCESSABLE_ENTITY);
                    }
                }

                let stored = StoredObject {
                    data: body,
                    etag: etag.clone(),
                    content_type: header_str(headers, "content-type")
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                    last_modified: Utc::now(),
                    headers: persisted_headers(headers),
                };
                container.objects.insert(name.to_string(), stored);

                let mut reply = Reply::status(StatusCode::CREATED);
                reply.header("etag", &etag);
                reply
            }
            Method::POST => match container.objects.get_mut(name) {
                Some(object) => {
                    object
                        .headers
                        .retain(|k, _| !k.starts_with("x-object-meta-"));
                    object.headers.extend(persisted_headers(headers));
                    Reply::status(StatusCode::ACCEPTED)
                }
                None => Reply::status(StatusCode::NOT_FOUND),
            },
            Method::DELETE => match container.objects.remove(name) {
                Some(_) => Reply::status(StatusCode::NO_CONTENT),
                None => Reply::status(StatusCode::NOT_FOUND),
            },
            Method::HEAD | Method::GET => {
                let object = match container.objects.get(name) {
                    Some(o) => o,
                    None => return Reply::status(StatusCode::NOT_FOUND),
                };
                let mut reply = Reply::status(StatusCode::OK);
                reply.header("content-type", &object.content_type);
                reply.header("content-length", &object.data.len().to_string());
                reply.header("etag", &object.etag);
                reply.header(
                    "last-modified",
                    &object
                        .last_modified
                        .format("%a, %d %b %Y %H:%M:%S GMT")
                        .to_string(),
                );
                for (key, value) in &object.headers {
                    reply.header(key, value);
                }
                if *method == Method::GET {
                    reply.body = object.data.clone();
                }
                reply
            }
            _ => Reply::status(StatusCode::METHOD_NOT_ALLOWED),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn execute(&self, request: Request) -> Result<Response> {
        let Request {
            method,
            url,
            headers,
            body,
        } = request;

        let body = match body {
            Body::Empty => Bytes::new(),
            Body::Bytes(bytes) => bytes,
            Body::Stream { stream, .. } => {
                let mut buffer = BytesMut::new();
                let mut stream = stream;
                while let Some(chunk) = stream.try_next().await.map_err(|e| {
                    StoreError::Transport {
                        method: method.to_string(),
                        url: url.clone(),
                        status: None,
                        message: format!("request body stream failed: {}", e),
                    }
                })? {
                    buffer.extend_from_slice(&chunk);
                }
                buffer.freeze()
            }
        };

        let reply = self.handle(&method, &url, &headers, body);
        trace!("memory {} {} -> {}", method, url, reply.status);

        Ok(Response {
            method,
            url,
            status: reply.status,
            headers: reply.headers,
            body: reply.body,
        })
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn header(&mut self, name: &str, value: &str) {
        // Stored values were accepted on the way in, so they are valid here
        let _ = insert_header(&mut self.headers, name, value);
    }

    fn json(&mut self, value: &impl serde::Serialize) {
        self.header("content-type", "application/json; charset=utf-8");
        self.body = Bytes::from(serde_json::to_vec(value).unwrap_or_default());
    }
}

impl ListingParams {
    fn from_query(query: &BTreeMap<String, String>) -> Self {
        let limit = query
            .get("limit")
            .and_then(|l| l.parse::<usize>().ok())
            .unwrap_or(MAX_LISTING)
            .min(MAX_LISTING);

        // `path` lists the immediate children of a pseudo-directory
        if let Some(path) = query.get("path") {
            let mut prefix = path.trim_start_matches('/').to_string();
            if !prefix.is_empty() && !prefix.ends_with('/') {
                prefix.push('/');
            }
            return Self {
                prefix,
                delimiter: Some(
                    query
                        .get("delimiter")
                        .and_then(|d| d.chars().next())
                        .unwrap_or('/'),
                ),
                marker: query.get("marker").cloned().filter(|m| !m.is_empty()),
                limit,
            };
        }

        Self {
            prefix: query.get("prefix").cloned().unwrap_or_default(),
            delimiter: query.get("delimiter").and_then(|d| d.chars().next()),
            marker: query.get("marker").cloned().filter(|m| !m.is_empty()),
            limit,
        }
    }
}

fn list_objects(container: &StoredContainer, params: &ListingParams) -> Vec<serde_json::Value> {
    let mut listing = Vec::new();
    let mut last_subdir: Option<String> = None;

    for (name, object) in &container.objects {
        if listing.len() >= params.limit {
            break;
        }
        if !name.starts_with(&params.prefix) {
            continue;
        }
        if let Some(marker) = &params.marker {
            if name <= marker {
                continue;
            }
        }

        if let Some(delimiter) = params.delimiter {
            let rest = &name[params.prefix.len()..];
            if let Some(idx) = rest.find(delimiter) {
                let subdir = format!("{}{}", params.prefix, &rest[..idx + delimiter.len_utf8()]);
                let already_listed = last_subdir.as_deref() == Some(subdir.as_str())
                    || params.marker.as_deref().is_some_and(|m| subdir.as_str() <= m);
                if !already_listed {
                    listing.push(json!({ "subdir": subdir }));
                    last_subdir = Some(subdir);
                }
                continue;
            }
        }

        listing.push(json!({
            "name": name,
            "hash": object.etag,
            "bytes": object.data.len(),
            "content_type": object.content_type,
            "last_modified": object.last_modified.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        }));
    }

    listing
}

fn apply_container_headers(container: &mut StoredContainer, headers: &HeaderMap) {
    if let Some(read) = header_str(headers, "x-container-read") {
        container.read_acl = Some(read.to_string()).filter(|s| !s.is_empty());
    }
    if let Some(write) = header_str(headers, "x-container-write") {
        container.write_acl = Some(write.to_string()).filter(|s| !s.is_empty());
    }
    for (key, value) in super::prefixed_headers(headers, "x-container-meta-") {
        container.metadata.insert(key, value);
    }
}

fn persisted_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !TRANSIENT_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "X-Auth-Token", "tk").unwrap();
        headers
    }

    async fn put(store: &MemoryTransport, path: &str, data: &'static [u8]) -> StatusCode {
        let mut headers = auth();
        insert_header(&mut headers, "Content-Length", &data.len().to_string()).unwrap();
        store
            .put(
                &format!("{}/{}", store.endpoint(), path),
                headers,
                Body::Bytes(Bytes::from_static(data)),
            )
            .await
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_requests_without_token_are_rejected() {
        let store = MemoryTransport::new();
        let response = store
            .head(store.endpoint(), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_put_requires_length_or_chunked() {
        let store = MemoryTransport::new();
        assert_eq!(put(&store, "c", b"").await, StatusCode::CREATED);

        let response = store
            .put(
                &format!("{}/c/o", store.endpoint()),
                auth(),
                Body::Bytes(Bytes::from_static(b"data")),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::LENGTH_REQUIRED);

        let mut headers = auth();
        insert_header(&mut headers, "Transfer-Encoding", "chunked").unwrap();
        let response = store
            .put(
                &format!("{}/c/o", store.endpoint()),
                headers,
                Body::Bytes(Bytes::from_static(b"data")),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_delimiter_listing_groups_subdirs() {
        let store = MemoryTransport::new();
        put(&store, "c", b"").await;
        put(&store, "c/a/b.txt", b"b").await;
        put(&store, "c/a/c/d.txt", b"d").await;
        put(&store, "c/a/c/e.txt", b"e").await;

        let response = store
            .get(
                &format!("{}/c?format=json&prefix=a%2F&delimiter=%2F", store.endpoint()),
                auth(),
            )
            .await
            .unwrap();
        let listing: Vec<serde_json::Value> = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0]["name"], "a/b.txt");
        assert_eq!(listing[1]["subdir"], "a/c/");
    }

    #[tokio::test]
    async fn test_marker_after_subdir_does_not_repeat_it() {
        let store = MemoryTransport::new();
        put(&store, "c", b"").await;
        put(&store, "c/a/c/d.txt", b"d").await;
        put(&store, "c/a/z.txt", b"z").await;

        let response = store
            .get(
                &format!(
                    "{}/c?format=json&prefix=a%2F&delimiter=%2F&marker=a%2Fc%2F",
                    store.endpoint()
                ),
                auth(),
            )
            .await
            .unwrap();
        let listing: Vec<serde_json::Value> = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0]["name"], "a/z.txt");
    }

    #[tokio::test]
    async fn test_delete_non_empty_container_conflicts() {
        let store = MemoryTransport::new();
        put(&store, "c", b"").await;
        put(&store, "c/o", b"x").await;

        let url = format!("{}/c", store.endpoint());
        let response = store.delete(&url, auth()).await.unwrap();
        assert_eq!(response.status, StatusCode::CONFLICT);
    }
}
