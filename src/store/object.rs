//! Objects: local values and their remote counterparts
//!
//! An [`Object`] is a purely local value until a container saves it. A
//! [`RemoteObject`] is what the store hands back: the same attributes plus
//! the etag, last-modified time and remote length. Its body is only present
//! when it was fetched or set locally; every accessor that needs the body
//! fetches it otherwise.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use md5::{Digest, Md5};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::{debug, trace, warn};

use super::listing::ObjectRecord;
use super::StoreContext;
use crate::error::{Result, StoreError};
use crate::transport::{header_str, insert_header, prefixed_headers, Response};

/// Content type used when none is given
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Largest object a single upload may create (5 GiB + 2 bytes)
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024 + 2;

/// Prefix of object metadata headers
pub const OBJECT_META_PREFIX: &str = "x-object-meta-";

/// Object headers that are client-settable and survive a re-upload; every
/// other `x-` response header is server-managed and must not be sent back
const PRESERVED_HEADERS: &[&str] = &["x-delete-at", "x-object-manifest"];

/// Hex MD5 digest, the checksum format the store uses for etags
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// A named blob plus its attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    name: String,
    content_type: String,
    content: Option<Bytes>,
    metadata: BTreeMap<String, String>,
    content_encoding: Option<String>,
    content_disposition: Option<String>,
    additional_headers: BTreeMap<String, String>,
    chunked: bool,
}

impl Object {
    /// An object with no content
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            content: None,
            metadata: BTreeMap::new(),
            content_encoding: None,
            content_disposition: None,
            additional_headers: BTreeMap::new(),
            chunked: false,
        }
    }

    /// An object with content and a content type
    pub fn with_content(
        name: impl Into<String>,
        content: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Self {
        let mut object = Self::new(name);
        object.content = Some(content.into());
        object.content_type = content_type.into();
        object
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    /// Local content, if any
    pub fn content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        self.content = Some(content.into());
    }

    /// Remove and return the local content
    pub fn take_content(&mut self) -> Option<Bytes> {
        self.content.take()
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    /// Length of the local content (0 without content)
    pub fn content_length(&self) -> u64 {
        self.content.as_ref().map_or(0, |c| c.len() as u64)
    }

    /// Checksum of the local content
    pub fn etag(&self) -> Option<String> {
        self.content.as_deref().map(md5_hex)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, metadata: BTreeMap<String, String>) {
        self.metadata = metadata;
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn set_content_encoding(&mut self, encoding: Option<String>) {
        self.content_encoding = encoding;
    }

    pub fn content_disposition(&self) -> Option<&str> {
        self.content_disposition.as_deref()
    }

    pub fn set_content_disposition(&mut self, disposition: Option<String>) {
        self.content_disposition = disposition;
    }

    /// Extra headers sent verbatim on save (e.g. `X-Delete-After`)
    pub fn additional_headers(&self) -> &BTreeMap<String, String> {
        &self.additional_headers
    }

    pub fn set_additional_headers(&mut self, headers: BTreeMap<String, String>) {
        self.additional_headers = headers;
    }

    /// Whether saving a stream uses chunked transfer instead of `Content-Length`
    pub fn chunked(&self) -> bool {
        self.chunked
    }

    pub fn set_chunked(&mut self, chunked: bool) {
        self.chunked = chunked;
    }

    /// Attribute headers sent when the object is saved
    pub(crate) fn attribute_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "content-type", &self.content_type)?;
        for (key, value) in &self.metadata {
            insert_header(&mut headers, &format!("{}{}", OBJECT_META_PREFIX, key), value)?;
        }
        if let Some(encoding) = &self.content_encoding {
            insert_header(&mut headers, "content-encoding", encoding)?;
        }
        if let Some(disposition) = &self.content_disposition {
            insert_header(&mut headers, "content-disposition", disposition)?;
        }
        for (key, value) in &self.additional_headers {
            insert_header(&mut headers, key, value)?;
        }
        Ok(headers)
    }

    /// Overwrite attributes from object response headers
    fn apply_headers(&mut self, headers: &HeaderMap) {
        self.content_type = header_str(headers, "content-type")
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        self.metadata = prefixed_headers(headers, OBJECT_META_PREFIX);
        self.content_encoding = header_str(headers, "content-encoding").map(str::to_string);
        self.content_disposition = header_str(headers, "content-disposition").map(str::to_string);
        self.additional_headers = headers
            .iter()
            .filter(|(name, _)| PRESERVED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
    }
}

/// An object as reported by the store
#[derive(Debug, Clone)]
pub struct RemoteObject {
    object: Object,
    container: String,
    context: Arc<StoreContext>,
    etag: String,
    last_modified: Option<DateTime<Utc>>,
    remote_length: u64,
    caching: bool,
    verify: bool,
}

impl RemoteObject {
    /// Build from a GET or HEAD response; `body` is `Some` for GET
    pub(crate) fn from_response(
        container: &str,
        name: &str,
        context: Arc<StoreContext>,
        response: &Response,
        body: Option<Bytes>,
    ) -> Self {
        let verify = context.verify_content();
        let mut remote = Self {
            object: Object::new(name),
            container: container.to_string(),
            context,
            etag: String::new(),
            last_modified: None,
            remote_length: 0,
            caching: false,
            verify,
        };
        remote.apply_response(response);
        remote.object.content = body;
        remote
    }

    /// Build from a listing record; the body is never present
    pub(crate) fn from_record(
        container: &str,
        record: ObjectRecord,
        context: Arc<StoreContext>,
    ) -> Self {
        let verify = context.verify_content();
        let mut object = Object::new(record.name);
        if !record.content_type.is_empty() {
            object.content_type = record.content_type;
        }
        Self {
            object,
            container: container.to_string(),
            context,
            etag: record.hash,
            last_modified: record.last_modified.as_deref().and_then(parse_listing_time),
            remote_length: record.bytes,
            caching: false,
            verify,
        }
    }

    fn apply_response(&mut self, response: &Response) {
        self.object.apply_headers(&response.headers);
        self.etag = response
            .header("etag")
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();
        self.last_modified = response.header("last-modified").and_then(parse_http_time);
        self.remote_length = response
            .header("content-length")
            .and_then(|l| l.parse().ok())
            .unwrap_or(0);
    }

    pub fn name(&self) -> &str {
        self.object.name()
    }

    /// Name of the container holding the object
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Checksum reported by the store
    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// Length of the local content when present, otherwise the remote length
    pub fn content_length(&self) -> u64 {
        match &self.object.content {
            Some(content) => content.len() as u64,
            None => self.remote_length,
        }
    }

    /// Length as last reported by the store
    pub fn remote_length(&self) -> u64 {
        self.remote_length
    }

    pub fn content_type(&self) -> &str {
        self.object.content_type()
    }

    /// Whether local content is present
    pub fn has_local_content(&self) -> bool {
        self.object.has_content()
    }

    /// The object's attributes and local content
    pub fn object(&self) -> &Object {
        &self.object
    }

    /// Mutable access to attributes and local content
    pub fn object_mut(&mut self) -> &mut Object {
        &mut self.object
    }

    pub fn into_object(self) -> Object {
        self.object
    }

    /// Replace the local content
    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        self.object.set_content(content);
    }

    /// Keep bodies fetched by [`RemoteObject::stream`] as local content
    pub fn set_caching(&mut self, caching: bool) {
        self.caching = caching;
    }

    pub fn caching(&self) -> bool {
        self.caching
    }

    /// Check fetched bodies against the etag
    pub fn set_content_verification(&mut self, verify: bool) {
        self.verify = verify;
    }

    pub fn content_verification(&self) -> bool {
        self.verify
    }

    /// True iff local content is present and its checksum differs from the
    /// remote etag.
    pub fn is_dirty(&self) -> bool {
        match self.object.content.as_deref() {
            Some(content) => !md5_hex(content).eq_ignore_ascii_case(&self.etag),
            None => false,
        }
    }

    /// The content, fetching and verifying it if not present locally
    pub async fn content(&mut self) -> Result<Bytes> {
        if let Some(content) = &self.object.content {
            return Ok(content.clone());
        }

        let body = self.fetch_body().await?;
        self.object.content = Some(body.clone());
        Ok(body)
    }

    /// Discard local content and reload everything from the store.
    ///
    /// Local changes are lost.
    pub async fn refresh(&mut self, fetch_content: bool) -> Result<()> {
        debug!(
            "refresh: {}/{} fetch_content={}",
            self.container,
            self.name(),
            fetch_content
        );

        let response = self.request(fetch_content).await?;
        self.apply_response(&response);
        self.object.content = None;

        if fetch_content {
            self.verify_body(&response.body)?;
            self.object.content = Some(response.body);
        }
        Ok(())
    }

    /// A reader over the content, positioned at the start.
    ///
    /// Local content is used unless `refresh` is set. Otherwise the body is
    /// fetched on every call; with caching enabled the fetched body is kept
    /// as local content.
    pub async fn stream(&mut self, refresh: bool) -> Result<Cursor<Bytes>> {
        if !refresh {
            if let Some(content) = &self.object.content {
                return Ok(Cursor::new(content.clone()));
            }
        }

        let body = self.fetch_body().await?;
        if self.caching {
            self.object.content = Some(body.clone());
        }
        Ok(Cursor::new(body))
    }

    async fn fetch_body(&self) -> Result<Bytes> {
        let response = self.request(true).await?;
        self.verify_body(&response.body)?;
        Ok(response.body)
    }

    async fn request(&self, with_body: bool) -> Result<Response> {
        let url = self.context.object_url(&self.container, self.name());
        let headers = self.context.auth_headers().await?;
        trace!("fetch: {} with_body={}", url, with_body);

        let transport = self.context.transport();
        let response = if with_body {
            transport.get(&url, headers).await?
        } else {
            transport.head(&url, headers).await?
        };
        response.ensure(&[StatusCode::OK])
    }

    pub(crate) fn verify_body(&self, body: &[u8]) -> Result<()> {
        if self.etag.is_empty() {
            return Ok(());
        }

        let actual = md5_hex(body);
        if actual.eq_ignore_ascii_case(&self.etag) {
            return Ok(());
        }

        if !self.verify {
            warn!(
                "Ignoring checksum mismatch for {}/{}",
                self.container,
                self.name()
            );
            return Ok(());
        }

        Err(StoreError::ContentVerification {
            name: format!("{}/{}", self.container, self.name()),
            expected: self.etag.clone(),
            actual,
        })
    }
}

impl AsRef<Object> for RemoteObject {
    fn as_ref(&self) -> &Object {
        &self.object
    }
}

/// Parse an HTTP-date `Last-Modified` header
fn parse_http_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse the `last_modified` field of a listing record
fn parse_listing_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use reqwest::Method;

    fn context() -> Arc<StoreContext> {
        let transport = Arc::new(MemoryTransport::new());
        Arc::new(StoreContext::new(
            transport.endpoint().to_string(),
            "tk",
            transport,
        ))
    }

    fn response(headers: &[(&str, &str)]) -> Response {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            insert_header(&mut map, k, v).unwrap();
        }
        Response {
            method: Method::HEAD,
            url: "memory://objstore/c/o".to_string(),
            status: StatusCode::OK,
            headers: map,
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b"hi"), "49f68a5c8493ec2c0bf489821c21fc3b");
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_attribute_headers() {
        let mut object = Object::with_content("a/b.txt", "hello", "text/plain");
        let mut meta = BTreeMap::new();
        meta.insert("color".to_string(), "blue".to_string());
        object.set_metadata(meta);
        object.set_content_disposition(Some("attachment".to_string()));

        let headers = object.attribute_headers().unwrap();
        assert_eq!(header_str(&headers, "content-type"), Some("text/plain"));
        assert_eq!(header_str(&headers, "x-object-meta-color"), Some("blue"));
        assert_eq!(
            header_str(&headers, "content-disposition"),
            Some("attachment")
        );
        assert_eq!(object.content_length(), 5);
    }

    #[test]
    fn test_response_headers_populate_remote_object() {
        let response = response(&[
            ("etag", "\"49f68a5c8493ec2c0bf489821c21fc3b\""),
            ("content-length", "2"),
            ("content-type", "text/plain"),
            ("last-modified", "Tue, 15 Nov 1994 08:12:31 GMT"),
            ("x-object-meta-owner", "alice"),
            ("x-delete-at", "1700000000"),
            ("x-trans-id", "tx123"),
            ("x-static-large-object", "True"),
            ("x-backend-timestamp", "1700000000.00000"),
        ]);
        let remote = RemoteObject::from_response("c", "o", context(), &response, None);

        assert_eq!(remote.etag(), "49f68a5c8493ec2c0bf489821c21fc3b");
        assert_eq!(remote.content_length(), 2);
        assert_eq!(remote.content_type(), "text/plain");
        assert_eq!(
            remote.object().metadata().get("owner").map(String::as_str),
            Some("alice")
        );
        assert!(remote
            .object()
            .additional_headers()
            .contains_key("x-delete-at"));
        assert_eq!(remote.object().additional_headers().len(), 1);
        assert!(!remote
            .object()
            .additional_headers()
            .contains_key("x-static-large-object"));

        let resent = remote.object().attribute_headers().unwrap();
        assert_eq!(header_str(&resent, "x-delete-at"), Some("1700000000"));
        assert!(resent.get("x-backend-timestamp").is_none());
        assert!(resent.get("x-trans-id").is_none());
        assert_eq!(
            remote.last_modified().map(|t| t.timestamp()),
            Some(784887151)
        );
    }

    #[test]
    fn test_dirty_tracking() {
        let response = response(&[("etag", "49f68a5c8493ec2c0bf489821c21fc3b")]);
        let mut remote = RemoteObject::from_response("c", "o", context(), &response, None);
        assert!(!remote.is_dirty());

        remote.set_content("hi");
        assert!(!remote.is_dirty());
        assert_eq!(remote.is_dirty(), remote.is_dirty());

        remote.set_content("changed");
        assert!(remote.is_dirty());
        assert!(remote.is_dirty());
    }

    #[test]
    fn test_verify_body() {
        let response = response(&[("etag", "49f68a5c8493ec2c0bf489821c21fc3b")]);
        let mut remote = RemoteObject::from_response("c", "o", context(), &response, None);

        assert!(remote.verify_body(b"hi").is_ok());
        assert!(matches!(
            remote.verify_body(b"tampered"),
            Err(StoreError::ContentVerification { .. })
        ));

        remote.set_content_verification(false);
        assert!(remote.verify_body(b"tampered").is_ok());
    }

    #[test]
    fn test_parse_listing_time() {
        let t = parse_listing_time("2024-03-01T12:30:45.123456").unwrap();
        assert_eq!(t.timestamp(), 1709296245);
        assert!(parse_listing_time("yesterday").is_none());
    }
}
