//! Containers
//!
//! A container handle is cheap: it carries a name and the shared context.
//! Byte count, object count, ACL and metadata are loaded by a single HEAD
//! the first time any of them is needed and memoized afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_stream::try_stream;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use super::acl::Acl;
use super::listing::{self, ContainerRecord, ListingEntry, ListingQuery, ListingStream};
use super::object::{Object, RemoteObject};
use super::StoreContext;
use crate::error::{Result, StoreError};
use crate::transport::{header_str, insert_header, prefixed_headers, Body, ByteStream, Response};

/// Prefix of container metadata headers
pub const CONTAINER_META_PREFIX: &str = "x-container-meta-";

/// Entries requested per page by [`Container::list_all`]
const LIST_PAGE_SIZE: usize = 1000;

/// Lazily loaded container attributes
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub bytes: u64,
    pub count: u64,
    pub acl: Acl,
    pub metadata: BTreeMap<String, String>,
}

impl ContainerDetails {
    fn from_headers(headers: &HeaderMap) -> Self {
        let number = |name: &str| {
            header_str(headers, name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        Self {
            bytes: number("x-container-bytes-used"),
            count: number("x-container-object-count"),
            acl: Acl::from_header_map(headers),
            metadata: prefixed_headers(headers, CONTAINER_META_PREFIX),
        }
    }
}

/// A named collection of objects
#[derive(Debug, Clone)]
pub struct Container {
    name: String,
    context: Option<Arc<StoreContext>>,
    bytes: Option<u64>,
    count: Option<u64>,
    details: OnceCell<ContainerDetails>,
}

impl Container {
    /// A container not bound to any account; every remote operation fails
    /// with a configuration error
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: None,
            bytes: None,
            count: None,
            details: OnceCell::new(),
        }
    }

    pub(crate) fn bound(name: impl Into<String>, context: Arc<StoreContext>) -> Self {
        Self {
            context: Some(context),
            ..Self::new(name)
        }
    }

    pub(crate) fn from_record(record: ContainerRecord, context: Arc<StoreContext>) -> Self {
        Self {
            bytes: Some(record.bytes),
            count: Some(record.count),
            ..Self::bound(record.name, context)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> Result<&Arc<StoreContext>> {
        self.context.as_ref().ok_or_else(|| {
            StoreError::Configuration(format!(
                "Container {} has no storage endpoint or token",
                self.name
            ))
        })
    }

    fn url(&self) -> Result<String> {
        Ok(self.context()?.container_url(&self.name))
    }

    /// Load the details if not loaded yet
    pub(crate) async fn load(&self) -> Result<&ContainerDetails> {
        self.details
            .get_or_try_init(|| async {
                let context = self.context()?;
                trace!("load container details: {}", self.name);
                let response = context
                    .transport()
                    .head(&self.url()?, context.auth_headers().await?)
                    .await?
                    .ensure(&[StatusCode::OK, StatusCode::NO_CONTENT])?;
                Ok(ContainerDetails::from_headers(&response.headers))
            })
            .await
    }

    /// Bytes stored in the container
    pub async fn bytes(&self) -> Result<u64> {
        match self.bytes {
            Some(bytes) => Ok(bytes),
            None => Ok(self.load().await?.bytes),
        }
    }

    /// Number of objects in the container
    pub async fn count(&self) -> Result<u64> {
        match self.count {
            Some(count) => Ok(count),
            None => Ok(self.load().await?.count),
        }
    }

    pub async fn acl(&self) -> Result<&Acl> {
        Ok(&self.load().await?.acl)
    }

    pub async fn metadata(&self) -> Result<&BTreeMap<String, String>> {
        Ok(&self.load().await?.metadata)
    }

    /// Merge `metadata` into the container's metadata
    pub async fn update_metadata(&mut self, metadata: &BTreeMap<String, String>) -> Result<()> {
        let context = self.context()?;
        let mut headers = context.auth_headers().await?;
        for (key, value) in metadata {
            insert_header(
                &mut headers,
                &format!("{}{}", CONTAINER_META_PREFIX, key),
                value,
            )?;
        }

        context
            .transport()
            .post(&self.url()?, headers, Body::Empty)
            .await?
            .ensure(&[StatusCode::NO_CONTENT, StatusCode::ACCEPTED])?;

        debug!("update_metadata: {} ({} keys)", self.name, metadata.len());
        self.details = OnceCell::new();
        Ok(())
    }

    /// Upload an object with its buffered content.
    ///
    /// The `ETag` header carries the content checksum so the service
    /// rejects corrupted uploads.
    pub async fn save(&self, object: &Object) -> Result<()> {
        let context = self.context()?;
        let mut headers = context.auth_headers().await?;
        headers.extend(object.attribute_headers()?);

        let content = object.content().cloned().unwrap_or_default();
        insert_header(&mut headers, "etag", &super::md5_hex(&content))?;

        let body = if object.chunked() {
            insert_header(&mut headers, "transfer-encoding", "chunked")?;
            let stream: ByteStream =
                Box::pin(futures::stream::iter([Ok::<_, std::io::Error>(content)]));
            Body::Stream {
                stream,
                length: None,
            }
        } else {
            insert_header(&mut headers, "content-length", &content.len().to_string())?;
            Body::Bytes(content)
        };

        self.put_object(context, object.name(), headers, body).await
    }

    /// Upload an object whose content comes from a stream.
    ///
    /// Without a known `length` the object must opt into chunked transfer.
    /// No checksum is sent since the content is never buffered.
    pub async fn save_stream(
        &self,
        object: &Object,
        stream: ByteStream,
        length: Option<u64>,
    ) -> Result<()> {
        let context = self.context()?;
        let mut headers = context.auth_headers().await?;
        headers.extend(object.attribute_headers()?);

        let length = if object.chunked() {
            insert_header(&mut headers, "transfer-encoding", "chunked")?;
            None
        } else {
            let length = length.ok_or_else(|| {
                StoreError::InvalidArgument(format!(
                    "Stream for {} has no length and chunked transfer is off",
                    object.name()
                ))
            })?;
            insert_header(&mut headers, "content-length", &length.to_string())?;
            Some(length)
        };

        self.put_object(context, object.name(), headers, Body::Stream { stream, length })
            .await
    }

    async fn put_object(
        &self,
        context: &Arc<StoreContext>,
        name: &str,
        headers: HeaderMap,
        body: Body,
    ) -> Result<()> {
        context
            .transport()
            .put(&context.object_url(&self.name, name), headers, body)
            .await?
            .ensure(&[StatusCode::CREATED])?;
        debug!("save: {}/{}", self.name, name);
        Ok(())
    }

    /// Server-side copy of `object` to `new_name`, in `target_container` or
    /// this container
    pub async fn copy(
        &self,
        object: &Object,
        new_name: &str,
        target_container: Option<&str>,
    ) -> Result<()> {
        if new_name.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "Empty target name when copying {}",
                object.name()
            )));
        }

        let context = self.context()?;
        let target = target_container.unwrap_or(&self.name);
        let mut headers = context.auth_headers().await?;
        insert_header(
            &mut headers,
            "x-copy-from",
            &context.copy_source(&self.name, object.name()),
        )?;
        insert_header(&mut headers, "content-length", "0")?;
        insert_header(&mut headers, "content-type", object.content_type())?;

        context
            .transport()
            .put(&context.object_url(target, new_name), headers, Body::Empty)
            .await?
            .ensure(&[StatusCode::CREATED])?;

        debug!(
            "copy: {}/{} -> {}/{}",
            self.name,
            object.name(),
            target,
            new_name
        );
        Ok(())
    }

    /// Delete an object; false if it did not exist
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let context = self.context()?;
        let response = context
            .transport()
            .delete(&context.object_url(&self.name, name), context.auth_headers().await?)
            .await?;

        match response.status {
            StatusCode::NO_CONTENT => {
                debug!("delete: {}/{}", self.name, name);
                Ok(true)
            }
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(response.into_error()),
        }
    }

    /// Fetch an object with its content, verified against the etag
    pub async fn object(&self, name: &str) -> Result<RemoteObject> {
        let context = self.context()?;
        let response = context
            .transport()
            .get(&context.object_url(&self.name, name), context.auth_headers().await?)
            .await?
            .ensure(&[StatusCode::OK])?;

        let body = response.body.clone();
        let remote = self.remote_object(context, name, &response, Some(body));
        remote.verify_body(&response.body)?;
        Ok(remote)
    }

    /// Fetch an object's attributes only; content loads on first access
    pub async fn proxy_object(&self, name: &str) -> Result<RemoteObject> {
        let context = self.context()?;
        let response = context
            .transport()
            .head(&context.object_url(&self.name, name), context.auth_headers().await?)
            .await?
            .ensure(&[StatusCode::OK])?;

        Ok(self.remote_object(context, name, &response, None))
    }

    fn remote_object(
        &self,
        context: &Arc<StoreContext>,
        name: &str,
        response: &Response,
        body: Option<bytes::Bytes>,
    ) -> RemoteObject {
        RemoteObject::from_response(&self.name, name, Arc::clone(context), response, body)
    }

    /// One page of objects in name order
    pub async fn objects(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
    ) -> Result<Vec<ListingEntry>> {
        self.list(ListingQuery {
            limit,
            marker: marker.map(str::to_string),
            ..Default::default()
        })
        .await
    }

    /// One page of objects whose names start with `prefix`; with a
    /// delimiter, deeper names collapse into [`ListingEntry::Subdir`]
    pub async fn objects_with_prefix(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        limit: Option<usize>,
        marker: Option<&str>,
    ) -> Result<Vec<ListingEntry>> {
        self.list(ListingQuery {
            prefix: Some(prefix.to_string()),
            delimiter,
            limit,
            marker: marker.map(str::to_string),
            ..Default::default()
        })
        .await
    }

    /// One page of the immediate children of the pseudo-directory `path`
    pub async fn objects_by_path(
        &self,
        path: &str,
        delimiter: Option<char>,
        limit: Option<usize>,
        marker: Option<&str>,
    ) -> Result<Vec<ListingEntry>> {
        self.list(ListingQuery {
            path: Some(path.to_string()),
            delimiter,
            limit,
            marker: marker.map(str::to_string),
            ..Default::default()
        })
        .await
    }

    /// Perform one listing request
    pub async fn list(&self, query: ListingQuery) -> Result<Vec<ListingEntry>> {
        let context = self.context()?;
        list_page(context, &self.name, &query).await
    }

    /// Every entry under `prefix`, paging with the last name as marker
    /// until a short page
    pub fn list_all(&self, prefix: &str, delimiter: Option<char>) -> Result<ListingStream> {
        let context = Arc::clone(self.context()?);
        let name = self.name.clone();
        let prefix = prefix.to_string();

        Ok(Box::pin(try_stream! {
            let mut marker: Option<String> = None;

            loop {
                let query = ListingQuery {
                    prefix: Some(prefix.clone()),
                    delimiter,
                    limit: Some(LIST_PAGE_SIZE),
                    marker: marker.take(),
                    ..Default::default()
                };
                let page = list_page(&context, &name, &query).await?;
                let exhausted = page.len() < LIST_PAGE_SIZE;
                marker = page.last().map(|entry| entry.name().to_string());

                for entry in page {
                    yield entry;
                }

                if exhausted || marker.is_none() {
                    break;
                }
            }
        }))
    }
}

async fn list_page(
    context: &Arc<StoreContext>,
    container: &str,
    query: &ListingQuery,
) -> Result<Vec<ListingEntry>> {
    let url = format!(
        "{}?{}",
        context.container_url(container),
        query.to_query_string()
    );
    trace!("list: {}", url);

    let response = context
        .transport()
        .get(&url, context.auth_headers().await?)
        .await?
        .ensure(&[StatusCode::OK, StatusCode::NO_CONTENT])?;

    let delimiter = query
        .delimiter
        .unwrap_or(if query.path.is_some() { '/' } else { '\0' });
    listing::parse_listing(&response.body, container, context, delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ObjectStorage, StoreContext};
    use crate::transport::MemoryTransport;
    use futures::TryStreamExt;

    async fn container(transport: &Arc<MemoryTransport>) -> Container {
        let storage = ObjectStorage::new(StoreContext::new(
            transport.endpoint().to_string(),
            "tk",
            transport.clone(),
        ));
        storage
            .create_container("c", None, &BTreeMap::new())
            .await
            .unwrap();
        storage.container_handle("c")
    }

    #[tokio::test]
    async fn test_unbound_container_is_configuration_error() {
        let container = Container::new("c");
        assert!(matches!(
            container.bytes().await,
            Err(StoreError::Configuration(_))
        ));
        assert!(matches!(
            container.delete("x").await,
            Err(StoreError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_save_fetch_delete() {
        let transport = Arc::new(MemoryTransport::new());
        let container = container(&transport).await;

        let object = Object::with_content("foo.txt", "hello", "text/plain");
        container.save(&object).await.unwrap();

        let mut remote = container.object("foo.txt").await.unwrap();
        assert_eq!(remote.content().await.unwrap().as_ref(), b"hello");
        assert_eq!(remote.content_type(), "text/plain");
        assert_eq!(remote.etag(), crate::store::md5_hex(b"hello"));
        assert!(!remote.is_dirty());

        assert!(container.delete("foo.txt").await.unwrap());
        assert!(!container.delete("foo.txt").await.unwrap());
        assert!(matches!(
            container.object("foo.txt").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_proxy_object_fetches_lazily() {
        let transport = Arc::new(MemoryTransport::new());
        let container = container(&transport).await;
        container
            .save(&Object::with_content("a", "abc", "text/plain"))
            .await
            .unwrap();

        let mut proxy = container.proxy_object("a").await.unwrap();
        assert!(!proxy.has_local_content());
        assert_eq!(proxy.content_length(), 3);

        assert_eq!(proxy.content().await.unwrap().as_ref(), b"abc");
        assert!(proxy.has_local_content());
    }

    #[tokio::test]
    async fn test_corrupted_content_fails_verification() {
        let transport = Arc::new(MemoryTransport::new());
        let container = container(&transport).await;
        container
            .save(&Object::with_content("a", "abc", "text/plain"))
            .await
            .unwrap();
        assert!(transport.corrupt("c", "a", "xyz"));

        assert!(matches!(
            container.object("a").await,
            Err(StoreError::ContentVerification { .. })
        ));

        let mut proxy = container.proxy_object("a").await.unwrap();
        assert!(proxy.content().await.is_err());
        proxy.set_content_verification(false);
        assert_eq!(proxy.content().await.unwrap().as_ref(), b"xyz");
    }

    #[tokio::test]
    async fn test_save_stream_requires_length_or_chunked() {
        let transport = Arc::new(MemoryTransport::new());
        let container = container(&transport).await;
        let stream = || -> ByteStream {
            Box::pin(futures::stream::iter([
                Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"he")),
                Ok(bytes::Bytes::from_static(b"llo")),
            ]))
        };

        let mut object = Object::new("s.txt");
        assert!(matches!(
            container.save_stream(&object, stream(), None).await,
            Err(StoreError::InvalidArgument(_))
        ));

        container
            .save_stream(&object, stream(), Some(5))
            .await
            .unwrap();
        assert_eq!(transport.object_data("c", "s.txt").unwrap().as_ref(), b"hello");

        object.set_chunked(true);
        container.save_stream(&object, stream(), None).await.unwrap();
        container
            .save(&Object::with_content("t.txt", "x", "text/plain"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_copy_across_containers() {
        let transport = Arc::new(MemoryTransport::new());
        let source = container(&transport).await;
        let storage = ObjectStorage::new(StoreContext::new(
            transport.endpoint().to_string(),
            "tk",
            transport.clone(),
        ));
        storage
            .create_container("backup", None, &BTreeMap::new())
            .await
            .unwrap();

        let object = Object::with_content("a/b.txt", "data", "text/plain");
        source.save(&object).await.unwrap();
        source.copy(&object, "copy.txt", None).await.unwrap();
        source.copy(&object, "b.txt", Some("backup")).await.unwrap();

        assert_eq!(transport.object_data("c", "copy.txt").unwrap().as_ref(), b"data");
        assert_eq!(
            transport.object_data("backup", "b.txt").unwrap().as_ref(),
            b"data"
        );
        assert!(matches!(
            source.copy(&object, "", None).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            source.copy(&object, "x", Some("missing")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prefix_listing_partitions() {
        let transport = Arc::new(MemoryTransport::new());
        let container = container(&transport).await;
        for name in ["a/b.txt", "a/c/d.txt", "z.txt"] {
            container
                .save(&Object::with_content(name, "x", "text/plain"))
                .await
                .unwrap();
        }

        let entries = container
            .objects_with_prefix("a/", Some('/'), None, None)
            .await
            .unwrap();
        let names: Vec<(&str, bool)> = entries.iter().map(|e| (e.name(), e.is_subdir())).collect();
        assert_eq!(names, vec![("a/b.txt", false), ("a/c/", true)]);

        let by_path = container.objects_by_path("a", None, None, None).await.unwrap();
        assert_eq!(by_path.len(), 2);

        let page = container.objects(Some(2), None).await.unwrap();
        assert_eq!(page.len(), 2);
        let rest = container.objects(None, Some(page[1].name())).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name(), "z.txt");
    }

    #[tokio::test]
    async fn test_list_all_pages_past_page_size() {
        let transport = Arc::new(MemoryTransport::new());
        let container = container(&transport).await;
        for i in 0..(LIST_PAGE_SIZE + 5) {
            container
                .save(&Object::with_content(format!("f{:05}", i), "", "text/plain"))
                .await
                .unwrap();
        }

        let all: Vec<ListingEntry> = container
            .list_all("", None)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), LIST_PAGE_SIZE + 5);
        assert_eq!(container.count().await.unwrap(), (LIST_PAGE_SIZE + 5) as u64);
    }

    #[tokio::test]
    async fn test_update_metadata_reloads_details() {
        let transport = Arc::new(MemoryTransport::new());
        let mut container = container(&transport).await;
        assert!(container.metadata().await.unwrap().is_empty());

        let mut metadata = BTreeMap::new();
        metadata.insert("team".to_string(), "infra".to_string());
        container.update_metadata(&metadata).await.unwrap();

        assert_eq!(
            container.metadata().await.unwrap().get("team"),
            Some(&"infra".to_string())
        );
    }
}
