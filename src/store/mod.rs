//! Object-store resource model
//!
//! [`ObjectStorage`] is the account: it lists, creates and deletes
//! containers. A [`Container`] saves, copies, fetches and lists objects.
//! All of them share one [`StoreContext`] carrying the storage endpoint, the
//! auth token and the transport.

pub mod acl;
pub mod container;
pub mod listing;
pub mod object;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, CatalogCache};
use crate::error::{Result, StoreError};
use crate::transport::{
    header_str, insert_header, Body, Request, Response, Transport, AUTH_TOKEN_HEADER,
};

pub use acl::{Acl, Permission};
pub use container::{Container, ContainerDetails, CONTAINER_META_PREFIX};
pub use listing::{ListingEntry, ListingQuery, ListingStream, Subdir};
pub use object::{md5_hex, Object, RemoteObject, DEFAULT_CONTENT_TYPE, MAX_OBJECT_SIZE};

/// Characters escaped in query values (`/` included)
pub(crate) const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Characters escaped in a URL path segment; `/` is kept so object names
/// keep their pseudo-directory structure
const PATH: &AsciiSet = &QUERY_VALUE.remove(b'/');

/// Where the token sent on storage requests comes from
enum TokenSource {
    /// Used as is until the store rejects it
    Fixed(String),
    /// Resolved through the catalog cache on every request, so it is
    /// renewed shortly before expiry
    Renewable {
        provider: Arc<dyn AuthProvider>,
        cache: Arc<CatalogCache>,
    },
}

impl TokenSource {
    async fn token(&self) -> Result<String> {
        match self {
            TokenSource::Fixed(token) => Ok(token.clone()),
            TokenSource::Renewable { provider, cache } => {
                Ok(cache.resolve(provider.as_ref()).await?.token)
            }
        }
    }

    /// Drop a token the store refused; true when a new one can be obtained
    fn reject(&self) -> bool {
        match self {
            TokenSource::Fixed(_) => false,
            TokenSource::Renewable { cache, .. } => {
                cache.invalidate();
                true
            }
        }
    }
}

/// Transport that answers a 401 by renewing the token and sending the
/// request once more
struct RenewingTransport {
    inner: Arc<dyn Transport>,
    tokens: Arc<TokenSource>,
}

#[async_trait]
impl Transport for RenewingTransport {
    async fn execute(&self, request: Request) -> Result<Response> {
        let replay = request.try_clone();
        let response = self.inner.execute(request).await?;
        if response.status != StatusCode::UNAUTHORIZED || !self.tokens.reject() {
            return Ok(response);
        }

        let mut replay = match replay {
            Some(replay) => replay,
            None => {
                warn!(
                    "Token rejected for streamed {} {}; not retried",
                    response.method, response.url
                );
                return Ok(response);
            }
        };

        let token = self.tokens.token().await?;
        insert_header(&mut replay.headers, AUTH_TOKEN_HEADER, &token)?;
        debug!("Retrying {} {} with a renewed token", replay.method, replay.url);
        self.inner.execute(replay).await
    }
}

/// Endpoint, token and transport shared by every resource of an account
#[derive(Clone)]
pub struct StoreContext {
    endpoint: String,
    tokens: Arc<TokenSource>,
    transport: Arc<dyn Transport>,
    verify_content: bool,
}

impl StoreContext {
    /// Context using a fixed token
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens: Arc::new(TokenSource::Fixed(token.into())),
            transport,
            verify_content: true,
        }
    }

    /// Context whose token comes from `provider` through `cache`, renewed
    /// before it expires and after the store rejects it
    pub fn renewable(
        endpoint: impl Into<String>,
        provider: Arc<dyn AuthProvider>,
        cache: Arc<CatalogCache>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let tokens = Arc::new(TokenSource::Renewable { provider, cache });
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens: Arc::clone(&tokens),
            transport: Arc::new(RenewingTransport {
                inner: transport,
                tokens,
            }),
            verify_content: true,
        }
    }

    /// Default content verification for objects fetched through this context
    pub fn with_content_verification(mut self, verify: bool) -> Self {
        self.verify_content = verify;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn verify_content(&self) -> bool {
        self.verify_content
    }

    pub(crate) fn container_url(&self, container: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint,
            utf8_percent_encode(container, QUERY_VALUE)
        )
    }

    pub(crate) fn object_url(&self, container: &str, name: &str) -> String {
        format!(
            "{}/{}",
            self.container_url(container),
            utf8_percent_encode(name, PATH)
        )
    }

    /// Value of `X-Copy-From` naming an object
    pub(crate) fn copy_source(&self, container: &str, name: &str) -> String {
        format!(
            "/{}/{}",
            utf8_percent_encode(container, QUERY_VALUE),
            utf8_percent_encode(name, PATH)
        )
    }

    /// Headers carrying a current token
    pub(crate) async fn auth_headers(&self) -> Result<HeaderMap> {
        if self.endpoint.is_empty() {
            return Err(StoreError::Configuration(
                "Missing storage endpoint".to_string(),
            ));
        }
        let token = self.tokens.token().await?;
        if token.is_empty() {
            return Err(StoreError::Configuration("Missing auth token".to_string()));
        }
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, AUTH_TOKEN_HEADER, &token)?;
        Ok(headers)
    }
}

impl fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreContext")
            .field("endpoint", &self.endpoint)
            .field("verify_content", &self.verify_content)
            .finish_non_exhaustive()
    }
}

/// Account-wide usage totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub containers: u64,
    pub objects: u64,
    pub bytes: u64,
}

/// The account: entry point to containers
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    context: Arc<StoreContext>,
}

impl ObjectStorage {
    pub fn new(context: StoreContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Resolve credentials through the catalog cache and bind to the
    /// object-store endpoint of `region`.
    ///
    /// Later requests keep resolving the token through `cache`, so an
    /// expiring or revoked token is replaced without rebinding.
    pub async fn authenticate(
        provider: Arc<dyn AuthProvider>,
        cache: Arc<CatalogCache>,
        region: Option<&str>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let auth = cache.resolve(provider.as_ref()).await?;
        let endpoint = auth.storage_endpoint(region)?;
        info!("Using storage endpoint {}", endpoint);
        Ok(Self::new(StoreContext::renewable(
            endpoint, provider, cache, transport,
        )))
    }

    pub fn context(&self) -> &Arc<StoreContext> {
        &self.context
    }

    /// Same account, with a different content-verification default
    pub fn with_content_verification(&self, verify: bool) -> Self {
        Self::new(
            self.context
                .as_ref()
                .clone()
                .with_content_verification(verify),
        )
    }

    /// Account totals from the account HEAD
    pub async fn account_info(&self) -> Result<AccountInfo> {
        let response = self
            .context
            .transport()
            .head(self.context.endpoint(), self.context.auth_headers().await?)
            .await?
            .ensure(&[StatusCode::OK, StatusCode::NO_CONTENT])?;

        let count = |name: &str| {
            header_str(&response.headers, name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        Ok(AccountInfo {
            containers: count("x-account-container-count"),
            objects: count("x-account-object-count"),
            bytes: count("x-account-bytes-used"),
        })
    }

    /// One page of containers, in name order
    pub async fn containers(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
    ) -> Result<Vec<Container>> {
        let query = ListingQuery {
            limit,
            marker: marker.map(str::to_string),
            ..Default::default()
        };
        let url = format!("{}?{}", self.context.endpoint(), query.to_query_string());
        let response = self
            .context
            .transport()
            .get(&url, self.context.auth_headers().await?)
            .await?
            .ensure(&[StatusCode::OK, StatusCode::NO_CONTENT])?;

        Ok(listing::parse_container_listing(&response.body)?
            .into_iter()
            .map(|record| Container::from_record(record, Arc::clone(&self.context)))
            .collect())
    }

    /// Load a container; `NotFound` if it does not exist
    pub async fn container(&self, name: &str) -> Result<Container> {
        validate_container_name(name)?;
        let container = self.container_handle(name);
        container.load().await?;
        Ok(container)
    }

    /// A container bound to this account without a round trip; its
    /// details load on first access
    pub fn container_handle(&self, name: &str) -> Container {
        Container::bound(name, Arc::clone(&self.context))
    }

    pub async fn has_container(&self, name: &str) -> Result<bool> {
        match self.container(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a container; false if it already existed
    pub async fn create_container(
        &self,
        name: &str,
        acl: Option<&Acl>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<bool> {
        validate_container_name(name)?;
        let mut headers = self.context.auth_headers().await?;
        if let Some(acl) = acl {
            let acl_headers = acl.headers();
            if let Some(read) = &acl_headers.read {
                insert_header(&mut headers, acl::READ_HEADER, read)?;
            }
            if let Some(write) = &acl_headers.write {
                insert_header(&mut headers, acl::WRITE_HEADER, write)?;
            }
        }
        for (key, value) in metadata {
            insert_header(
                &mut headers,
                &format!("{}{}", CONTAINER_META_PREFIX, key),
                value,
            )?;
        }

        let response = self
            .context
            .transport()
            .put(&self.context.container_url(name), headers, Body::Empty)
            .await?
            .ensure(&[StatusCode::CREATED, StatusCode::ACCEPTED])?;

        let created = response.status == StatusCode::CREATED;
        debug!("create_container: {} created={}", name, created);
        Ok(created)
    }

    /// Replace a container's ACL; empty sides clear the stored rules
    pub async fn change_container_acl(&self, name: &str, acl: &Acl) -> Result<()> {
        validate_container_name(name)?;
        let acl_headers = acl.headers();
        let mut headers = self.context.auth_headers().await?;
        insert_header(
            &mut headers,
            acl::READ_HEADER,
            acl_headers.read.as_deref().unwrap_or_default(),
        )?;
        insert_header(
            &mut headers,
            acl::WRITE_HEADER,
            acl_headers.write.as_deref().unwrap_or_default(),
        )?;

        self.context
            .transport()
            .post(&self.context.container_url(name), headers, Body::Empty)
            .await?
            .ensure(&[StatusCode::NO_CONTENT, StatusCode::ACCEPTED])?;
        debug!("change_container_acl: {} -> {}", name, acl);
        Ok(())
    }

    /// Delete an empty container.
    ///
    /// Returns false if it did not exist; a non-empty container is a
    /// `Conflict`.
    pub async fn delete_container(&self, name: &str) -> Result<bool> {
        validate_container_name(name)?;
        let response = self
            .context
            .transport()
            .delete(
                &self.context.container_url(name),
                self.context.auth_headers().await?,
            )
            .await?;

        match response.status {
            StatusCode::NO_CONTENT => {
                debug!("delete_container: {}", name);
                Ok(true)
            }
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::CONFLICT => Err(StoreError::Conflict(format!(
                "Container {} is not empty",
                name
            ))),
            _ => Err(response.into_error()),
        }
    }
}

fn validate_container_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(StoreError::InvalidArgument(format!(
            "Invalid container name: {:?}",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;

    use crate::auth::{
        Authorization, CatalogEndpoint, CatalogEntry, StaticTokenProvider, OBJECT_STORE_SERVICE,
    };
    use crate::transport::MemoryTransport;

    /// Issues `token-0`, `token-1`, ... for the in-memory store
    struct CountingProvider {
        endpoint: String,
        calls: AtomicUsize,
        expires: Option<DateTime<Utc>>,
    }

    impl CountingProvider {
        fn new(endpoint: &str, expires: Option<DateTime<Utc>>) -> Self {
            Self {
                endpoint: endpoint.to_string(),
                calls: AtomicUsize::new(0),
                expires,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthProvider for CountingProvider {
        fn cache_key(&self) -> String {
            "counting".to_string()
        }

        async fn authenticate(&self) -> Result<Authorization> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Authorization {
                token: format!("token-{}", n),
                tenant_id: None,
                expires: self.expires,
                catalog: Arc::new(vec![CatalogEntry {
                    name: "Object Storage".to_string(),
                    service_type: OBJECT_STORE_SERVICE.to_string(),
                    endpoints: vec![CatalogEndpoint {
                        region: None,
                        public_url: self.endpoint.clone(),
                        tenant_id: None,
                    }],
                }]),
            })
        }
    }

    /// Memory store that refuses every token except the accepted one
    struct Gatekeeper {
        inner: Arc<MemoryTransport>,
        accepted: Mutex<Option<String>>,
        seen: Mutex<Vec<String>>,
    }

    impl Gatekeeper {
        fn new(inner: Arc<MemoryTransport>) -> Self {
            Self {
                inner,
                accepted: Mutex::new(None),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn accept(&self, token: &str) {
            *self.accepted.lock() = Some(token.to_string());
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for Gatekeeper {
        async fn execute(&self, request: Request) -> Result<Response> {
            let token = header_str(&request.headers, AUTH_TOKEN_HEADER)
                .unwrap_or_default()
                .to_string();
            self.seen.lock().push(token.clone());
            let refused = matches!(&*self.accepted.lock(), Some(accepted) if *accepted != token);
            if refused {
                return Ok(Response {
                    method: request.method,
                    url: request.url,
                    status: StatusCode::UNAUTHORIZED,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                });
            }
            self.inner.execute(request).await
        }
    }

    fn storage() -> ObjectStorage {
        let transport = Arc::new(MemoryTransport::new());
        ObjectStorage::new(StoreContext::new(
            transport.endpoint().to_string(),
            "tk",
            transport,
        ))
    }

    #[test]
    fn test_urls_encode_names() {
        let transport = Arc::new(MemoryTransport::new());
        let context = StoreContext::new("https://store/v1/AUTH_x/", "tk", transport);
        assert_eq!(
            context.object_url("my photos", "2024/a b.jpg"),
            "https://store/v1/AUTH_x/my%20photos/2024/a%20b.jpg"
        );
        assert_eq!(context.copy_source("c", "x/y"), "/c/x/y");
    }

    #[tokio::test]
    async fn test_missing_token_is_configuration_error() {
        let transport = Arc::new(MemoryTransport::new());
        let context = StoreContext::new("https://store/v1/AUTH_x", "", transport);
        assert!(matches!(
            context.auth_headers().await,
            Err(StoreError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_binds_catalog_endpoint() {
        let transport = Arc::new(MemoryTransport::new());
        let provider = Arc::new(StaticTokenProvider::new("tk", transport.endpoint()));
        let cache = Arc::new(CatalogCache::new());

        let storage =
            ObjectStorage::authenticate(provider, cache.clone(), None, transport.clone())
                .await
                .unwrap();
        assert_eq!(storage.context().endpoint(), transport.endpoint());
        assert!(storage
            .create_container("photos", None, &BTreeMap::new())
            .await
            .unwrap());
        assert!(cache.lookup("token:tk").is_some());
    }

    #[tokio::test]
    async fn test_expiring_token_is_renewed_per_request() {
        let memory = Arc::new(MemoryTransport::new());
        let transport = Arc::new(Gatekeeper::new(memory.clone()));
        let provider = Arc::new(CountingProvider::new(
            memory.endpoint(),
            Some(Utc::now() + chrono::Duration::seconds(30)),
        ));
        let cache = Arc::new(CatalogCache::new());

        let storage = ObjectStorage::authenticate(provider.clone(), cache, None, transport.clone())
            .await
            .unwrap();
        assert_eq!(provider.calls(), 1);

        assert!(storage
            .create_container("c", None, &BTreeMap::new())
            .await
            .unwrap());
        assert!(storage.has_container("c").await.unwrap());
        assert_eq!(provider.calls(), 3);
        assert_eq!(transport.seen(), vec!["token-1", "token-2"]);
    }

    #[tokio::test]
    async fn test_rejected_token_is_renewed_and_retried() {
        let memory = Arc::new(MemoryTransport::new());
        let transport = Arc::new(Gatekeeper::new(memory.clone()));
        let provider = Arc::new(CountingProvider::new(memory.endpoint(), None));
        let cache = Arc::new(CatalogCache::new());

        let storage =
            ObjectStorage::authenticate(provider.clone(), cache.clone(), None, transport.clone())
                .await
                .unwrap();
        transport.accept("token-1");

        assert!(storage
            .create_container("c", None, &BTreeMap::new())
            .await
            .unwrap());
        assert_eq!(provider.calls(), 2);
        assert_eq!(transport.seen(), vec!["token-0", "token-1"]);
        assert_eq!(cache.lookup("counting").unwrap().token, "token-1");

        assert!(storage.has_container("c").await.unwrap());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_stream_is_not_replayed() {
        let memory = Arc::new(MemoryTransport::new());
        let transport = Arc::new(Gatekeeper::new(memory.clone()));
        let provider = Arc::new(CountingProvider::new(memory.endpoint(), None));
        let cache = Arc::new(CatalogCache::new());

        let storage =
            ObjectStorage::authenticate(provider.clone(), cache.clone(), None, transport.clone())
                .await
                .unwrap();
        assert!(storage
            .create_container("c", None, &BTreeMap::new())
            .await
            .unwrap());
        let container = storage.container("c").await.unwrap();
        transport.accept("token-1");

        let chunks = [Ok::<_, std::io::Error>(Bytes::from_static(b"hello"))];
        let object = Object::new("streamed");
        assert!(matches!(
            container
                .save_stream(&object, Box::pin(futures::stream::iter(chunks)), Some(5))
                .await,
            Err(StoreError::Unauthorized(_))
        ));
        assert!(cache.lookup("counting").is_none());
        assert!(memory.object_data("c", "streamed").is_none());

        assert!(storage.has_container("c").await.unwrap());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_fixed_token_is_not_retried() {
        let memory = Arc::new(MemoryTransport::new());
        let transport = Arc::new(Gatekeeper::new(memory.clone()));
        transport.accept("other");
        let storage = ObjectStorage::new(StoreContext::new(
            memory.endpoint(),
            "tk",
            transport.clone(),
        ));

        assert!(matches!(
            storage.create_container("c", None, &BTreeMap::new()).await,
            Err(StoreError::Unauthorized(_))
        ));
        assert_eq!(transport.seen(), vec!["tk"]);
    }

    #[test]
    fn test_with_content_verification_keeps_account() {
        let storage = storage();
        let relaxed = storage.with_content_verification(false);
        assert!(storage.context().verify_content());
        assert!(!relaxed.context().verify_content());
        assert_eq!(relaxed.context().endpoint(), storage.context().endpoint());
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let storage = storage();
        let mut metadata = BTreeMap::new();
        metadata.insert("owner".to_string(), "alice".to_string());

        assert!(!storage.has_container("photos").await.unwrap());
        assert!(storage
            .create_container("photos", Some(&Acl::make_public()), &metadata)
            .await
            .unwrap());
        assert!(!storage
            .create_container("photos", None, &BTreeMap::new())
            .await
            .unwrap());

        let container = storage.container("photos").await.unwrap();
        assert!(container.acl().await.unwrap().is_public());
        assert_eq!(
            container.metadata().await.unwrap().get("owner"),
            Some(&"alice".to_string())
        );

        storage
            .change_container_acl("photos", &Acl::make_non_public())
            .await
            .unwrap();
        let container = storage.container("photos").await.unwrap();
        assert!(container.acl().await.unwrap().is_non_public());

        let names: Vec<String> = storage
            .containers(None, None)
            .await
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["photos"]);

        assert!(storage.delete_container("photos").await.unwrap());
        assert!(!storage.delete_container("photos").await.unwrap());
        assert!(matches!(
            storage.container("photos").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_non_empty_container_conflicts() {
        let storage = storage();
        storage
            .create_container("docs", None, &BTreeMap::new())
            .await
            .unwrap();
        let container = storage.container_handle("docs");
        container
            .save(&Object::with_content("a.txt", "a", "text/plain"))
            .await
            .unwrap();

        assert!(matches!(
            storage.delete_container("docs").await,
            Err(StoreError::Conflict(_))
        ));

        let info = storage.account_info().await.unwrap();
        assert_eq!(
            info,
            AccountInfo {
                containers: 1,
                objects: 1,
                bytes: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_container_names() {
        let storage = storage();
        assert!(matches!(
            storage.create_container("", None, &BTreeMap::new()).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            storage.container("a/b").await,
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
