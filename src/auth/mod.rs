//! Authentication and service catalog resolution
//!
//! Providers turn credentials into an [`Authorization`]: a token plus the
//! service catalog that names the storage endpoint. Two sources are
//! supported:
//! - Password credentials against an identity service
//! - Pre-issued tokens with an explicit storage endpoint
//!
//! Resolved authorizations are kept in a [`CatalogCache`] so a burst of
//! filesystem operations authenticates once.

pub mod identity;
pub mod static_token;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

pub use identity::IdentityProvider;
pub use static_token::StaticTokenProvider;

/// Catalog service type of the object store
pub const OBJECT_STORE_SERVICE: &str = "object-store";

/// Buffer time before token expiry to trigger re-authentication (60 seconds).
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// One endpoint of a catalog service
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CatalogEndpoint {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(rename = "publicURL")]
    pub public_url: String,
    #[serde(default, rename = "tenantId")]
    pub tenant_id: Option<String>,
}

/// One service of the catalog
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

/// A token together with the catalog it was issued with
#[derive(Debug, Clone)]
pub struct Authorization {
    pub token: String,
    pub tenant_id: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub catalog: Arc<Vec<CatalogEntry>>,
}

impl Authorization {
    /// Whether the token is still usable (with buffer)
    pub fn is_valid(&self) -> bool {
        match self.expires {
            Some(expires) => {
                let buffer = chrono::Duration::from_std(EXPIRY_BUFFER)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                Utc::now() + buffer < expires
            }
            None => true,
        }
    }

    /// Select the object-store endpoint, preferring `region` when given
    pub fn storage_endpoint(&self, region: Option<&str>) -> Result<String> {
        let endpoints: Vec<&CatalogEndpoint> = self
            .catalog
            .iter()
            .filter(|entry| entry.service_type == OBJECT_STORE_SERVICE)
            .flat_map(|entry| entry.endpoints.iter())
            .collect();

        let chosen = match region {
            Some(region) => endpoints
                .iter()
                .find(|e| e.region.as_deref() == Some(region))
                .copied(),
            None => endpoints.first().copied(),
        };

        chosen
            .map(|e| e.public_url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                StoreError::Configuration(match region {
                    Some(region) => format!("No object-store endpoint for region {}", region),
                    None => "No object-store endpoint in service catalog".to_string(),
                })
            })
    }
}

/// Source of authorizations
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Key identifying the credentials, used to look up cached authorizations
    fn cache_key(&self) -> String;

    /// Authenticate and return a fresh authorization
    async fn authenticate(&self) -> Result<Authorization>;
}

static GLOBAL_CACHE: Lazy<Arc<CatalogCache>> = Lazy::new(|| Arc::new(CatalogCache::new()));

/// Last resolved authorization, keyed by credentials
///
/// Populated on successful authentication; replaced only when a provider
/// with different credentials authenticates, when the cached token is
/// about to expire, or on explicit [`CatalogCache::invalidate`].
#[derive(Debug, Default)]
pub struct CatalogCache {
    entry: RwLock<Option<(String, Authorization)>>,
}

impl CatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache
    pub fn global() -> Arc<CatalogCache> {
        Arc::clone(&GLOBAL_CACHE)
    }

    /// Cached authorization for `key`, if still valid
    pub fn lookup(&self, key: &str) -> Option<Authorization> {
        let entry = self.entry.read();
        entry
            .as_ref()
            .filter(|(cached_key, auth)| cached_key == key && auth.is_valid())
            .map(|(_, auth)| auth.clone())
    }

    /// Return the cached authorization for the provider or authenticate
    pub async fn resolve(&self, provider: &dyn AuthProvider) -> Result<Authorization> {
        let key = provider.cache_key();
        if let Some(auth) = self.lookup(&key) {
            debug!("Using cached service catalog");
            return Ok(auth);
        }

        let auth = provider.authenticate().await?;
        info!(
            "Authenticated; catalog has {} service(s)",
            auth.catalog.len()
        );
        *self.entry.write() = Some((key, auth.clone()));
        Ok(auth)
    }

    /// Drop the cached authorization, forcing re-authentication
    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }
}
