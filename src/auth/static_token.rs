//! Pre-issued token provider.
//!
//! Returns a fixed token and a one-entry catalog pointing at an explicitly
//! configured storage endpoint. No validation or refresh is performed;
//! the store rejects the token once it expires.

use std::sync::Arc;

use async_trait::async_trait;

use super::{AuthProvider, Authorization, CatalogEndpoint, CatalogEntry, OBJECT_STORE_SERVICE};
use crate::error::Result;

/// A provider for a token obtained elsewhere
pub struct StaticTokenProvider {
    token: String,
    endpoint: String,
    region: Option<String>,
}

impl StaticTokenProvider {
    /// Create a new static token provider.
    pub fn new(token: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            endpoint: endpoint.into(),
            region: None,
        }
    }

    /// Tag the endpoint with a region so region selection still works
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    fn cache_key(&self) -> String {
        format!("token:{}", self.token)
    }

    async fn authenticate(&self) -> Result<Authorization> {
        Ok(Authorization {
            token: self.token.clone(),
            tenant_id: None,
            expires: None,
            catalog: Arc::new(vec![CatalogEntry {
                name: "Object Storage".to_string(),
                service_type: OBJECT_STORE_SERVICE.to_string(),
                endpoints: vec![CatalogEndpoint {
                    region: self.region.clone(),
                    public_url: self.endpoint.clone(),
                    tenant_id: None,
                }],
            }]),
        })
    }
}
