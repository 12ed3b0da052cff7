//! Identity-service token provider.
//!
//! Exchanges username/password credentials for a token and service
//! catalog by POSTing to `<identity_url>/tokens`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{AuthProvider, Authorization, CatalogEntry};
use crate::error::{Result, StoreError};
use crate::transport::{insert_header, Body, Transport};

/// Identity provider configuration
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Base URL of the identity service (e.g., `https://identity/v2.0`)
    pub identity_url: String,
    pub username: String,
    pub password: String,
    pub tenant_id: Option<String>,
    pub tenant_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    access: Access,
}

#[derive(Debug, Deserialize)]
struct Access {
    token: TokenInfo,
    #[serde(default, rename = "serviceCatalog")]
    service_catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    id: String,
    #[serde(default)]
    expires: Option<String>,
    #[serde(default)]
    tenant: Option<TenantInfo>,
}

#[derive(Debug, Deserialize)]
struct TenantInfo {
    id: String,
}

/// A provider that authenticates against the identity service
pub struct IdentityProvider {
    config: IdentityConfig,
    transport: Arc<dyn Transport>,
}

impl IdentityProvider {
    pub fn new(config: IdentityConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    fn request_body(&self) -> serde_json::Value {
        let mut auth = json!({
            "passwordCredentials": {
                "username": self.config.username,
                "password": self.config.password,
            }
        });
        if let Some(tenant_id) = &self.config.tenant_id {
            auth["tenantId"] = json!(tenant_id);
        } else if let Some(tenant_name) = &self.config.tenant_name {
            auth["tenantName"] = json!(tenant_name);
        }
        json!({ "auth": auth })
    }
}

/// Parse an identity `tokens` response body
pub fn parse_token_response(body: &[u8]) -> Result<Authorization> {
    let envelope: TokenEnvelope = serde_json::from_slice(body).map_err(|e| {
        StoreError::Configuration(format!("Malformed identity response: {}", e))
    })?;

    let expires = envelope
        .access
        .token
        .expires
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(Authorization {
        token: envelope.access.token.id,
        tenant_id: envelope.access.token.tenant.map(|t| t.id),
        expires,
        catalog: Arc::new(envelope.access.service_catalog),
    })
}

#[async_trait]
impl AuthProvider for IdentityProvider {
    fn cache_key(&self) -> String {
        format!(
            "identity:{}:{}:{}",
            self.config.identity_url,
            self.config.username,
            self.config
                .tenant_id
                .as_deref()
                .or(self.config.tenant_name.as_deref())
                .unwrap_or("")
        )
    }

    async fn authenticate(&self) -> Result<Authorization> {
        let url = format!("{}/tokens", self.config.identity_url.trim_end_matches('/'));
        debug!("Authenticating {} against {}", self.config.username, url);

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "Content-Type", "application/json")?;
        insert_header(&mut headers, "Accept", "application/json")?;

        let body = serde_json::to_vec(&self.request_body()).map_err(|e| {
            StoreError::InvalidArgument(format!("Cannot encode credentials: {}", e))
        })?;

        let response = self
            .transport
            .post(&url, headers, Body::Bytes(Bytes::from(body)))
            .await?
            .ensure(&[StatusCode::OK, StatusCode::CREATED, StatusCode::ACCEPTED])?;

        parse_token_response(&response.body)
    }
}
