//! Configuration parsing and structures

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Connection settings and defaults shared by every mount
    #[serde(default)]
    pub store: StoreDefaults,

    pub mounts: Vec<RawMountConfig>,
}

/// Which transport talks to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The remote service over HTTP
    #[default]
    Http,
    /// A process-local store, for experiments; contents vanish on exit
    Memory,
}

/// The `store` section
#[derive(Debug, Clone, Deserialize)]
pub struct StoreDefaults {
    #[serde(default)]
    pub backend: Backend,

    /// Storage endpoint; taken from the service catalog when omitted
    pub endpoint: Option<String>,

    /// Identity service URL for password authentication
    pub identity_url: Option<String>,

    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant_id: Option<String>,
    pub tenant_name: Option<String>,

    /// Pre-issued token; requires `endpoint`
    pub token: Option<String>,

    /// Catalog region of the storage endpoint
    pub region: Option<String>,

    /// Whole-request timeout (e.g. `30s`)
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Drop writes instead of saving them (debugging aid)
    #[serde(default)]
    pub never_write: bool,

    /// Check fetched bodies against their etag
    #[serde(default = "default_true")]
    pub verify_content: bool,

    /// Mount read-only by default
    #[serde(default)]
    pub read_only: bool,

    /// Content type of files created through a mount
    pub content_type: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for StoreDefaults {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            endpoint: None,
            identity_url: None,
            username: None,
            password: None,
            tenant_id: None,
            tenant_name: None,
            token: None,
            region: None,
            timeout: None,
            never_write: false,
            verify_content: true,
            read_only: false,
            content_type: None,
        }
    }
}

/// Raw mount configuration before resolution; unset values inherit from
/// the `store` section
#[derive(Debug, Clone, Deserialize)]
pub struct RawMountConfig {
    /// Path where the filesystem will be mounted
    pub path: PathBuf,

    /// Mount a single container instead of the whole account
    pub container: Option<String>,

    pub read_only: Option<bool>,
    pub never_write: Option<bool>,
    pub verify_content: Option<bool>,
    pub content_type: Option<String>,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub mounts: Vec<MountConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// How to obtain a token
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Pre-issued token used against an explicit endpoint
    Token { token: String, endpoint: String },
    /// Username and password exchanged at the identity service
    Password {
        identity_url: String,
        username: String,
        password: String,
        tenant_id: Option<String>,
        tenant_name: Option<String>,
    },
    /// Nothing to authenticate against (memory backend)
    Local,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Token { endpoint, .. } => f
                .debug_struct("Token")
                .field("endpoint", endpoint)
                .finish_non_exhaustive(),
            Credentials::Password {
                identity_url,
                username,
                ..
            } => f
                .debug_struct("Password")
                .field("identity_url", identity_url)
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Local => write!(f, "Local"),
        }
    }
}

/// Connection settings (resolved)
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: Backend,
    pub credentials: Credentials,
    pub region: Option<String>,
    pub timeout: Option<Duration>,
}

/// Mount point configuration (resolved)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    pub path: PathBuf,
    pub container: Option<String>,
    pub read_only: bool,
    pub never_write: bool,
    pub verify_content: bool,
    pub content_type: Option<String>,
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config by merging mount overrides with defaults
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            store,
            mounts,
        } = self;

        let resolved_mounts = mounts
            .into_iter()
            .map(|raw| Self::resolve_mount(&store, raw))
            .collect();

        Ok(Config {
            logging,
            store: Self::resolve_store(store)?,
            mounts: resolved_mounts,
        })
    }

    fn resolve_mount(defaults: &StoreDefaults, raw: RawMountConfig) -> MountConfig {
        MountConfig {
            path: raw.path,
            container: raw.container,
            read_only: raw.read_only.unwrap_or(defaults.read_only),
            never_write: raw.never_write.unwrap_or(defaults.never_write),
            verify_content: raw.verify_content.unwrap_or(defaults.verify_content),
            content_type: raw.content_type.or_else(|| defaults.content_type.clone()),
        }
    }

    fn resolve_store(store: StoreDefaults) -> Result<StoreConfig, ConfigError> {
        let credentials = match store.backend {
            Backend::Memory => Credentials::Local,
            Backend::Http => Self::resolve_credentials(&store)?,
        };

        Ok(StoreConfig {
            backend: store.backend,
            credentials,
            region: store.region,
            timeout: store.timeout,
        })
    }

    fn resolve_credentials(store: &StoreDefaults) -> Result<Credentials, ConfigError> {
        if let Some(token) = &store.token {
            let endpoint = store.endpoint.clone().ok_or_else(|| {
                ConfigError::ValidationError(
                    "store.token requires store.endpoint (a token carries no service catalog)"
                        .to_string(),
                )
            })?;
            return Ok(Credentials::Token {
                token: token.clone(),
                endpoint,
            });
        }

        match (&store.username, &store.password) {
            (Some(username), Some(password)) => {
                let identity_url = store.identity_url.clone().ok_or_else(|| {
                    ConfigError::ValidationError(
                        "store.username/password require store.identity_url".to_string(),
                    )
                })?;
                Ok(Credentials::Password {
                    identity_url,
                    username: username.clone(),
                    password: password.clone(),
                    tenant_id: store.tenant_id.clone(),
                    tenant_name: store.tenant_name.clone(),
                })
            }
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::ValidationError(
                "store.username and store.password must be given together".to_string(),
            )),
            (None, None) => Err(ConfigError::ValidationError(
                "No credentials: set store.token or store.username and store.password".to_string(),
            )),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, expanding `${VAR}` references
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let expanded = substitute_env_vars(content)?;
        let raw: RawConfig =
            serde_yaml::from_str(&expanded).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mounts.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one mount point is required".to_string(),
            ));
        }

        let mut paths = std::collections::HashSet::new();
        for mount in &self.mounts {
            if !paths.insert(&mount.path) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate mount path: {:?}",
                    mount.path
                )));
            }

            if let Some(container) = &mount.container {
                if container.is_empty() || container.contains('/') {
                    return Err(ConfigError::ValidationError(format!(
                        "Mount {:?}: invalid container name {:?}",
                        mount.path, container
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
