//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::LimiterConfig;

/// Prefix for environment variable overrides, e.g.
/// `GATEKEEPER__RATE_LIMITING__LIMIT=10`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: LimiterConfig,

    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that overwrites these headers.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_headers: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3333))
}

/// Which backend holds the per-client window state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// JSON snapshot file
    #[default]
    File,
    /// Process memory, lost on restart
    Memory,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Snapshot file for the file backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Write an empty snapshot at startup if the file is absent
    #[serde(default)]
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            create_if_missing: false,
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("gatekeeper-state.json")
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl GatekeeperConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `GATEKEEPER__*` environment overrides.
    ///
    /// Not validated: callers apply command-line overrides first and then
    /// call [`GatekeeperConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config: GatekeeperConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig =
            serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()?;

        if self.store.backend == StoreBackend::File && self.store.path.as_os_str().is_empty() {
            return Err(GatekeeperError::Config(
                "store.path is required for the file backend".to_string(),
            ));
        }

        Ok(())
    }
}
