//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `BUILDAPI_BASE_URL`, `BUILDAPI_CLOUD`,
//!    `BUILDAPI_PAGE_SIZE`, `BUILDAPI_LOG_LEVEL`
//! 2. **Config file**: path passed to [`Config::load`], or `buildapi.toml`
//!    in the working directory
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [api]
//! cloud = "aws"                 # or "azure"
//! # base_url = "https://api.electricimp.com"   # overrides `cloud`
//! api_version = "v5"
//! connect_timeout_secs = 120
//! request_timeout_secs = 120
//!
//! [pagination]
//! page_size = 20
//!
//! [log_stream]
//! idle_timeout_secs = 300
//! retry_interval_secs = 10
//! max_devices = 8
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ClientError;

const AWS_BASE_URL: &str = "https://api.electricimp.com";
const AZURE_BASE_URL: &str = "https://api.az.electricimp.io";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub log_stream: LogStreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which impCloud hosts the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cloud {
    #[default]
    Aws,
    Azure,
}

impl Cloud {
    fn base_url(self) -> &'static str {
        match self {
            Self::Aws => AWS_BASE_URL,
            Self::Azure => AZURE_BASE_URL,
        }
    }
}

/// REST endpoint and HTTP client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// impCloud selection (default `aws`). Ignored when `base_url` is set.
    #[serde(default)]
    pub cloud: Cloud,
    /// Explicit API host, e.g. for a private cloud or a test server.
    pub base_url: Option<String>,
    /// Path prefix of the API version (default `v5`).
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// `User-Agent` header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// TCP/TLS connect timeout in seconds (default 120).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Whole-request timeout for REST calls in seconds (default 120).
    /// Does not apply to the log stream.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Collection paging.
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    /// Items requested per page (default 20).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// Real-time log stream settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LogStreamConfig {
    /// Seconds without any stream traffic before forcing a reconnect (default 300).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds to wait before reopening a dropped stream (default 10).
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// Maximum devices logged over the shared stream (default 8).
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_api_version() -> String {
    "v5".to_string()
}
fn default_user_agent() -> String {
    format!("buildapi-rs/{}", env!("CARGO_PKG_VERSION"))
}
fn default_connect_timeout() -> u64 {
    120
}
fn default_request_timeout() -> u64 {
    120
}
fn default_page_size() -> usize {
    20
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_retry_interval() -> u64 {
    10
}
fn default_max_devices() -> usize {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            cloud: Cloud::default(),
            base_url: None,
            api_version: default_api_version(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            retry_interval_secs: default_retry_interval(),
            max_devices: default_max_devices(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ApiConfig {
    /// API root including the version prefix, always ending in `/`.
    ///
    /// ```text
    /// https://api.electricimp.com/v5/
    /// ```
    pub fn api_root(&self) -> String {
        let host = self
            .base_url
            .as_deref()
            .unwrap_or_else(|| self.cloud.base_url())
            .trim_end_matches('/');
        let version = self.api_version.trim_matches('/');
        format!("{host}/{version}/")
    }
}

impl LogStreamConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `buildapi.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ClientError> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new("buildapi.toml").exists() {
            Self::from_file(Path::new("buildapi.toml"))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ClientError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Env var overrides. `lookup` is injected so tests don't touch the
    /// process environment.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ClientError> {
        if let Some(url) = lookup("BUILDAPI_BASE_URL") {
            self.api.base_url = Some(url);
        }
        if let Some(cloud) = lookup("BUILDAPI_CLOUD") {
            self.api.cloud = match cloud.to_ascii_lowercase().as_str() {
                "aws" => Cloud::Aws,
                "azure" => Cloud::Azure,
                other => {
                    return Err(ClientError::Config(format!(
                        "BUILDAPI_CLOUD must be 'aws' or 'azure', got '{other}'"
                    )))
                }
            };
        }
        if let Some(size) = lookup("BUILDAPI_PAGE_SIZE") {
            self.pagination.page_size = size.parse().map_err(|_| {
                ClientError::Config(format!("BUILDAPI_PAGE_SIZE is not a number: '{size}'"))
            })?;
        }
        if let Some(level) = lookup("BUILDAPI_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.pagination.page_size == 0 {
            return Err(ClientError::Config("pagination.page_size must be at least 1".into()));
        }
        if self.log_stream.max_devices == 0 {
            return Err(ClientError::Config("log_stream.max_devices must be at least 1".into()));
        }
        if let Some(url) = &self.api.base_url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ClientError::Config(format!("invalid base_url scheme: {url}")));
            }
        }
        Ok(())
    }
}
