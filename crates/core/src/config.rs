//! TOML-based configuration system for gitindex.
//!
//! The search backend URL may be overridden at runtime from an environment
//! variable (default `ES_HOST`) via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::index::ReadinessPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where stores live and who authors content commits.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Search index backend settings.
    #[serde(default)]
    pub index: IndexConfig,

    /// Incremental sync behaviour.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Store location and commit identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory containing one git repository per store.
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,

    /// Author name recorded on content commits.
    #[serde(default = "default_author_name")]
    pub author_name: String,

    /// Author email recorded on content commits.
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from("./repos")
}
fn default_author_name() -> String {
    "gitindex".into()
}
fn default_author_email() -> String {
    "gitindex@localhost".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            repo_dir: default_repo_dir(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Which search backend implementation to use.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process index; contents are lost when the process exits.
    Memory,
    /// Elasticsearch REST API.
    #[default]
    Elasticsearch,
}

/// Search index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Whether the index handlers are registered at all.
    #[serde(default)]
    pub enabled: bool,

    /// Backend implementation.
    #[serde(default)]
    pub backend: BackendKind,

    /// Backend base URL.
    #[serde(default = "default_index_url")]
    pub url: String,

    /// Environment variable that overrides `url` when set.
    #[serde(default = "default_url_env")]
    pub url_env: String,

    /// Per-request timeout for backend calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound on waiting for a freshly built index to become ready.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// First delay between readiness checks.
    #[serde(default = "default_initial_backoff")]
    pub ready_initial_backoff_ms: u64,

    /// Largest delay between readiness checks.
    #[serde(default = "default_max_backoff")]
    pub ready_max_backoff_ms: u64,
}

fn default_index_url() -> String {
    "http://localhost:9200".into()
}
fn default_url_env() -> String {
    "ES_HOST".into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_ready_timeout() -> u64 {
    30
}
fn default_initial_backoff() -> u64 {
    50
}
fn default_max_backoff() -> u64 {
    2_000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendKind::default(),
            url: default_index_url(),
            url_env: default_url_env(),
            request_timeout_secs: default_request_timeout(),
            ready_timeout_secs: default_ready_timeout(),
            ready_initial_backoff_ms: default_initial_backoff(),
            ready_max_backoff_ms: default_max_backoff(),
        }
    }
}

impl IndexConfig {
    /// Readiness polling policy derived from the configured bounds.
    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            timeout: Duration::from_secs(self.ready_timeout_secs),
            initial_backoff: Duration::from_millis(self.ready_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.ready_max_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Sync behaviour
// ---------------------------------------------------------------------------

/// Incremental sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Re-index the target of a rename. When false, a rename only removes the
    /// old path's document and the new path is indexed only if a separate
    /// added/modified record names it.
    #[serde(default = "default_true")]
    pub index_rename_targets: bool,

    /// Remote to fast-forward from when polling (default: the branch's
    /// upstream, else the first remote).
    #[serde(default)]
    pub remote: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            index_rename_targets: true,
            remote: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply environment overrides. A set-but-empty variable is ignored.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = resolve_optional_env(&self.index.url_env, "index.url_env") {
            info!(url = %url, "index URL overridden from environment");
            self.index.url = url;
        }
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.author_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage.author_name".into(),
                detail: "author name must not be empty".into(),
            });
        }
        if !self.storage.author_email.contains('@') {
            return Err(ConfigError::InvalidValue {
                field: "storage.author_email".into(),
                detail: "author email must contain '@'".into(),
            });
        }
        if self.index.backend == BackendKind::Elasticsearch
            && !(self.index.url.starts_with("http://") || self.index.url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidValue {
                field: "index.url".into(),
                detail: "must be an http(s) URL".into(),
            });
        }
        if self.index.ready_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "index.ready_timeout_secs".into(),
                detail: "ready timeout must be > 0".into(),
            });
        }
        if self.index.ready_initial_backoff_ms == 0
            || self.index.ready_initial_backoff_ms > self.index.ready_max_backoff_ms
        {
            return Err(ConfigError::InvalidValue {
                field: "index.ready_initial_backoff_ms".into(),
                detail: "must be > 0 and <= ready_max_backoff_ms".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => None,
    }
}
