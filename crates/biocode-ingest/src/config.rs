//! Service configuration
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file, and environment variables (`BIOCODE_*` plus the registry
//! variables `ISCC_HUB_ID`, `ISCC_HUB_URL` and `OMERO_HOST_PUBLIC_URL`).

use crate::annotation::DEFAULT_NAMESPACE;
use biocode_core::RetryPolicy;
use biocode_declare::{RegistryConfig, HUB_ID_ENV, HUB_URL_ENV, PUBLIC_URL_ENV};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// What gets hashed for an image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    /// Canonical plane stream over all scenes
    #[default]
    Pixels,
    /// Raw bytes of the first original file
    File,
}

impl Display for HashMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pixels => "pixels",
            Self::File => "file",
        })
    }
}

impl FromStr for HashMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pixels" | "planes" => Ok(Self::Pixels),
            "file" | "files" => Ok(Self::File),
            other => Err(format!("unknown hash mode '{other}'")),
        }
    }
}

/// What happens to the watermark when an image fails for a reason other than
/// a lost connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Advance and append the image to the dead-letter log
    #[default]
    DeadLetter,
    /// Advance without recording anything beyond the log line
    Skip,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "dead_letter" => Ok(Self::DeadLetter),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown failure policy '{other}'")),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Ingestion service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Sleep between empty polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Images fetched per poll
    pub batch_size: usize,
    /// Read size for file-mode hashing, in bytes
    pub chunk_size: usize,
    /// Annotation namespace
    pub namespace: String,
    /// What gets hashed
    pub hash_mode: HashMode,
    /// Directory holding the cursor and dead-letter log
    pub state_dir: PathBuf,
    /// Directory served as an image store by the binary
    pub source_dir: Option<PathBuf>,
    /// Fallback tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Log line format
    pub log_format: LogFormat,
    /// Reconnect backoff for the image source
    pub connection_retry: RetryPolicy,
    /// Backoff for registry submissions
    pub submission_retry: RetryPolicy,
    /// Attempts and backoff for one image whose processing keeps losing the
    /// source connection
    pub image_retry: RetryPolicy,
    /// Registry request timeout, in seconds
    pub request_timeout_secs: u64,
    /// Entries kept in the per-run content cache
    pub cache_capacity: u64,
    /// Handling of non-connection failures
    pub failure_policy: FailurePolicy,
    /// Registry coordinates
    pub registry: RegistryConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            batch_size: 100,
            chunk_size: 1024 * 1024,
            namespace: DEFAULT_NAMESPACE.to_string(),
            hash_mode: HashMode::Pixels,
            state_dir: PathBuf::from("/data"),
            source_dir: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            connection_retry: RetryPolicy::connection(),
            submission_retry: RetryPolicy::submission(),
            image_retry: RetryPolicy::submission(),
            request_timeout_secs: 30,
            cache_capacity: 10_000,
            failure_policy: FailurePolicy::DeadLetter,
            registry: RegistryConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With state directory
    #[inline]
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// With hash mode
    #[inline]
    #[must_use]
    pub fn with_hash_mode(mut self, mode: HashMode) -> Self {
        self.hash_mode = mode;
        self
    }

    /// With batch size
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// With file read size
    #[inline]
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// With poll interval
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With source reconnect policy
    #[inline]
    #[must_use]
    pub fn with_connection_retry(mut self, policy: RetryPolicy) -> Self {
        self.connection_retry = policy;
        self
    }

    /// With per-image retry budget for lost connections
    #[inline]
    #[must_use]
    pub fn with_image_retry(mut self, policy: RetryPolicy) -> Self {
        self.image_retry = policy;
        self
    }

    /// With failure policy
    #[inline]
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// With registry coordinates
    #[inline]
    #[must_use]
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Poll interval
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Registry request timeout
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parse a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Defaults, then `path` if it exists, then the process environment
    ///
    /// # Errors
    /// Returns error on unreadable files, bad values or failed validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            Some(p) => {
                tracing::warn!(path = %p.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        let config = base.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from variables resolved by `lookup`
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidEnv`] if a variable does not parse
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BIOCODE_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_env("BIOCODE_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("BIOCODE_BATCH_SIZE") {
            self.batch_size = parse_env("BIOCODE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("BIOCODE_CHUNK_SIZE") {
            self.chunk_size = parse_env("BIOCODE_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = lookup("BIOCODE_NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = lookup("BIOCODE_HASH_MODE") {
            self.hash_mode = parse_env("BIOCODE_HASH_MODE", &v)?;
        }
        if let Some(v) = lookup("BIOCODE_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BIOCODE_SOURCE_DIR") {
            self.source_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("BIOCODE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("BIOCODE_LOG_FORMAT") {
            self.log_format = parse_env("BIOCODE_LOG_FORMAT", &v)?;
        }
        if let Some(v) = lookup("BIOCODE_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_env("BIOCODE_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("BIOCODE_FAILURE_POLICY") {
            self.failure_policy = parse_env("BIOCODE_FAILURE_POLICY", &v)?;
        }
        if let Some(v) = lookup(HUB_ID_ENV) {
            self.registry.hub_id = Some(parse_env(HUB_ID_ENV, &v)?);
        }
        if let Some(v) = lookup(HUB_URL_ENV) {
            self.registry.hub_url = Some(v);
        }
        if let Some(v) = lookup(PUBLIC_URL_ENV) {
            self.registry.public_url = Some(v);
        }
        Ok(self)
    }

    /// Reject values the loop cannot run with
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".into()));
        }
        if self.connection_retry.max_attempts == 0
            || self.submission_retry.max_attempts == 0
            || self.image_retry.max_attempts == 0
        {
            return Err(ConfigError::Invalid("retry policies need at least one attempt".into()));
        }
        Ok(())
    }
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
{
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment variable does not parse
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    /// Value out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
