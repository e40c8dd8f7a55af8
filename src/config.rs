//! Configuration module for votestream.
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Both binaries read the same file and use the sections they need.
//!
//! # Example
//!
//! ```toml
//! [storage]
//! url = "redis://localhost:6379"
//!
//! [bus]
//! topic = "ballots:votes"
//! consumer_group = "counter"
//!
//! [stream]
//! endpoint = "https://stream.example.com/1.1/statuses/filter.json"
//! bearer_token = "${VOTESTREAM_BEARER_TOKEN}"
//!
//! [counter]
//! flush_interval_ms = 1000
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{DEFAULT_CONSUMER_GROUP, VOTE_STREAM_NAME};

/// Env var naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "VOTESTREAM_CONFIG";

/// Env var consulted when `[stream] bearer_token` is absent.
pub const BEARER_TOKEN_ENV: &str = "VOTESTREAM_BEARER_TOKEN";

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct VotesConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub counter: CounterConfig,
}

/// Poll storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every poll key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "ballots".to_string()
}

/// Message bus configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default)]
    pub consumer_name: Option<String>,

    /// Upper bound on concurrently running message handlers
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Approximate cap on the vote stream length
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            topic: default_topic(),
            consumer_group: default_consumer_group(),
            consumer_name: None,
            max_in_flight: default_max_in_flight(),
            block_ms: default_block_ms(),
            batch_size: default_batch_size(),
            max_len: default_max_len(),
        }
    }
}

fn default_topic() -> String {
    VOTE_STREAM_NAME.to_string()
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_max_in_flight() -> usize {
    16
}

fn default_block_ms() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    32
}

fn default_max_len() -> usize {
    100_000
}

impl BusConfig {
    /// Consumer name from config, falling back to the hostname or a UUID.
    pub fn consumer_name(&self) -> String {
        if let Some(name) = &self.consumer_name {
            return name.clone();
        }

        if let Ok(hostname) = hostname::get() {
            if let Some(name) = hostname.to_str() {
                return format!("counter-{}", name);
            }
        }

        format!("counter-{}", uuid::Uuid::new_v4())
    }
}

/// Live stream configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Hard lifetime of one session, healthy or not
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Pause between two session attempts
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Capacity of the reader → publisher hand-off
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,

    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            bearer_token: None,
            session_timeout_secs: default_session_timeout_secs(),
            retry_delay_secs: default_retry_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handoff_capacity: default_handoff_capacity(),
            max_record_bytes: default_max_record_bytes(),
        }
    }
}

fn default_endpoint() -> String {
    "https://stream.twitter.com/1.1/statuses/filter.json".to_string()
}

fn default_session_timeout_secs() -> u64 {
    60
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_handoff_capacity() -> usize {
    1
}

fn default_max_record_bytes() -> usize {
    1024 * 1024
}

impl StreamConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Counter (consumer process) configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CounterConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_flush_interval_ms() -> u64 {
    1000
}

impl CounterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl VotesConfig {
    /// Load configuration from the default path or VOTESTREAM_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config/votestream.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: VotesConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            topic = %config.bus.topic,
            consumer_group = %config.bus.consumer_group,
            session_timeout_secs = config.stream.session_timeout_secs,
            flush_interval_ms = config.counter.flush_interval_ms,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = &self.stream.endpoint;
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "Stream endpoint '{}' must start with http:// or https://",
                endpoint
            )));
        }

        if self.bus.topic.is_empty() {
            return Err(ConfigError::MissingField("bus.topic".to_string()));
        }

        if self.bus.consumer_group.is_empty() {
            return Err(ConfigError::MissingField("bus.consumer_group".to_string()));
        }

        let non_zero = [
            ("bus.max_in_flight", self.bus.max_in_flight as u64),
            ("bus.batch_size", self.bus.batch_size as u64),
            ("bus.block_ms", self.bus.block_ms),
            ("bus.max_len", self.bus.max_len as u64),
            ("stream.session_timeout_secs", self.stream.session_timeout_secs),
            ("stream.retry_delay_secs", self.stream.retry_delay_secs),
            ("stream.connect_timeout_secs", self.stream.connect_timeout_secs),
            ("stream.handoff_capacity", self.stream.handoff_capacity as u64),
            ("stream.max_record_bytes", self.stream.max_record_bytes as u64),
            ("counter.flush_interval_ms", self.counter.flush_interval_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    field
                )));
            }
        }

        if let Some(token) = &self.stream.bearer_token {
            if token.contains("${") {
                warn!("Stream bearer token contains unsubstituted environment variable");
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}
