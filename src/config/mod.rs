//! Configuration loading for the anonymizer service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `ANONYMIZER_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, fmt, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "ANONYMIZER_";

/// Application configuration derived from `ANONYMIZER_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Collection the export jobs read source resources from.
    #[serde(default = "default_source_collection_id")]
    pub source_collection_id: String,
    #[serde(default)]
    pub job: AnonymizeJobConfig,
}

/// How exported resources are transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformMode {
    /// Apply the collection's de-identification configuration.
    #[default]
    Anonymize,
    /// Copy resources unchanged.
    Passthrough,
}

impl FromStr for TransformMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymize" => Ok(TransformMode::Anonymize),
            "passthrough" => Ok(TransformMode::Passthrough),
            other => Err(ConfigError::InvalidTransformMode {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for TransformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformMode::Anonymize => f.write_str("anonymize"),
            TransformMode::Passthrough => f.write_str("passthrough"),
        }
    }
}

/// Anonymize job execution parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AnonymizeJobConfig {
    /// Page size requested from the source search (default: 1000)
    #[serde(default = "default_job_max_resources_per_query")]
    pub max_resources_per_query: u32,

    /// Pages processed between checkpoint writes (default: 10)
    #[serde(default = "default_job_pages_per_commit")]
    pub pages_per_commit: u32,

    /// Jobs a worker runs at the same time (default: 1)
    #[serde(default = "default_job_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Seconds between worker polls (default: 10)
    #[serde(default = "default_job_polling_frequency_seconds")]
    pub polling_frequency_seconds: u64,

    /// Jitter applied to the poll interval (default: 0.1)
    #[serde(default = "default_job_polling_jitter_factor")]
    pub polling_jitter_factor: f64,

    /// Running jobs without a write for this long are re-acquired (default: 600)
    #[serde(default = "default_job_heartbeat_timeout_seconds")]
    pub heartbeat_timeout_seconds: u64,

    /// Collections whose compiled configuration one job keeps cached (default: 64)
    #[serde(default = "default_job_configuration_cache_size")]
    pub configuration_cache_size: usize,

    /// Concurrent search leases per job (default: 1)
    #[serde(default = "default_job_search_concurrency")]
    pub search_concurrency: usize,

    /// Concurrent destination store leases per job (default: 4)
    #[serde(default = "default_job_store_concurrency")]
    pub store_concurrency: usize,

    #[serde(default)]
    pub transform_mode: TransformMode,
}

impl Default for AnonymizeJobConfig {
    fn default() -> Self {
        Self {
            max_resources_per_query: default_job_max_resources_per_query(),
            pages_per_commit: default_job_pages_per_commit(),
            max_concurrent_jobs: default_job_max_concurrent_jobs(),
            polling_frequency_seconds: default_job_polling_frequency_seconds(),
            polling_jitter_factor: default_job_polling_jitter_factor(),
            heartbeat_timeout_seconds: default_job_heartbeat_timeout_seconds(),
            configuration_cache_size: default_job_configuration_cache_size(),
            search_concurrency: default_job_search_concurrency(),
            store_concurrency: default_job_store_concurrency(),
            transform_mode: TransformMode::default(),
        }
    }
}

impl AnonymizeJobConfig {
    /// Validate job configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_resources_per_query == 0 || self.max_resources_per_query > 10_000 {
            return Err(ConfigError::InvalidMaxResourcesPerQuery {
                value: self.max_resources_per_query,
            });
        }

        if self.pages_per_commit == 0 {
            return Err(ConfigError::InvalidPagesPerCommit {
                value: self.pages_per_commit,
            });
        }

        if self.max_concurrent_jobs == 0 || self.max_concurrent_jobs > 64 {
            return Err(ConfigError::InvalidMaxConcurrentJobs {
                value: self.max_concurrent_jobs,
            });
        }

        if self.polling_frequency_seconds == 0 {
            return Err(ConfigError::InvalidPollingFrequency {
                value: self.polling_frequency_seconds,
            });
        }

        if !(0.0..=1.0).contains(&self.polling_jitter_factor) {
            return Err(ConfigError::InvalidPollingJitter {
                value: self.polling_jitter_factor,
            });
        }

        // A job only writes at checkpoints, so the timeout must outlast a poll.
        if self.heartbeat_timeout_seconds <= self.polling_frequency_seconds {
            return Err(ConfigError::InvalidHeartbeatTimeout {
                value: self.heartbeat_timeout_seconds,
                polling: self.polling_frequency_seconds,
            });
        }

        if self.configuration_cache_size == 0 {
            return Err(ConfigError::InvalidCacheSize {
                value: self.configuration_cache_size,
            });
        }

        if self.search_concurrency == 0 || self.store_concurrency == 0 {
            return Err(ConfigError::InvalidLeaseLimit {
                search: self.search_concurrency,
                store: self.store_concurrency,
            });
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            source_collection_id: default_source_collection_id(),
            job: AnonymizeJobConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (database credentials are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        config.database_url = redact_database_url(&config.database_url);
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_collection_id.trim().is_empty() {
            return Err(ConfigError::MissingSourceCollection);
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }

        self.job.validate()?;

        Ok(())
    }
}

fn redact_database_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}[REDACTED]{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://anonymizer.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_source_collection_id() -> String {
    "default".to_string()
}

fn default_job_max_resources_per_query() -> u32 {
    1000
}

fn default_job_pages_per_commit() -> u32 {
    10
}

fn default_job_max_concurrent_jobs() -> usize {
    1
}

fn default_job_polling_frequency_seconds() -> u64 {
    10
}

fn default_job_polling_jitter_factor() -> f64 {
    0.1
}

fn default_job_heartbeat_timeout_seconds() -> u64 {
    600
}

fn default_job_configuration_cache_size() -> usize {
    64
}

fn default_job_search_concurrency() -> usize {
    1
}

fn default_job_store_concurrency() -> usize {
    4
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("source collection id is empty; set ANONYMIZER_SOURCE_COLLECTION_ID")]
    MissingSourceCollection,
    #[error("database max connections must be positive, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("max resources per query must be between 1 and 10000, got {value}")]
    InvalidMaxResourcesPerQuery { value: u32 },
    #[error("pages per commit must be at least 1, got {value}")]
    InvalidPagesPerCommit { value: u32 },
    #[error("max concurrent jobs must be between 1 and 64, got {value}")]
    InvalidMaxConcurrentJobs { value: usize },
    #[error("polling frequency must be positive, got {value}")]
    InvalidPollingFrequency { value: u64 },
    #[error("polling jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidPollingJitter { value: f64 },
    #[error(
        "heartbeat timeout ({value}s) must be longer than the polling frequency ({polling}s)"
    )]
    InvalidHeartbeatTimeout { value: u64, polling: u64 },
    #[error("configuration cache size must be positive, got {value}")]
    InvalidCacheSize { value: usize },
    #[error("lease limits must be positive (search: {search}, store: {store})")]
    InvalidLeaseLimit { search: usize, store: usize },
    #[error("unknown transform mode '{value}'; expected 'anonymize' or 'passthrough'")]
    InvalidTransformMode { value: String },
}

/// Loads configuration using layered `.env` files and `ANONYMIZER_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self::with_base_dir(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    /// Creates a loader rooted at the provided directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration. The process environment overrides `.env` layers.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let source_collection_id = layered
            .remove("SOURCE_COLLECTION_ID")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_source_collection_id);

        let transform_mode = match layered.remove("JOB_TRANSFORM_MODE") {
            Some(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => TransformMode::default(),
        };

        let job = AnonymizeJobConfig {
            max_resources_per_query: layered
                .remove("JOB_MAX_RESOURCES_PER_QUERY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_max_resources_per_query),
            pages_per_commit: layered
                .remove("JOB_PAGES_PER_COMMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_pages_per_commit),
            max_concurrent_jobs: layered
                .remove("JOB_MAX_CONCURRENT_JOBS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_max_concurrent_jobs),
            polling_frequency_seconds: layered
                .remove("JOB_POLLING_FREQUENCY_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_polling_frequency_seconds),
            polling_jitter_factor: layered
                .remove("JOB_POLLING_JITTER_FACTOR")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_polling_jitter_factor),
            heartbeat_timeout_seconds: layered
                .remove("JOB_HEARTBEAT_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_heartbeat_timeout_seconds),
            configuration_cache_size: layered
                .remove("JOB_CONFIGURATION_CACHE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_configuration_cache_size),
            search_concurrency: layered
                .remove("JOB_SEARCH_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_search_concurrency),
            store_concurrency: layered
                .remove("JOB_STORE_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_store_concurrency),
            transform_mode,
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            source_collection_id,
            job,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
