use crate::constants::*;
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-queue message limit; unbounded when absent.
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub ingestion_endpoint: String,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter_ms: u64,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ingestion_endpoint: DEFAULT_INGESTION_ENDPOINT.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            backoff_jitter_ms: 0,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Load `path` if it exists (defaults otherwise), then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("DEVICE_PIPELINE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                PipelineError::Config(format!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_var("PORT", &port)?;
        }
        if let Some(endpoint) = lookup("INGESTION_ENDPOINT") {
            self.consumer.ingestion_endpoint = endpoint;
        }
        if let Some(max) = lookup("DEVICE_PIPELINE_MAX_ATTEMPTS") {
            self.consumer.max_attempts = parse_var("DEVICE_PIPELINE_MAX_ATTEMPTS", &max)?;
        }
        if let Some(poll) = lookup("DEVICE_PIPELINE_POLL_INTERVAL_MS") {
            self.consumer.poll_interval_ms = parse_var("DEVICE_PIPELINE_POLL_INTERVAL_MS", &poll)?;
        }
        if let Some(backend) = lookup("DEVICE_PIPELINE_STORAGE") {
            self.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "sqlite" => StorageBackend::Sqlite,
                other => {
                    return Err(PipelineError::Config(format!(
                        "DEVICE_PIPELINE_STORAGE must be 'memory' or 'sqlite', got '{other}'"
                    )))
                }
            };
        }
        if let Some(root) = lookup("DEVICE_PIPELINE_DATA_ROOT") {
            self.storage.data_root = PathBuf::from(root);
        }
        if let Some(capacity) = lookup("DEVICE_PIPELINE_QUEUE_CAPACITY") {
            self.queue.capacity = Some(parse_var("DEVICE_PIPELINE_QUEUE_CAPACITY", &capacity)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.consumer;
        if c.max_attempts == 0 {
            return Err(PipelineError::Config("consumer.max_attempts must be at least 1".into()));
        }
        if c.poll_interval_ms == 0 {
            return Err(PipelineError::Config("consumer.poll_interval_ms must be positive".into()));
        }
        if c.request_timeout_ms == 0 {
            return Err(PipelineError::Config("consumer.request_timeout_ms must be positive".into()));
        }
        if c.backoff_base_ms > c.backoff_max_ms {
            return Err(PipelineError::Config(format!(
                "consumer.backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                c.backoff_base_ms, c.backoff_max_ms
            )));
        }
        match reqwest::Url::parse(&c.ingestion_endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(PipelineError::Config(format!(
                    "consumer.ingestion_endpoint '{}' is not an absolute http(s) URL",
                    c.ingestion_endpoint
                )))
            }
        }
        if self.queue.capacity == Some(0) {
            return Err(PipelineError::Config("queue.capacity must be positive".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| PipelineError::Config(format!("{key}='{raw}': {e}")))
}
