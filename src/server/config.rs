//! Embedding Server Configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::models::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_CACHE_CAPACITY, DEFAULT_QUEUE_CAPACITY, DEFAULT_REQUEST_TIMEOUT,
};
use crate::models::{EmbeddingConfig, EmbeddingError, EmbeddingResult, ModelDescriptor};
use crate::onnx::OnnxConfig;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub embedding: EmbeddingSection,
    pub onnx: OnnxConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
}

/// The `[embedding]` table. Converted to a validated [`EmbeddingConfig`]
/// by [`ServerConfig::embedding_config`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub model: String,
    pub output_dim: Option<usize>,
    pub batch_size: usize,
    pub cache_capacity: usize,
    pub request_timeout_ms: u64,
    /// 0 keeps the model loaded forever
    pub idle_unload_after_secs: u64,
    pub queue_capacity: usize,
    pub shutdown_timeout_secs: u64,
    /// Load the model at startup instead of on the first request
    pub preload: bool,
    pub model_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> EmbeddingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> EmbeddingResult<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Resolve the model name and validate the `[embedding]` table
    pub fn embedding_config(&self) -> EmbeddingResult<EmbeddingConfig> {
        let section = &self.embedding;
        let model: ModelDescriptor = section.model.parse()?;

        let mut builder = EmbeddingConfig::builder(model)
            .batch_size(section.batch_size)
            .cache_capacity(section.cache_capacity)
            .request_timeout(Duration::from_millis(section.request_timeout_ms))
            .queue_capacity(section.queue_capacity)
            .idle_unload_after(match section.idle_unload_after_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            });
        if let Some(dim) = section.output_dim {
            builder = builder.output_dim(dim);
        }
        builder.build()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding.shutdown_timeout_secs)
    }

    /// Validate everything the server needs before it binds
    pub fn validate(&self) -> EmbeddingResult<()> {
        self.network
            .bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                EmbeddingError::config(format!(
                    "Invalid bind address '{}': {}",
                    self.network.bind_address, e
                ))
            })?;
        if self.embedding.shutdown_timeout_secs == 0 {
            return Err(EmbeddingError::config("shutdown_timeout_secs must be at least 1"));
        }
        self.embedding_config().map(|_| ())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8787".to_string(),
        }
    }
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: ModelDescriptor::default().name.to_string(),
            output_dim: None,
            batch_size: DEFAULT_BATCH_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            idle_unload_after_secs: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout_secs: 10,
            preload: false,
            model_dir: "models".to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
