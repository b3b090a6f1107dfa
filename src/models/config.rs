//! Validated embedding configuration
//!
//! [`EmbeddingConfig`] can only be obtained through
//! [`EmbeddingConfigBuilder::build`], so every instance in the program has
//! already passed validation.

use std::time::Duration;

use crate::models::{EmbeddingError, EmbeddingResult, ModelDescriptor};

pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Configuration of one embedding service instance
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    model: ModelDescriptor,
    output_dim: Option<usize>,
    batch_size: usize,
    cache_capacity: usize,
    request_timeout: Duration,
    idle_unload_after: Option<Duration>,
    queue_capacity: usize,
}

impl EmbeddingConfig {
    /// Start building a configuration for `model`
    pub fn builder(model: ModelDescriptor) -> EmbeddingConfigBuilder {
        EmbeddingConfigBuilder::new(model)
    }

    /// Shorthand for a configuration with defaults and an optional output dimension
    pub fn new(model: ModelDescriptor, output_dim: Option<usize>) -> EmbeddingResult<Self> {
        let mut builder = Self::builder(model);
        if let Some(dim) = output_dim {
            builder = builder.output_dim(dim);
        }
        builder.build()
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    pub fn output_dim(&self) -> Option<usize> {
        self.output_dim
    }

    /// Dimension of every vector the service returns
    pub fn effective_output_dim(&self) -> usize {
        self.output_dim.unwrap_or(self.model.native_dim)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn idle_unload_after(&self) -> Option<Duration> {
        self.idle_unload_after
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

/// Builder for [`EmbeddingConfig`]
#[derive(Debug, Clone)]
pub struct EmbeddingConfigBuilder {
    model: ModelDescriptor,
    output_dim: Option<usize>,
    batch_size: usize,
    cache_capacity: usize,
    request_timeout: Duration,
    idle_unload_after: Option<Duration>,
    queue_capacity: usize,
}

impl EmbeddingConfigBuilder {
    pub fn new(model: ModelDescriptor) -> Self {
        Self {
            model,
            output_dim: None,
            batch_size: DEFAULT_BATCH_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_unload_after: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn output_dim(mut self, dim: usize) -> Self {
        self.output_dim = Some(dim);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Zero disables caching
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `None` keeps the model loaded forever
    pub fn idle_unload_after(mut self, idle: Option<Duration>) -> Self {
        self.idle_unload_after = idle;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Validate and produce the configuration
    pub fn build(self) -> EmbeddingResult<EmbeddingConfig> {
        let model = self.model;

        if model.native_dim == 0 {
            return Err(EmbeddingError::config(format!(
                "Model '{}' declares a zero native dimension",
                model.name
            )));
        }

        if let Some(dim) = self.output_dim {
            if dim == 0 {
                return Err(EmbeddingError::config("Output dimension must be positive"));
            }
            if dim > model.native_dim {
                return Err(EmbeddingError::config(format!(
                    "Output dimension {} exceeds native dimension {} of model '{}'",
                    dim, model.native_dim, model.name
                )));
            }
            if !model.accepts_output_dim(dim) {
                return Err(EmbeddingError::config(format!(
                    "Model '{}' does not support MRL truncation; output dimension must be {} (got {})",
                    model.name, model.native_dim, dim
                )));
            }
        }

        if self.batch_size == 0 {
            return Err(EmbeddingError::config("Batch size must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(EmbeddingError::config("Queue capacity must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(EmbeddingError::config("Request timeout must be positive"));
        }
        if self.idle_unload_after.is_some_and(|idle| idle.is_zero()) {
            return Err(EmbeddingError::config(
                "Idle unload threshold must be positive (omit it to never unload)",
            ));
        }

        Ok(EmbeddingConfig {
            model,
            output_dim: self.output_dim,
            batch_size: self.batch_size,
            cache_capacity: self.cache_capacity,
            request_timeout: self.request_timeout,
            idle_unload_after: self.idle_unload_after,
            queue_capacity: self.queue_capacity,
        })
    }
}
