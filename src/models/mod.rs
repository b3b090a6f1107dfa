//! Model descriptions, configuration and the shared error type
//!
//! Everything in here is plain data: which model families exist, how a
//! server instance is configured, and how failures are reported.

pub mod config;
pub mod descriptor;
pub mod loader;

// Re-exports
pub use config::{EmbeddingConfig, EmbeddingConfigBuilder};
pub use descriptor::{ModelDescriptor, PoolingStrategy};
pub use loader::ModelLoader;

use std::sync::Arc;

/// Embedding vector type
pub type Embedding = Vec<f32>;

/// Result type for embedding operations
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Errors that can occur while configuring or serving embeddings
///
/// The type is `Clone` so a single batch-wide failure can be delivered to
/// every request that was part of the batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Input text produced no tokens")]
    EmptyInput,

    #[error("Inference failed: {model_name} - {error}")]
    ComputeError { model_name: String, error: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Embedding worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },

    #[error("Model loading failed: {model_name} - {error}")]
    ModelLoadFailed { model_name: String, error: String },

    #[error("IO error: {error}")]
    IoError { error: Arc<std::io::Error> },

    #[error("TOML parsing error: {error}")]
    TomlError { error: toml::de::Error },
}

/// Fieldless classification of [`EmbeddingError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    EmptyInput,
    Compute,
    Timeout,
    WorkerUnavailable,
    ModelLoad,
}

impl EmbeddingError {
    pub fn config(message: impl Into<String>) -> Self {
        EmbeddingError::ConfigError { message: message.into() }
    }

    pub fn compute(model_name: impl Into<String>, error: impl ToString) -> Self {
        EmbeddingError::ComputeError {
            model_name: model_name.into(),
            error: error.to_string(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        EmbeddingError::WorkerUnavailable { reason: reason.into() }
    }

    /// Which category this failure belongs to.
    ///
    /// File-level errors only ever surface while building configuration, so
    /// they classify as configuration errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbeddingError::ConfigError { .. }
            | EmbeddingError::IoError { .. }
            | EmbeddingError::TomlError { .. } => ErrorKind::Configuration,
            EmbeddingError::EmptyInput => ErrorKind::EmptyInput,
            EmbeddingError::ComputeError { .. } => ErrorKind::Compute,
            EmbeddingError::Timeout { .. } => ErrorKind::Timeout,
            EmbeddingError::WorkerUnavailable { .. } => ErrorKind::WorkerUnavailable,
            EmbeddingError::ModelLoadFailed { .. } => ErrorKind::ModelLoad,
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::WorkerUnavailable | ErrorKind::ModelLoad
        )
    }
}

impl From<std::io::Error> for EmbeddingError {
    fn from(error: std::io::Error) -> Self {
        EmbeddingError::IoError { error: Arc::new(error) }
    }
}

impl From<toml::de::Error> for EmbeddingError {
    fn from(error: toml::de::Error) -> Self {
        EmbeddingError::TomlError { error }
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for EmbeddingError {
    fn from(error: ort::Error) -> Self {
        EmbeddingError::ModelLoadFailed {
            model_name: "onnx".to_string(),
            error: error.to_string(),
        }
    }
}
