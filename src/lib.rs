//! MRL Embedding Server Library
//!
//! Local embedding inference: one worker owns the model, callers share an
//! LRU cache, and vectors can be truncated to a smaller Matryoshka dimension.

pub mod engine;
pub mod models;
pub mod onnx;
pub mod protocol;
pub mod server;
pub mod service;

// Re-exports
pub use engine::{InferenceEngine, MockModelLoader};
pub use models::{
    Embedding, EmbeddingConfig, EmbeddingError, EmbeddingResult, ErrorKind, ModelDescriptor,
    ModelLoader, PoolingStrategy,
};
pub use server::{start_hyper_http_server, ServerConfig};
pub use service::{EmbeddingService, HealthStatus, ServiceStats, WorkerStatus};

#[cfg(feature = "onnx")]
pub use onnx::OnnxModelLoader;
