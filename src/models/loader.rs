//! Model loading seam
//!
//! The worker asks a [`ModelLoader`] for a fresh [`InferenceEngine`] every time
//! it transitions from unloaded to loaded. Where the weights come from
//! (download, on-disk cache) is the loader's business.

use async_trait::async_trait;

use crate::engine::InferenceEngine;
use crate::models::{EmbeddingResult, ModelDescriptor};

/// Produces loaded inference engines for a model descriptor
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Load tokenizer and weights for `descriptor`
    async fn load(&self, descriptor: &ModelDescriptor) -> EmbeddingResult<InferenceEngine>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}
