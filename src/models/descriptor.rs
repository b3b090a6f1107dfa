//! Model family descriptors
//!
//! A [`ModelDescriptor`] is the static description of one selectable model
//! family. Descriptors are never mutated; the built-in catalogue lives in
//! [`ModelDescriptor::ALL`].

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::models::EmbeddingError;

/// How per-token hidden states are reduced to one vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingStrategy {
    /// Hidden state of the last non-padding token (decoder models)
    LastToken,
    /// Average over all non-padding tokens (encoder models)
    MeanPooling,
}

/// Immutable description of a model family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    /// Short name used in configuration and as the cache identity
    pub name: &'static str,
    /// Human readable description
    pub description: &'static str,
    /// Dimension of the pooled hidden state
    pub native_dim: usize,
    /// Whether prefixes of the output stay meaningful after renormalization
    pub supports_mrl: bool,
    /// Pooling applied to the last hidden state
    pub pooling_strategy: PoolingStrategy,
    /// Tokenizer identity (HuggingFace repo id)
    pub tokenizer_id: &'static str,
    /// Weights identity (HuggingFace repo id)
    pub weights_id: &'static str,
    /// Token sequences are truncated to this length
    pub max_sequence_length: usize,
}

impl ModelDescriptor {
    pub const QWEN3: ModelDescriptor = ModelDescriptor {
        name: "qwen3",
        description: "Qwen3 Embedding 0.6B, 32K context decoder with MRL support",
        native_dim: 1024,
        supports_mrl: true,
        pooling_strategy: PoolingStrategy::LastToken,
        tokenizer_id: "Qwen/Qwen3-Embedding-0.6B",
        weights_id: "Qwen/Qwen3-Embedding-0.6B",
        max_sequence_length: 8192,
    };

    pub const GEMMA: ModelDescriptor = ModelDescriptor {
        name: "gemma",
        description: "EmbeddingGemma 300M, lighter alternative with MRL support",
        native_dim: 768,
        supports_mrl: true,
        pooling_strategy: PoolingStrategy::LastToken,
        tokenizer_id: "onnx-community/embeddinggemma-300m-ONNX",
        weights_id: "onnx-community/embeddinggemma-300m-ONNX",
        max_sequence_length: 2048,
    };

    pub const BGE_M3: ModelDescriptor = ModelDescriptor {
        name: "bge_m3",
        description: "BGE-M3 multilingual encoder",
        native_dim: 1024,
        supports_mrl: false,
        pooling_strategy: PoolingStrategy::MeanPooling,
        tokenizer_id: "BAAI/bge-m3",
        weights_id: "BAAI/bge-m3",
        max_sequence_length: 8192,
    };

    pub const NOMIC: ModelDescriptor = ModelDescriptor {
        name: "nomic",
        description: "Nomic Embed Text v1.5, long-context BERT-compatible encoder",
        native_dim: 768,
        supports_mrl: false,
        pooling_strategy: PoolingStrategy::MeanPooling,
        tokenizer_id: "nomic-ai/nomic-embed-text-v1.5",
        weights_id: "nomic-ai/nomic-embed-text-v1.5",
        max_sequence_length: 8192,
    };

    pub const E5_MULTI: ModelDescriptor = ModelDescriptor {
        name: "e5_multi",
        description: "Multilingual E5 base",
        native_dim: 768,
        supports_mrl: false,
        pooling_strategy: PoolingStrategy::MeanPooling,
        tokenizer_id: "intfloat/multilingual-e5-base",
        weights_id: "intfloat/multilingual-e5-base",
        max_sequence_length: 512,
    };

    pub const E5_SMALL: ModelDescriptor = ModelDescriptor {
        name: "e5_small",
        description: "Multilingual E5 small, fastest and smallest",
        native_dim: 384,
        supports_mrl: false,
        pooling_strategy: PoolingStrategy::MeanPooling,
        tokenizer_id: "intfloat/multilingual-e5-small",
        weights_id: "intfloat/multilingual-e5-small",
        max_sequence_length: 512,
    };

    /// Deterministic, weight-free backend for development and tests
    pub const MOCK: ModelDescriptor = ModelDescriptor {
        name: "mock",
        description: "Deterministic hash-based model, no weights required",
        native_dim: 384,
        supports_mrl: true,
        pooling_strategy: PoolingStrategy::MeanPooling,
        tokenizer_id: "mock",
        weights_id: "mock",
        max_sequence_length: 512,
    };

    /// Built-in catalogue
    pub const ALL: [ModelDescriptor; 7] = [
        Self::QWEN3,
        Self::GEMMA,
        Self::BGE_M3,
        Self::NOMIC,
        Self::E5_MULTI,
        Self::E5_SMALL,
        Self::MOCK,
    ];

    /// Look up a built-in descriptor by name or alias.
    pub fn by_name(name: &str) -> Option<ModelDescriptor> {
        let normalized = name.trim().to_lowercase().replace('-', "_");
        let canonical = match normalized.as_str() {
            "e5_base" => "e5_multi",
            "bge" => "bge_m3",
            other => other,
        };
        Self::ALL.iter().copied().find(|d| d.name == canonical)
    }

    /// Whether `dim` is an acceptable output dimension for this model.
    pub fn accepts_output_dim(&self, dim: usize) -> bool {
        if dim == 0 || dim > self.native_dim {
            return false;
        }
        self.supports_mrl || dim == self.native_dim
    }
}

impl Default for ModelDescriptor {
    fn default() -> Self {
        Self::QWEN3
    }
}

impl FromStr for ModelDescriptor {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::by_name(s).ok_or_else(|| {
            let known: Vec<&str> = Self::ALL.iter().map(|d| d.name).collect();
            EmbeddingError::config(format!(
                "Unknown model: {} (expected one of: {})",
                s,
                known.join(", ")
            ))
        })
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
