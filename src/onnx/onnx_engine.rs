//! # ONNX Embedding Backend
//!
//! Runs embedding models exported to ONNX through ONNX Runtime, with
//! HuggingFace `tokenizers` for preprocessing.
//!
//! ## Layout
//!
//! Weight download is not done here. The loader expects files that were
//! already fetched into a local model directory, one sub-directory per
//! HuggingFace repo id:
//!
//! ```text
//! <model_dir>/Qwen/Qwen3-Embedding-0.6B/model.onnx        (or onnx/model.onnx)
//! <model_dir>/Qwen/Qwen3-Embedding-0.6B/tokenizer.json
//! ```
//!
//! Decoder exports must be the plain feature-extraction graph (no
//! `past_key_values` inputs).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokenizers::{Tokenizer, TruncationParams};

use crate::engine::TextTokenizer;
use crate::models::{EmbeddingError, EmbeddingResult};

/// Configuration for ONNX Runtime
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OnnxConfig {
    /// Path to the ONNX Runtime library (DLL/so/dylib); empty keeps the default lookup
    pub library_path: String,
    /// Thread pool size for inference
    pub thread_pool_size: usize,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            library_path: String::new(),
            thread_pool_size: 4,
        }
    }
}

/// HuggingFace tokenizer
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    pad_id: u32,
}

impl HfTokenizer {
    /// Load `tokenizer.json`, truncating encodings to `max_length` tokens.
    ///
    /// Truncation happens before the post-processor adds special tokens, so
    /// a trailing end-of-sequence token survives on long inputs.
    pub fn from_file(path: &Path, max_length: usize) -> EmbeddingResult<Self> {
        let load_error = |error: String| EmbeddingError::ModelLoadFailed {
            model_name: path.display().to_string(),
            error,
        };

        let mut tokenizer = Tokenizer::from_file(path)
            .map_err(|e| load_error(format!("Failed to load tokenizer: {}", e)))?;

        let pad_id = tokenizer
            .get_padding()
            .map(|padding| padding.pad_id)
            .or_else(|| tokenizer.token_to_id("<pad>"))
            .or_else(|| tokenizer.token_to_id("[PAD]"))
            .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
            .unwrap_or(0);

        // Padding is applied per batch by the engine
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| load_error(format!("Invalid truncation settings: {}", e)))?;

        Ok(Self { tokenizer, pad_id })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> EmbeddingResult<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbeddingError::compute("tokenizer", format!("Tokenization failed: {}", e)))?;

        // Special tokens alone ([CLS] [SEP], <|endoftext|>) are not content
        let content_tokens = encoding
            .get_special_tokens_mask()
            .iter()
            .filter(|&&special| special == 0)
            .count();
        if content_tokens == 0 {
            return Err(EmbeddingError::EmptyInput);
        }

        Ok(encoding.get_ids().to_vec())
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

/// Resolve the ONNX graph for a repo directory
#[cfg_attr(not(feature = "onnx"), allow(dead_code))]
fn find_model_file(repo_dir: &Path) -> Option<PathBuf> {
    [repo_dir.join("model.onnx"), repo_dir.join("onnx").join("model.onnx")]
        .into_iter()
        .find(|candidate| candidate.is_file())
}

#[cfg(feature = "onnx")]
pub use runtime::{OnnxForwardPass, OnnxModelLoader};

#[cfg(feature = "onnx")]
mod runtime {
    use super::*;

    use async_trait::async_trait;
    use tracing::{debug, info};
    use ndarray::{Array3, ArrayView3};
    use ort::session::{builder::GraphOptimizationLevel, Session};
    use ort::value::Tensor;

    use crate::engine::{ForwardPass, InferenceEngine, TokenBatch};
    use crate::models::{ModelDescriptor, ModelLoader};

    /// ONNX Runtime session producing `last_hidden_state`
    pub struct OnnxForwardPass {
        session: Session,
        model_name: &'static str,
        input_names: Vec<String>,
        output_name: String,
    }

    impl OnnxForwardPass {
        /// Create a session from a model file
        pub fn from_file(
            model_path: &Path,
            descriptor: &ModelDescriptor,
            onnx_config: &OnnxConfig,
        ) -> EmbeddingResult<Self> {
            info!(
                "Initializing ONNX session for {} from {}",
                descriptor.name,
                model_path.display()
            );

            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(onnx_config.thread_pool_size)?
                .commit_from_file(model_path)
                .map_err(|e| EmbeddingError::ModelLoadFailed {
                    model_name: descriptor.name.to_string(),
                    error: format!("Failed to load ONNX model: {}", e),
                })?;

            let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
            let output_name = session
                .outputs
                .iter()
                .map(|o| o.name.clone())
                .find(|name| name == "last_hidden_state")
                .or_else(|| session.outputs.first().map(|o| o.name.clone()))
                .ok_or_else(|| EmbeddingError::ModelLoadFailed {
                    model_name: descriptor.name.to_string(),
                    error: "ONNX model declares no outputs".to_string(),
                })?;

            debug!(inputs = ?input_names, output = %output_name, "ONNX session ready");

            Ok(Self {
                session,
                model_name: descriptor.name,
                input_names,
                output_name,
            })
        }

        fn input_data(&self, name: &str, batch: &TokenBatch) -> EmbeddingResult<Vec<i64>> {
            let (rows, seq_len) = batch.input_ids.dim();
            match name {
                "input_ids" => Ok(batch.input_ids.iter().copied().collect()),
                "attention_mask" => Ok(batch.attention_mask.iter().copied().collect()),
                "token_type_ids" => Ok(vec![0i64; rows * seq_len]),
                "position_ids" => Ok((0..rows).flat_map(|_| 0..seq_len as i64).collect()),
                other => Err(EmbeddingError::compute(
                    self.model_name,
                    format!("Unsupported model input '{}'", other),
                )),
            }
        }
    }

    impl ForwardPass for OnnxForwardPass {
        fn forward(&mut self, batch: &TokenBatch) -> EmbeddingResult<Array3<f32>> {
            let (rows, seq_len) = batch.input_ids.dim();
            let shape = [rows as i64, seq_len as i64];

            let mut inputs: Vec<(String, Tensor<i64>)> = Vec::with_capacity(self.input_names.len());
            for name in &self.input_names {
                let data = self.input_data(name, batch)?;
                let tensor = Tensor::from_array((shape, data)).map_err(|e| {
                    EmbeddingError::compute(
                        self.model_name,
                        format!("Failed to create {} tensor: {}", name, e),
                    )
                })?;
                inputs.push((name.clone(), tensor));
            }

            let model_name = self.model_name;
            let outputs = self
                .session
                .run(inputs)
                .map_err(|e| EmbeddingError::compute(model_name, format!("ONNX inference failed: {}", e)))?;

            let (out_shape, data) = outputs[self.output_name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    EmbeddingError::compute(model_name, format!("Failed to extract output tensor: {}", e))
                })?;

            let dims: Vec<usize> = out_shape.iter().map(|&x| x as usize).collect();
            if dims.len() != 3 {
                return Err(EmbeddingError::compute(
                    model_name,
                    format!("Expected 3D output tensor, got {}D", dims.len()),
                ));
            }

            let view = ArrayView3::from_shape((dims[0], dims[1], dims[2]), data).map_err(|e| {
                EmbeddingError::compute(model_name, format!("Failed to create output array view: {:?}", e))
            })?;
            Ok(view.to_owned())
        }
    }

    /// Loads ONNX models from a local model directory
    #[derive(Debug, Clone)]
    pub struct OnnxModelLoader {
        model_dir: PathBuf,
        onnx_config: OnnxConfig,
    }

    impl OnnxModelLoader {
        pub fn new(model_dir: impl Into<PathBuf>, onnx_config: OnnxConfig) -> Self {
            Self {
                model_dir: model_dir.into(),
                onnx_config,
            }
        }

        fn load_blocking(&self, descriptor: &ModelDescriptor) -> EmbeddingResult<InferenceEngine> {
            let not_found = |what: &str, path: &Path| EmbeddingError::ModelLoadFailed {
                model_name: descriptor.name.to_string(),
                error: format!("{} not found at {} (download it first)", what, path.display()),
            };

            let weights_dir = self.model_dir.join(descriptor.weights_id);
            let model_path =
                find_model_file(&weights_dir).ok_or_else(|| not_found("model.onnx", &weights_dir))?;

            let tokenizer_path = self.model_dir.join(descriptor.tokenizer_id).join("tokenizer.json");
            if !tokenizer_path.is_file() {
                return Err(not_found("tokenizer.json", &tokenizer_path));
            }

            if !self.onnx_config.library_path.is_empty() {
                unsafe {
                    std::env::set_var("ORT_DYLIB_PATH", &self.onnx_config.library_path);
                }
                debug!("Set ORT_DYLIB_PATH to: {}", self.onnx_config.library_path);
            }

            let runtime = OnnxForwardPass::from_file(&model_path, descriptor, &self.onnx_config)?;
            let tokenizer = HfTokenizer::from_file(&tokenizer_path, descriptor.max_sequence_length)?;

            info!(
                "ONNX model {} loaded with {} threads",
                descriptor.name, self.onnx_config.thread_pool_size
            );
            Ok(InferenceEngine::new(*descriptor, Box::new(tokenizer), Box::new(runtime)))
        }
    }

    #[async_trait]
    impl ModelLoader for OnnxModelLoader {
        async fn load(&self, descriptor: &ModelDescriptor) -> EmbeddingResult<InferenceEngine> {
            self.load_blocking(descriptor)
        }

        fn name(&self) -> &'static str {
            "onnx"
        }
    }
}
