//! Inference engine
//!
//! Turns a batch of texts into embeddings: tokenize, one padded forward pass,
//! pool according to the model family, then apply MRL truncation and L2
//! normalization. The engine is driven exclusively by the worker and is never
//! shared.
//!
//! The tokenizer and the tensor runtime sit behind the [`TextTokenizer`] and
//! [`ForwardPass`] traits so the same pipeline runs over ONNX Runtime or the
//! deterministic mock backend.

pub mod mock;
pub mod pooling;

pub use mock::MockModelLoader;

use ndarray::{Array2, Array3};
use tracing::{debug, instrument};

use crate::models::{Embedding, EmbeddingError, EmbeddingResult, ModelDescriptor};

/// Text to token ids
pub trait TextTokenizer: Send {
    /// Token ids for `text`, including whatever special tokens the model expects.
    ///
    /// Tokenizers that add special tokens should truncate before adding them;
    /// the engine's own cut at `max_sequence_length` is a last resort that
    /// keeps only the leading ids.
    ///
    /// Fails with [`EmbeddingError::EmptyInput`] when the text contains no
    /// content tokens.
    fn encode(&self, text: &str) -> EmbeddingResult<Vec<u32>>;

    /// Id used to right-pad shorter sequences
    fn pad_id(&self) -> u32;
}

/// Tensor runtime producing per-token hidden states
pub trait ForwardPass: Send {
    /// Hidden states shaped `[batch, seq_len, hidden]`
    fn forward(&mut self, batch: &TokenBatch) -> EmbeddingResult<Array3<f32>>;
}

/// Right-padded token batch
#[derive(Debug, Clone)]
pub struct TokenBatch {
    /// `[batch, seq_len]`
    pub input_ids: Array2<i64>,
    /// `[batch, seq_len]`, 1 for real tokens and 0 for padding
    pub attention_mask: Array2<i64>,
    /// Number of real tokens per row
    pub lengths: Vec<usize>,
}

impl TokenBatch {
    /// Pad `sequences` to the longest one
    pub fn from_sequences(sequences: &[Vec<u32>], pad_id: u32) -> Self {
        let rows = sequences.len();
        let seq_len = sequences.iter().map(Vec::len).max().unwrap_or(0);

        let mut input_ids = Array2::from_elem((rows, seq_len), pad_id as i64);
        let mut attention_mask = Array2::zeros((rows, seq_len));
        let mut lengths = Vec::with_capacity(rows);

        for (row, ids) in sequences.iter().enumerate() {
            for (col, &id) in ids.iter().enumerate() {
                input_ids[[row, col]] = id as i64;
                attention_mask[[row, col]] = 1;
            }
            lengths.push(ids.len());
        }

        Self {
            input_ids,
            attention_mask,
            lengths,
        }
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Padded sequence length
    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }
}

/// A loaded model ready to compute embeddings
pub struct InferenceEngine {
    descriptor: ModelDescriptor,
    tokenizer: Box<dyn TextTokenizer>,
    runtime: Box<dyn ForwardPass>,
}

impl InferenceEngine {
    pub fn new(
        descriptor: ModelDescriptor,
        tokenizer: Box<dyn TextTokenizer>,
        runtime: Box<dyn ForwardPass>,
    ) -> Self {
        Self {
            descriptor,
            tokenizer,
            runtime,
        }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    /// Compute embeddings for `texts`, truncated to `effective_dim`.
    ///
    /// The outer result fails only when the whole batch fails (runtime error,
    /// unexpected output shape). Per-item failures such as empty input are
    /// reported in the inner results, in input order, and never affect the
    /// other items.
    #[instrument(skip(self, texts), fields(model = self.descriptor.name, batch_size = texts.len()))]
    pub fn compute(
        &mut self,
        texts: &[String],
        effective_dim: usize,
    ) -> EmbeddingResult<Vec<EmbeddingResult<Embedding>>> {
        let descriptor = self.descriptor;
        if !descriptor.accepts_output_dim(effective_dim) {
            return Err(EmbeddingError::config(format!(
                "Model '{}' cannot produce {}-dimensional embeddings",
                descriptor.name, effective_dim
            )));
        }

        let tokenized: Vec<EmbeddingResult<Vec<u32>>> = texts
            .iter()
            .map(|text| {
                let mut ids = self.tokenizer.encode(text)?;
                if ids.is_empty() {
                    return Err(EmbeddingError::EmptyInput);
                }
                ids.truncate(descriptor.max_sequence_length);
                Ok(ids)
            })
            .collect();

        let sequences: Vec<Vec<u32>> = tokenized
            .iter()
            .filter_map(|t| t.as_ref().ok().cloned())
            .collect();

        if sequences.is_empty() {
            debug!("No tokenizable inputs in batch, skipping forward pass");
            return Ok(tokenized.into_iter().map(|t| t.map(|_| Vec::new())).collect());
        }

        let batch = TokenBatch::from_sequences(&sequences, self.tokenizer.pad_id());
        let hidden = self.runtime.forward(&batch)?;

        let (rows, seq_len, hidden_size) = hidden.dim();
        if rows != batch.len() || seq_len < batch.seq_len() || hidden_size != descriptor.native_dim {
            return Err(EmbeddingError::compute(
                descriptor.name,
                format!(
                    "Unexpected hidden state shape [{}, {}, {}], expected [{}, {}, {}]",
                    rows,
                    seq_len,
                    hidden_size,
                    batch.len(),
                    batch.seq_len(),
                    descriptor.native_dim
                ),
            ));
        }

        let pooled = pooling::pool(hidden.view(), &batch.lengths, descriptor.pooling_strategy);
        let mut pooled_rows = pooled.rows().into_iter();

        let results: Vec<EmbeddingResult<Embedding>> = tokenized
            .into_iter()
            .map(|t| {
                t?;
                let row = pooled_rows
                    .next()
                    .ok_or_else(|| EmbeddingError::compute(descriptor.name, "Missing pooled row"))?;
                pooling::truncate_and_normalize(row.to_vec(), effective_dim).ok_or_else(|| {
                    EmbeddingError::compute(descriptor.name, "Cannot normalize zero vector")
                })
            })
            .collect();

        debug!(
            computed = sequences.len(),
            rejected = texts.len() - sequences.len(),
            "Batch computed"
        );
        Ok(results)
    }
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("model", &self.descriptor.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockForwardPass, MockTokenizer};
    use crate::models::{ErrorKind, PoolingStrategy};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn engine(descriptor: ModelDescriptor) -> InferenceEngine {
        InferenceEngine::new(
            descriptor,
            Box::new(MockTokenizer),
            Box::new(MockForwardPass::new(
                descriptor.native_dim,
                Arc::new(AtomicUsize::new(0)),
            )),
        )
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_token_batch_padding() {
        let batch = TokenBatch::from_sequences(&[vec![5, 6, 7], vec![9]], 0);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.seq_len(), 3);
        assert_eq!(batch.lengths, vec![3, 1]);
        assert_eq!(batch.input_ids.row(1).to_vec(), vec![9, 0, 0]);
        assert_eq!(batch.attention_mask.row(1).to_vec(), vec![1, 0, 0]);
    }

    #[test]
    fn test_compute_native_dim_normalized() {
        let mut engine = engine(ModelDescriptor::QWEN3);
        let out = engine.compute(&texts(&["hello world"]), 1024).unwrap();
        let v = out[0].as_ref().unwrap();
        assert_eq!(v.len(), 1024);
        assert!((norm(v) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_input_isolated() {
        let mut engine = engine(ModelDescriptor::MOCK);
        let out = engine
            .compute(&texts(&["first text", "", "   ", "second text"]), 384)
            .unwrap();
        assert_eq!(out.len(), 4);
        assert!(out[0].is_ok());
        assert_eq!(out[1].as_ref().unwrap_err().kind(), ErrorKind::EmptyInput);
        assert_eq!(out[2].as_ref().unwrap_err().kind(), ErrorKind::EmptyInput);
        assert!(out[3].is_ok());
    }

    #[test]
    fn test_batching_does_not_change_results() {
        let mut engine = engine(ModelDescriptor::QWEN3);
        let alone = engine.compute(&texts(&["a short one"]), 1024).unwrap();
        let together = engine
            .compute(&texts(&["a much longer sentence with many words", "a short one"]), 1024)
            .unwrap();
        let a = alone[0].as_ref().unwrap();
        let b = together[1].as_ref().unwrap();
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mrl_prefix_stability() {
        let mut engine = engine(ModelDescriptor::QWEN3);
        let input = texts(&["matryoshka embeddings nest"]);
        let wide = engine.compute(&input, 512).unwrap().remove(0).unwrap();
        let narrow = engine.compute(&input, 128).unwrap().remove(0).unwrap();

        let rederived = pooling::truncate_and_normalize(wide[..128].to_vec(), 128).unwrap();
        assert_eq!(narrow.len(), 128);
        for (x, y) in narrow.iter().zip(&rederived) {
            assert!((x - y).abs() < 1e-5);
        }
        assert!((norm(&narrow) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_truncation_on_non_mrl_rejected() {
        let mut engine = engine(ModelDescriptor::E5_SMALL);
        let err = engine.compute(&texts(&["text"]), 128).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_last_token_ignores_padding() {
        let descriptor = ModelDescriptor {
            pooling_strategy: PoolingStrategy::LastToken,
            ..ModelDescriptor::MOCK
        };
        let mut engine = engine(descriptor);
        let alone = engine.compute(&texts(&["two words"]), 384).unwrap();
        let padded = engine
            .compute(&texts(&["two words", "this one is considerably longer than two"]), 384)
            .unwrap();
        assert_eq!(alone[0].as_ref().unwrap(), padded[0].as_ref().unwrap());
    }

    #[test]
    fn test_long_input_truncated() {
        let descriptor = ModelDescriptor {
            max_sequence_length: 4,
            ..ModelDescriptor::MOCK
        };
        let mut engine = engine(descriptor);
        let out = engine
            .compute(&texts(&["one two three four", "one two three four five six"]), 384)
            .unwrap();
        assert_eq!(out[0].as_ref().unwrap(), out[1].as_ref().unwrap());
    }
}
